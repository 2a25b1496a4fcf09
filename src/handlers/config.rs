use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// GET /api/v1/config, with credentials masked.
pub async fn get_config(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": state.config.redacted()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_config_is_redacted() {
        let mut state = test_state();
        let mut config = (*state.config).clone();
        config.upstream.api_key = "AIzaSuperSecretKey9876".to_string();
        state.config = std::sync::Arc::new(config);

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/config", web::get().to(get_config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["config"]["upstream"]["api_key"], "****9876");
        assert_eq!(body["config"]["relay"]["batch_threshold"], 50);
    }
}
