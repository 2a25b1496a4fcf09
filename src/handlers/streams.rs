//! Introspection and control of active streams.

use crate::error::{AppResult, RelayError};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

/// GET /api/v1/streams
pub async fn list_streams(state: web::Data<AppState>) -> HttpResponse {
    let streams = state.relay.stream_summaries();
    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": streams.len(),
        "streams": streams
    }))
}

/// GET /api/v1/streams/{stream_id}
pub async fn get_stream(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let stream_id = path.into_inner();
    let session = state
        .relay
        .sessions()
        .get(&stream_id)
        .ok_or(RelayError::UnknownStream(stream_id))?;
    Ok(HttpResponse::Ok().json(session.summary()))
}

/// DELETE /api/v1/streams/{stream_id}
///
/// Same teardown as a `stop` event: the upstream link is disconnected and the
/// caller's socket is closed.
pub async fn close_stream(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let stream_id = path.into_inner();
    if !state.relay.close_stream(&stream_id).await {
        return Err(RelayError::UnknownStream(stream_id).into());
    }

    info!(stream_id = %stream_id, "Stream closed via API");
    Ok(HttpResponse::Ok().json(json!({
        "status": "closed",
        "stream_id": stream_id
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_state;
    use actix_web::{http::StatusCode, test, App};

    #[actix_web::test]
    async fn test_stream_routes_without_streams() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(test_state()))
                .route("/streams", web::get().to(list_streams))
                .route("/streams/{stream_id}", web::get().to(get_stream))
                .route("/streams/{stream_id}", web::delete().to(close_stream)),
        )
        .await;

        let req = test::TestRequest::get().uri("/streams").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["count"], 0);

        let req = test::TestRequest::get().uri("/streams/MZ404").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::delete().uri("/streams/MZ404").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
