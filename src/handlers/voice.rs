//! Voice webhook: answers an incoming call with TwiML that connects the
//! call's audio to the `/stream` WebSocket.

use crate::state::AppState;
use crate::telephony::twiml;
use actix_web::{web, HttpRequest, HttpResponse};
use tracing::{error, info};

const FAILURE_MESSAGE: &str = "Sorry, we could not connect your call. Please try again later.";

/// POST /api/voice
pub async fn incoming_call(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    let telephony = &state.config.telephony;
    let host = telephony
        .public_host
        .clone()
        .filter(|host| !host.trim().is_empty())
        .unwrap_or_else(|| req.connection_info().host().to_string());

    let body = if host.trim().is_empty() {
        error!("Cannot build stream URL: no public host configured and no Host header");
        twiml::failure(FAILURE_MESSAGE)
    } else {
        let stream_url = twiml::stream_url(&host);
        info!(stream_url = %stream_url, "Answering incoming call");
        twiml::connect_stream(Some(&telephony.greeting), &stream_url)
    };

    HttpResponse::Ok().content_type("text/xml").body(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_twiml_uses_request_host() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(test_state()))
                .route("/api/voice", web::post().to(incoming_call)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/voice")
            .insert_header(("host", "relay.example.com"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.headers().get("content-type").unwrap(), "text/xml");

        let body = String::from_utf8(test::read_body(resp).await.to_vec()).unwrap();
        assert!(body.contains(r#"<Stream url="wss://relay.example.com/stream"/>"#));
        assert!(body.contains("<Say>"));
    }

    #[actix_web::test]
    async fn test_twiml_prefers_public_host() {
        let mut state = test_state();
        let mut config = (*state.config).clone();
        config.telephony.public_host = Some("https://public.example.org".to_string());
        state.config = std::sync::Arc::new(config);

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/api/voice", web::post().to(incoming_call)),
        )
        .await;

        let req = test::TestRequest::post().uri("/api/voice").to_request();
        let body = test::call_and_read_body(&app, req).await;
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("wss://public.example.org/stream"));
    }
}
