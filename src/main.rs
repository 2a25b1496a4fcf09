//! # Voice Relay Backend - Main Application Entry Point
//!
//! Bridges live phone calls to a realtime AI voice model. The telephony
//! provider fetches TwiML from `/api/voice`, then streams the call's audio
//! over the `/stream` WebSocket; the relay converts and forwards it to Gemini
//! Live and plays the model's speech back into the call.
//!
//! ## Application Architecture:
//! - **audio**: Format conversion (μ-law, PCM, resampling) and playback pacing
//! - **telephony**: Provider signaling events, outbound messages, TwiML
//! - **upstream**: The AI voice service link (Gemini Live over WebSocket)
//! - **relay**: Session table and the per-stream state machine
//! - **websocket**: The actor that owns each telephony socket
//! - **config / state / health / middleware / handlers / error**: the HTTP service around it

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod relay;
mod state;
mod telephony;
mod upstream;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use config::AppConfig;
use relay::{RelaySettings, StreamRelay};
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upstream::gemini::GeminiConnector;

/// Set once SIGTERM or SIGINT arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load().context("failed to load configuration")?;
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e.into());
    }

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        model = %config.upstream.model,
        batch_threshold = config.relay.batch_threshold,
        pacing = config.playback.enabled,
        "Configuration loaded: {}:{}",
        config.server.host,
        config.server.port
    );

    let connector = GeminiConnector::new(config.upstream.clone());
    let relay = Arc::new(StreamRelay::new(connector, RelaySettings::from_config(&config)));
    let app_state = AppState::new(config.clone(), relay.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/streams", web::get().to(handlers::list_streams))
                    .route("/streams/{stream_id}", web::get().to(handlers::get_stream))
                    .route("/streams/{stream_id}", web::delete().to(handlers::close_stream)),
            )
            .route("/api/voice", web::post().to(handlers::incoming_call))
            .route("/stream", web::get().to(websocket::telephony_websocket))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)
    .with_context(|| format!("failed to bind {}", bind_addr))?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    let open_streams = relay.active_streams();
    if open_streams > 0 {
        info!(open_streams, "Closing remaining streams");
    }
    relay.close_all().await;

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` overrides the default filter.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_relay_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Flip [`SHUTDOWN_SIGNAL`] on SIGTERM or SIGINT.
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
