//! Liveness and metrics endpoints.

use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = &state.config;
    let relay = state.relay.stats();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": error_rate(&metrics),
            "active_connections": metrics.active_connections
        },
        "relay": {
            "active_streams": relay.active_streams,
            "model": config.upstream.model,
            "pacing_enabled": config.playback.enabled,
            "batch_threshold": config.relay.batch_threshold
        },
        "memory": get_memory_info(),
        "system": get_system_status(&metrics, relay.active_streams)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": error_rate(&metrics),
            "active_connections": metrics.active_connections,
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "relay": state.relay.stats(),
        "memory": get_memory_info()
    }))
}

fn error_rate(metrics: &AppMetrics) -> f64 {
    if metrics.request_count > 0 {
        metrics.error_count as f64 / metrics.request_count as f64
    } else {
        0.0
    }
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", process::id())) {
            let field = |name: &str| -> u64 {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024
            };

            return json!({
                "resident_memory_bytes": field("VmRSS:"),
                "virtual_memory_bytes": field("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": format!("Memory info not available (pid {})", process::id())
    })
}

/// Streams and sockets should pair up; a gap means sockets are open without
/// a started stream or streams outlived their socket.
fn get_system_status(metrics: &AppMetrics, active_streams: usize) -> serde_json::Value {
    let connections = metrics.active_connections as usize;
    let status = if active_streams > connections {
        "degraded"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "active_connections": connections,
        "active_streams": active_streams,
        "idle_connections": connections.saturating_sub(active_streams)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_state;
    use actix_web::test::{call_and_read_body_json, init_service, TestRequest};
    use actix_web::App;

    #[actix_web::test]
    async fn test_health_reports_relay() {
        let app = init_service(
            App::new()
                .app_data(web::Data::new(test_state()))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["relay"]["active_streams"], 0);
        assert_eq!(body["relay"]["batch_threshold"], 50);
    }

    #[actix_web::test]
    async fn test_metrics_include_relay_counters() {
        let app = init_service(
            App::new()
                .app_data(web::Data::new(test_state()))
                .route("/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let req = TestRequest::get().uri("/metrics").to_request();
        let body: serde_json::Value = call_and_read_body_json(&app, req).await;

        assert_eq!(body["relay"]["frames_received"], 0);
        assert!(body["endpoints"].is_array());
    }

    #[test]
    fn test_system_status_flags_orphaned_streams() {
        let metrics = AppMetrics::default();
        assert_eq!(get_system_status(&metrics, 1)["status"], "degraded");
        assert_eq!(get_system_status(&metrics, 0)["status"], "normal");
    }
}
