//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor through
//! `web::Data`. There are no process-wide singletons: the relay and its
//! session table are built once in `main` and reach handlers only from here.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Many handlers hold the same relay and config at once
//! - **Memory safety**: Dropped when the last worker lets go
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Metrics are read by the metrics endpoint and written by middleware
//! - **parking_lot**: Guards are returned directly; no poisoning to unwrap

use crate::config::AppConfig;
use crate::relay::StreamRelay;
use crate::upstream::gemini::GeminiConnector;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// The relay as deployed: backed by Gemini Live.
pub type Relay = StreamRelay<GeminiConnector>;

/// The main application state that's shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Loaded and validated at startup; read-only afterwards
    pub config: Arc<AppConfig>,

    /// HTTP and connection metrics, updated by middleware and the socket actor
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,

    /// Stream relay shared by every telephony connection
    pub relay: Arc<Relay>,
}

/// Metrics collected across all HTTP requests and telephony sockets.
///
/// ## What these track:
/// - **request_count**: Total requests processed (for load monitoring)
/// - **error_count**: Total errors (for reliability monitoring)
/// - **active_connections**: Telephony sockets currently open
/// - **endpoint_metrics**: Per-endpoint statistics
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub active_connections: u32,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, relay: Arc<Relay>) -> Self {
        Self {
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            relay,
        }
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().request_count += 1;
    }

    /// Increment the total error counter (4xx and 5xx responses).
    pub fn increment_error_count(&self) {
        self.metrics.write().error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// ## Parameters:
    /// - **endpoint**: Method and path (e.g., "GET /health", "POST /api/voice")
    /// - **duration_ms**: How long the request took to process
    /// - **is_error**: Whether this request resulted in an error
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// A telephony socket opened.
    pub fn connection_opened(&self) {
        self.metrics.write().active_connections += 1;
    }

    /// A telephony socket closed. Never drops below zero.
    pub fn connection_closed(&self) {
        let mut metrics = self.metrics.write();
        metrics.active_connections = metrics.active_connections.saturating_sub(1);
    }

    /// Copy of the current metrics, taken under one read lock.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time; 0.0 before the first request.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, from 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) fn test_state() -> AppState {
    use crate::relay::RelaySettings;

    let config = AppConfig::default();
    let relay = StreamRelay::new(
        GeminiConnector::new(config.upstream.clone()),
        RelaySettings::from_config(&config),
    );
    AppState::new(config, Arc::new(relay))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_metrics() {
        let state = test_state();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.average_duration_ms(), 20.0);
        assert_eq!(metric.error_rate(), 0.5);
    }

    #[test]
    fn test_connection_count_never_underflows() {
        let state = test_state();
        state.connection_closed();
        state.connection_opened();
        state.connection_opened();
        state.connection_closed();
        assert_eq!(state.get_metrics_snapshot().active_connections, 1);
    }
}
