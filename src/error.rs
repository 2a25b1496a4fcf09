//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - **`RelayError`**: the taxonomy of the real-time relay core (codec, session
//!   table, stream state machine, upstream link). These never leave the process
//!   as HTTP responses; they are logged at the state machine boundary.
//! - **`AppError`**: errors returned by HTTP handlers, converted into JSON
//!   responses through actix's `ResponseError` trait.
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Result<T, E> Type
//! - **T**: The success type
//! - **E**: The error type
//! - **No exceptions**: failures travel through return values and the `?` operator
//!
//! ### Traits for Error Conversion
//! - **From trait**: Automatically converts between error types
//! - **ResponseError trait**: Converts errors to HTTP responses
//! - **Display trait**: Defines how errors are formatted as strings

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors raised by the relay core.
///
/// ## Categories:
/// - **Configuration**: missing credentials or invalid settings (fatal at startup)
/// - **UpstreamConnect**: the AI link could not be opened; aborts a `start`
/// - **UpstreamSend**: the AI link refused a frame; the batch is requeued
/// - **Conversion / InvalidInput**: malformed or empty audio; the batch is requeued
/// - **UnknownStream**: event for an unregistered stream id; logged and ignored
/// - **Downstream**: the telephony socket is gone
/// - **Protocol**: an inbound signaling message could not be decoded
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to connect upstream AI link: {0}")]
    UpstreamConnect(String),

    #[error("failed to send audio upstream: {0}")]
    UpstreamSend(String),

    #[error("audio conversion failed: {0}")]
    Conversion(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unknown stream: {0}")]
    UnknownStream(String),

    #[error("downstream socket closed: {0}")]
    Downstream(String),

    #[error("malformed signaling message: {0}")]
    Protocol(#[from] serde_json::Error),
}

impl RelayError {
    /// Whether a failed media flush should put its batch back in the buffer.
    ///
    /// Only transient per-batch failures are retried; a closed downstream or an
    /// unknown stream will not get better by trying again.
    pub fn is_requeueable(&self) -> bool {
        matches!(
            self,
            RelayError::UpstreamSend(_) | RelayError::Conversion(_) | RelayError::InvalidInput(_)
        )
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

/// Custom error types for the HTTP surface.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

/// Converts application errors into JSON HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "Stream MZ123 is not active",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Relay errors that reach an HTTP handler map onto the closest HTTP category.
impl From<RelayError> for AppError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Configuration(msg) => AppError::ConfigError(msg),
            RelayError::UnknownStream(id) => AppError::NotFound(format!("Stream {} is not active", id)),
            RelayError::Protocol(e) => AppError::BadRequest(e.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Shorthand for `Result<T, AppError>` in HTTP handlers.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_requeueable_errors() {
        assert!(RelayError::UpstreamSend("socket gone".into()).is_requeueable());
        assert!(RelayError::Conversion("odd length".into()).is_requeueable());
        assert!(!RelayError::UnknownStream("MZ1".into()).is_requeueable());
        assert!(!RelayError::Downstream("MZ1".into()).is_requeueable());
    }

    #[test]
    fn test_unknown_stream_maps_to_404() {
        let err: AppError = RelayError::UnknownStream("MZ404".into()).into();
        assert_eq!(err.error_response().status(), StatusCode::NOT_FOUND);
        assert!(err.to_string().contains("MZ404"));
    }
}
