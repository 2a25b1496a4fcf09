//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - Built-in defaults
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Platform environment variables (HOST, PORT, provider credentials)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Converts between Rust structs and TOML/env/JSON
//! - **config crate**: Layers sources so later ones override earlier ones
//! - **Result<T, E>**: Loading and validation failures are returned, not panicked on
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Platform variables (`PORT`, `GOOGLE_API_KEY`, `TWILIO_AUTH_TOKEN`, ...)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_RELAY__BATCH_THRESHOLD`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::error::RelayError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each section maps to one concern (HTTP server, telephony provider, AI
/// service, batching, playback) and to one table in config.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub telephony: TelephonyConfig,
    pub upstream: UpstreamConfig,
    pub relay: RelayConfig,
    pub playback: PlaybackConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Telephony provider account and voice webhook settings.
///
/// ## Fields:
/// - `public_host`: host the provider can reach us on; used to build the
///   media-stream URL in TwiML. When unset the request's Host header is used.
/// - `greeting`: spoken to the caller before the stream connects; empty to skip
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelephonyConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub phone_number: String,
    #[serde(default)]
    pub public_host: Option<String>,
    pub greeting: String,
}

impl Default for TelephonyConfig {
    fn default() -> Self {
        Self {
            account_sid: String::new(),
            auth_token: String::new(),
            phone_number: String::new(),
            public_host: None,
            greeting: "Hello, you are now connected to the assistant.".to_string(),
        }
    }
}

/// Speech-to-speech AI service settings.
///
/// ## Audio Formats:
/// The service takes 16kHz PCM16 and answers with 24kHz PCM16; both rates
/// are configurable in case the model changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub api_key: String,
    pub model: String,
    pub endpoint: String,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub system_instruction: Option<String>,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "models/gemini-2.0-flash-exp".to_string(),
            endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent".to_string(),
            voice: None,
            system_instruction: None,
            input_sample_rate: 16000,
            output_sample_rate: 24000,
        }
    }
}

/// Inbound batching policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Telephony frames buffered before one upstream send
    pub batch_threshold: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self { batch_threshold: 50 }
    }
}

/// Playback pacing for audio sent back to the caller. All times in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    pub enabled: bool,
    pub frame_ms: u64,
    pub initial_buffer_ms: u64,
    pub schedule_ahead_ms: u64,
    pub poll_interval_ms: u64,
    pub wake_lead_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            frame_ms: 480,
            initial_buffer_ms: 100,
            schedule_ahead_ms: 200,
            poll_interval_ms: 100,
            wake_lead_ms: 50,
        }
    }
}

/// Platform variables mapped onto config keys.
const PLATFORM_OVERRIDES: [(&str, &str); 6] = [
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("TWILIO_ACCOUNT_SID", "telephony.account_sid"),
    ("TWILIO_AUTH_TOKEN", "telephony.auth_token"),
    ("TWILIO_PHONE_NUMBER", "telephony.phone_number"),
    ("GOOGLE_API_KEY", "upstream.api_key"),
];

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_UPSTREAM__MODEL=models/gemini-2.0-flash-exp`: Override model
    /// - `APP_PLAYBACK__ENABLED=false`: Send caller audio unpaced
    /// - `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // double underscore separates sections so keys may contain single ones
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        for (var, key) in PLATFORM_OVERRIDES {
            if let Ok(value) = env::var(var) {
                settings = settings.set_override(key, value)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Provider and AI credentials are present
    /// - Server port is not 0
    /// - Batch threshold, sample rates and pacing frame are non-zero
    ///
    /// ## Errors:
    /// Returns `RelayError::Configuration`; the server refuses to start.
    pub fn validate(&self) -> Result<(), RelayError> {
        let required = [
            ("telephony.account_sid (TWILIO_ACCOUNT_SID)", &self.telephony.account_sid),
            ("telephony.auth_token (TWILIO_AUTH_TOKEN)", &self.telephony.auth_token),
            ("telephony.phone_number (TWILIO_PHONE_NUMBER)", &self.telephony.phone_number),
            ("upstream.api_key (GOOGLE_API_KEY)", &self.upstream.api_key),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(RelayError::Configuration(format!(
                "missing required settings: {}",
                missing.join(", ")
            )));
        }

        if self.server.port == 0 {
            return Err(RelayError::Configuration("server port cannot be 0".to_string()));
        }
        if self.relay.batch_threshold == 0 {
            return Err(RelayError::Configuration(
                "relay batch threshold must be greater than 0".to_string(),
            ));
        }
        if self.upstream.input_sample_rate == 0 || self.upstream.output_sample_rate == 0 {
            return Err(RelayError::Configuration(
                "upstream sample rates must be greater than 0".to_string(),
            ));
        }
        if self.playback.frame_ms == 0 {
            return Err(RelayError::Configuration(
                "playback frame duration must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Copy safe to expose over the API, with secrets masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.telephony.auth_token = mask(&copy.telephony.auth_token);
        copy.telephony.account_sid = mask(&copy.telephony.account_sid);
        copy.upstream.api_key = mask(&copy.upstream.api_key);
        copy
    }
}

fn mask(secret: &str) -> String {
    let len = secret.chars().count();
    match len {
        0 => String::new(),
        1..=8 => "****".to_string(),
        _ => {
            let tail: String = secret.chars().skip(len - 4).collect();
            format!("****{}", tail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> AppConfig {
        let mut config = AppConfig::default();
        config.telephony.account_sid = "AC0123456789".to_string();
        config.telephony.auth_token = "secret-token-value".to_string();
        config.telephony.phone_number = "+15550100".to_string();
        config.upstream.api_key = "AIzaExampleKey1234".to_string();
        config
    }

    /// Defaults carry the documented relay constants but no credentials.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.relay.batch_threshold, 50);
        assert_eq!(config.playback.frame_ms, 480);
        assert_eq!(config.upstream.input_sample_rate, 16000);
        assert!(matches!(config.validate(), Err(RelayError::Configuration(_))));
    }

    #[test]
    fn test_complete_config_validates() {
        assert!(complete().validate().is_ok());
    }

    #[test]
    fn test_missing_credentials_are_named() {
        let mut config = complete();
        config.upstream.api_key.clear();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("GOOGLE_API_KEY"));
        assert!(!err.contains("TWILIO_AUTH_TOKEN"));
    }

    #[test]
    fn test_config_validation() {
        let mut config = complete();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = complete();
        config.relay.batch_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redacted_masks_secrets() {
        let redacted = complete().redacted();
        assert_eq!(redacted.telephony.auth_token, "****alue");
        assert_eq!(redacted.upstream.api_key, "****1234");
        assert_eq!(redacted.telephony.phone_number, "+15550100");
    }
}
