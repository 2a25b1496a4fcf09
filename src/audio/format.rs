//! # Audio Formats
//!
//! Describes the encodings and sample rates flowing through the relay. The
//! telephony side negotiates its format in the `start` event; the upstream AI
//! side has fixed input/output formats from configuration.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sample encoding of a raw audio buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioEncoding {
    /// 8-bit G.711 μ-law, one byte per sample.
    #[serde(rename = "audio/x-mulaw", alias = "mulaw", alias = "audio/mulaw")]
    Mulaw,
    /// 16-bit signed little-endian linear PCM.
    #[serde(rename = "audio/pcm", alias = "pcm")]
    Pcm16,
}

impl AudioEncoding {
    pub fn as_str(self) -> &'static str {
        match self {
            AudioEncoding::Mulaw => "audio/x-mulaw",
            AudioEncoding::Pcm16 => "audio/pcm",
        }
    }
}

impl fmt::Display for AudioEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoding, rate and channel layout of an audio stream.
///
/// Field names follow the telephony `mediaFormat` object, so the same type
/// deserializes straight out of a `start` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFormat {
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
    #[serde(alias = "channelCount", default = "default_channels")]
    pub channels: u16,
}

fn default_channels() -> u16 {
    1
}

impl MediaFormat {
    pub const fn new(encoding: AudioEncoding, sample_rate: u32, channels: u16) -> Self {
        Self {
            encoding,
            sample_rate,
            channels,
        }
    }

    /// 8kHz mono μ-law, the telephony default.
    pub const fn telephony() -> Self {
        Self::new(AudioEncoding::Mulaw, 8000, 1)
    }

    pub const fn pcm16(sample_rate: u32) -> Self {
        Self::new(AudioEncoding::Pcm16, sample_rate, 1)
    }

    /// MIME type advertised to the upstream AI service for this format.
    pub fn mime_type(&self) -> String {
        format!("{};rate={}", self.encoding.as_str(), self.sample_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_format_from_telephony_json() {
        let json = r#"{"encoding":"audio/x-mulaw","sampleRate":8000,"channels":1}"#;
        let format: MediaFormat = serde_json::from_str(json).unwrap();
        assert_eq!(format, MediaFormat::telephony());

        // channelCount spelling is accepted too
        let json = r#"{"encoding":"audio/pcm","sampleRate":16000,"channelCount":2}"#;
        let format: MediaFormat = serde_json::from_str(json).unwrap();
        assert_eq!(format.channels, 2);
    }

    #[test]
    fn test_big_endian_l16_not_accepted() {
        let json = r#"{"encoding":"audio/l16","sampleRate":8000}"#;
        assert!(serde_json::from_str::<MediaFormat>(json).is_err());
    }

    #[test]
    fn test_mime_type() {
        assert_eq!(MediaFormat::pcm16(16000).mime_type(), "audio/pcm;rate=16000");
    }
}
