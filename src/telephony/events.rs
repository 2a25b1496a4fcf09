//! # Telephony Stream Messages
//!
//! Wire types for the telephony media-stream WebSocket. Every inbound text
//! frame is one JSON event tagged by its `event` field; it is decoded exactly
//! once, here, into [`StreamEvent`]. Audio payloads are base64 in the JSON and
//! are decoded into raw bytes during the same step.
//!
//! ## Inbound Example:
//! ```json
//! {"event":"media","streamSid":"MZ18ad...","media":{"track":"inbound","chunk":"2","timestamp":"40","payload":"/v7+..."}}
//! ```
//!
//! ## Outbound Example:
//! ```json
//! {"event":"media","streamSid":"MZ18ad...","media":{"payload":"/v7+..."}}
//! ```

use crate::audio::buffer::MediaFrame;
use crate::audio::format::MediaFormat;
use crate::error::RelayResult;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Signaling events received from the telephony side.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StreamEvent {
    /// First message on a new socket, before any stream exists
    Connected {
        #[serde(default)]
        protocol: Option<String>,
        #[serde(default)]
        version: Option<String>,
    },

    /// A stream has started; carries the negotiated media format
    Start {
        #[serde(rename = "streamSid", alias = "streamId")]
        stream_id: String,
        start: StartPayload,
    },

    /// One chunk of caller audio
    Media {
        #[serde(rename = "streamSid", alias = "streamId")]
        stream_id: String,
        media: MediaPayload,
    },

    /// Playback of a previously sent mark has completed
    Mark {
        #[serde(rename = "streamSid", alias = "streamId")]
        stream_id: String,
        mark: MarkPayload,
    },

    /// The stream has ended
    Stop {
        #[serde(rename = "streamSid", alias = "streamId")]
        stream_id: String,
        #[serde(default)]
        stop: Option<StopPayload>,
    },

    /// Any event tag this relay does not know
    #[serde(other)]
    Unrecognized,
}

impl StreamEvent {
    /// Decode one text frame from the telephony socket.
    pub fn from_json(text: &str) -> RelayResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Stream the event belongs to, if it is stream-scoped.
    pub fn stream_id(&self) -> Option<&str> {
        match self {
            StreamEvent::Start { stream_id, .. }
            | StreamEvent::Media { stream_id, .. }
            | StreamEvent::Mark { stream_id, .. }
            | StreamEvent::Stop { stream_id, .. } => Some(stream_id),
            StreamEvent::Connected { .. } | StreamEvent::Unrecognized => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Connected { .. } => "connected",
            StreamEvent::Start { .. } => "start",
            StreamEvent::Media { .. } => "media",
            StreamEvent::Mark { .. } => "mark",
            StreamEvent::Stop { .. } => "stop",
            StreamEvent::Unrecognized => "unrecognized",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPayload {
    #[serde(default)]
    pub account_sid: Option<String>,
    #[serde(alias = "callId")]
    pub call_sid: String,
    #[serde(default = "default_tracks")]
    pub tracks: Vec<String>,
    pub media_format: MediaFormat,
    #[serde(default)]
    pub custom_parameters: HashMap<String, serde_json::Value>,
}

fn default_tracks() -> Vec<String> {
    vec!["inbound".to_string()]
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MediaPayload {
    #[serde(default = "default_track")]
    pub track: String,
    #[serde(default)]
    pub chunk: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(deserialize_with = "decode_base64")]
    pub payload: Vec<u8>,
}

fn default_track() -> String {
    "inbound".to_string()
}

impl MediaPayload {
    pub fn into_frame(self) -> MediaFrame {
        MediaFrame {
            chunk: self.chunk.as_deref().and_then(|c| c.parse().ok()),
            timestamp_ms: self.timestamp.as_deref().and_then(|t| t.parse().ok()),
            track: self.track,
            payload: self.payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopPayload {
    #[serde(default)]
    pub account_sid: Option<String>,
    #[serde(default)]
    pub call_sid: Option<String>,
}

fn decode_base64<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded = String::deserialize(deserializer)?;
    STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| serde::de::Error::custom(format!("invalid base64 payload: {}", e)))
}

/// Messages pushed back to the telephony side.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundMessage {
    /// Audio to play to the caller
    Media {
        #[serde(rename = "streamSid")]
        stream_id: String,
        media: OutboundMedia,
    },

    /// Drop any audio the telephony side has buffered but not yet played
    Clear {
        #[serde(rename = "streamSid")]
        stream_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMedia {
    pub payload: String,
}

impl OutboundMessage {
    /// Build a media message, base64-encoding the audio.
    pub fn media(stream_id: &str, audio: &[u8]) -> Self {
        OutboundMessage::Media {
            stream_id: stream_id.to_string(),
            media: OutboundMedia {
                payload: STANDARD.encode(audio),
            },
        }
    }

    pub fn clear(stream_id: &str) -> Self {
        OutboundMessage::Clear {
            stream_id: stream_id.to_string(),
        }
    }

    pub fn to_json(&self) -> RelayResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::AudioEncoding;

    #[test]
    fn test_decode_start_event() {
        let json = r#"{
            "event": "start",
            "sequenceNumber": "1",
            "streamSid": "MZ123",
            "start": {
                "accountSid": "AC1",
                "streamSid": "MZ123",
                "callSid": "CA9",
                "tracks": ["inbound"],
                "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1},
                "customParameters": {"campaign": "spring"}
            }
        }"#;

        match StreamEvent::from_json(json).unwrap() {
            StreamEvent::Start { stream_id, start } => {
                assert_eq!(stream_id, "MZ123");
                assert_eq!(start.call_sid, "CA9");
                assert_eq!(start.tracks, vec!["inbound".to_string()]);
                assert_eq!(start.media_format.encoding, AudioEncoding::Mulaw);
                assert_eq!(start.media_format.sample_rate, 8000);
                assert!(start.custom_parameters.contains_key("campaign"));
            }
            other => panic!("expected start, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_media_event_decodes_payload() {
        let json = r#"{"event":"media","streamSid":"MZ1","media":{"track":"inbound","chunk":"7","timestamp":"140","payload":"AAEC/w=="}}"#;

        match StreamEvent::from_json(json).unwrap() {
            StreamEvent::Media { stream_id, media } => {
                assert_eq!(stream_id, "MZ1");
                let frame = media.into_frame();
                assert_eq!(frame.payload, vec![0x00, 0x01, 0x02, 0xFF]);
                assert_eq!(frame.chunk, Some(7));
                assert_eq!(frame.timestamp_ms, Some(140));
            }
            other => panic!("expected media, got {:?}", other),
        }
    }

    #[test]
    fn test_stream_id_alias() {
        let json = r#"{"event":"stop","streamId":"MZ5"}"#;
        let event = StreamEvent::from_json(json).unwrap();
        assert_eq!(event.stream_id(), Some("MZ5"));
    }

    #[test]
    fn test_unknown_event_is_unrecognized() {
        let json = r#"{"event":"dtmf","streamSid":"MZ1","dtmf":{"digit":"1"}}"#;
        assert_eq!(StreamEvent::from_json(json).unwrap(), StreamEvent::Unrecognized);
    }

    #[test]
    fn test_bad_payload_is_rejected() {
        let json = r#"{"event":"media","streamSid":"MZ1","media":{"payload":"%%%"}}"#;
        assert!(StreamEvent::from_json(json).is_err());
    }

    #[test]
    fn test_outbound_media_shape() {
        let json = OutboundMessage::media("MZ1", &[0xFF, 0x7F]).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["event"], "media");
        assert_eq!(value["streamSid"], "MZ1");
        assert_eq!(value["media"]["payload"], "/38=");

        let clear = OutboundMessage::clear("MZ1").to_json().unwrap();
        assert_eq!(clear, r#"{"event":"clear","streamSid":"MZ1"}"#);
    }
}
