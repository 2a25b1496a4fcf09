//! # Audio Processing Module
//!
//! Everything the relay does to audio bytes between the two sockets.
//!
//! ## Key Components:
//! - **Formats**: encodings, sample rates and channel layouts on either side
//! - **Codec**: μ-law ↔ PCM16 tables and sample-rate conversion
//! - **Frame Buffer**: batching of inbound telephony frames before forwarding
//! - **Pacer**: real-time re-timing of synthesized audio sent back to the caller
//!
//! ## Audio Formats In Flight:
//! - **Telephony**: 8kHz μ-law, mono, base64 in JSON text frames
//! - **Upstream input**: 16kHz PCM16 little-endian, mono
//! - **Upstream output**: 24kHz PCM16 little-endian, mono

pub mod buffer;   // Inbound frame batching
pub mod codec;    // μ-law / PCM16 conversion and resampling
pub mod format;   // Media format descriptions
pub mod pacer;    // Playback pacing scheduler
