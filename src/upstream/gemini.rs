//! # Gemini Live Link
//!
//! [`UpstreamConnector`] over the Gemini Live bidirectional streaming
//! WebSocket (`BidiGenerateContent`).
//!
//! ## Session Handshake:
//! 1. Open the socket with the API key in the query string
//! 2. Send a `setup` message naming the model and asking for AUDIO responses
//! 3. Wait for `setupComplete`
//!
//! After the handshake the socket is split. A writer task owns the sink and
//! drains an mpsc queue fed by [`GeminiLink::send_audio`]; a reader task owns
//! the stream and turns server messages into [`UpstreamEvent`]s.
//!
//! ## Wire Example (caller audio):
//! ```json
//! {"realtimeInput":{"mediaChunks":[{"mimeType":"audio/pcm;rate=16000","data":"AAEC..."}]}}
//! ```

use super::{UpstreamConnector, UpstreamEvent, UpstreamEvents, UpstreamLink};
use crate::config::UpstreamConfig;
use crate::error::{RelayError, RelayResult};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, trace, warn};

// ---- outbound messages ----

#[derive(Debug, Serialize)]
struct SetupMessage<'a> {
    setup: Setup<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup<'a> {
    model: String,
    generation_config: GenerationConfig<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    response_modalities: [&'static str; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    speech_config: Option<SpeechConfig<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig<'a> {
    voice_config: VoiceConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig<'a> {
    prebuilt_voice_config: PrebuiltVoiceConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig<'a> {
    voice_name: &'a str,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    parts: [TextPart<'a>; 1],
}

#[derive(Debug, Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputMessage<'a> {
    realtime_input: RealtimeInput<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput<'a> {
    media_chunks: [MediaChunk<'a>; 1],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaChunk<'a> {
    mime_type: &'a str,
    data: String,
}

// ---- inbound messages ----

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    #[serde(default)]
    setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    server_content: Option<ServerContent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<ServerPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerPart {
    #[serde(default)]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: Option<String>,
    data: String,
}

/// Build the `setup` message for a new session.
fn setup_message(config: &UpstreamConfig) -> RelayResult<String> {
    let model = if config.model.starts_with("models/") {
        config.model.clone()
    } else {
        format!("models/{}", config.model)
    };

    let message = SetupMessage {
        setup: Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: ["AUDIO"],
                speech_config: config.voice.as_deref().map(|voice_name| SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig { voice_name },
                    },
                }),
            },
            system_instruction: config.system_instruction.as_deref().map(|text| Content {
                parts: [TextPart { text }],
            }),
        },
    };
    Ok(serde_json::to_string(&message)?)
}

fn realtime_input(pcm: &[u8], mime_type: &str) -> RelayResult<String> {
    let message = RealtimeInputMessage {
        realtime_input: RealtimeInput {
            media_chunks: [MediaChunk {
                mime_type,
                data: STANDARD.encode(pcm),
            }],
        },
    };
    Ok(serde_json::to_string(&message)?)
}

/// Text of a data frame; the service sends JSON as either text or binary.
fn frame_text(message: &Message) -> Option<&str> {
    match message {
        Message::Text(text) => Some(text.as_str()),
        Message::Binary(bytes) => std::str::from_utf8(bytes).ok(),
        _ => None,
    }
}

/// Whether a message received during the handshake is the `setupComplete`
/// acknowledgement. An unreadable reply fails the connect.
fn setup_acknowledged(text: &str) -> RelayResult<bool> {
    let message: ServerMessage = serde_json::from_str(text)
        .map_err(|e| RelayError::UpstreamConnect(format!("unreadable setup reply: {}", e)))?;
    Ok(message.setup_complete.is_some())
}

/// Translate one server message into relay events, in wire order.
fn server_events(message: ServerMessage) -> Vec<UpstreamEvent> {
    let mut events = Vec::new();
    let Some(content) = message.server_content else {
        return events;
    };

    if let Some(turn) = content.model_turn {
        for part in turn.parts {
            let Some(inline) = part.inline_data else {
                continue;
            };
            if let Some(mime) = inline.mime_type.as_deref() {
                if !mime.starts_with("audio/pcm") {
                    trace!("Skipping non-audio inline data: {}", mime);
                    continue;
                }
            }
            match STANDARD.decode(inline.data.as_bytes()) {
                Ok(audio) => events.push(UpstreamEvent::Audio(audio)),
                Err(e) => warn!("Discarding undecodable audio part: {}", e),
            }
        }
    }

    if content.interrupted {
        events.push(UpstreamEvent::Interrupted);
    }
    if content.turn_complete {
        events.push(UpstreamEvent::TurnComplete);
    }
    events
}

/// Opens Gemini Live sessions with a fixed model and voice configuration.
#[derive(Debug, Clone)]
pub struct GeminiConnector {
    config: UpstreamConfig,
}

impl GeminiConnector {
    pub fn new(config: UpstreamConfig) -> Self {
        Self { config }
    }

    fn url(&self) -> String {
        format!("{}?key={}", self.config.endpoint, self.config.api_key)
    }
}

impl UpstreamConnector for GeminiConnector {
    type Link = GeminiLink;

    async fn connect(&self, stream_id: &str) -> RelayResult<(GeminiLink, UpstreamEvents)> {
        info!(stream_id = %stream_id, model = %self.config.model, "Opening Gemini Live session");

        let (socket, _response) = connect_async(self.url())
            .await
            .map_err(|e| RelayError::UpstreamConnect(e.to_string()))?;
        let (mut sink, mut stream) = socket.split();

        sink.send(Message::Text(setup_message(&self.config)?))
            .await
            .map_err(|e| RelayError::UpstreamConnect(e.to_string()))?;

        loop {
            let frame = match stream.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => return Err(RelayError::UpstreamConnect(e.to_string())),
                None => {
                    return Err(RelayError::UpstreamConnect(
                        "socket closed before setup completed".to_string(),
                    ))
                }
            };

            if let Message::Close(reason) = &frame {
                return Err(RelayError::UpstreamConnect(format!(
                    "socket closed during setup: {:?}",
                    reason
                )));
            }

            let Some(text) = frame_text(&frame) else {
                continue;
            };
            if setup_acknowledged(text)? {
                break;
            }
        }

        debug!(stream_id = %stream_id, "Gemini Live setup complete");

        let (event_tx, events) = mpsc::unbounded_channel();
        let _ = event_tx.send(UpstreamEvent::Open);

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();

        let writer_id = stream_id.to_string();
        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    warn!(stream_id = %writer_id, "Gemini Live write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_id = stream_id.to_string();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!(stream_id = %reader_id, "Gemini Live read failed: {}", e);
                        break;
                    }
                };

                if let Message::Close(reason) = &frame {
                    debug!(stream_id = %reader_id, "Gemini Live closed by server: {:?}", reason);
                    break;
                }

                let Some(text) = frame_text(&frame) else {
                    continue;
                };
                match serde_json::from_str::<ServerMessage>(text) {
                    Ok(message) => {
                        for event in server_events(message) {
                            if event_tx.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!(stream_id = %reader_id, "Unparseable Gemini Live message: {}", e),
                }
            }
            let _ = event_tx.send(UpstreamEvent::Close);
        });

        Ok((
            GeminiLink {
                stream_id: stream_id.to_string(),
                outgoing,
                closed: AtomicBool::new(false),
                tasks: Mutex::new(vec![writer, reader]),
            },
            events,
        ))
    }
}

/// One open Gemini Live session.
#[derive(Debug)]
pub struct GeminiLink {
    stream_id: String,
    outgoing: mpsc::UnboundedSender<Message>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UpstreamLink for GeminiLink {
    async fn send_audio(&self, pcm: &[u8], mime_type: &str) -> RelayResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RelayError::UpstreamSend("link is disconnected".to_string()));
        }

        let message = realtime_input(pcm, mime_type)?;
        self.outgoing
            .send(Message::Text(message))
            .map_err(|_| RelayError::UpstreamSend("writer task has stopped".to_string()))?;
        trace!(stream_id = %self.stream_id, bytes = pcm.len(), "Queued audio for Gemini Live");
        Ok(())
    }

    async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let _ = self.outgoing.send(Message::Close(None));
        // the writer exits on its own after flushing the close frame
        let mut tasks = self.tasks.lock();
        if let Some(reader) = tasks.pop() {
            reader.abort();
        }
        tasks.clear();
        info!(stream_id = %self.stream_id, "Gemini Live session disconnected");
    }
}

impl Drop for GeminiLink {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
