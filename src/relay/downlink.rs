//! # Downlink
//!
//! Carries synthesized speech from the upstream link back to the caller.
//! One task per session selects over two channels:
//!
//! - **upstream events**: audio is converted to the telephony rate and either
//!   queued on the pacer or written straight to the socket
//! - **pacer events**: each `Play` frame is encoded for the telephony side
//!   and sent as a `media` message
//!
//! When the upstream link closes, a paced session keeps running until the
//! pacer has drained what it already holds.

use super::RelayStats;
use crate::audio::codec::{convert, f32_to_pcm16};
use crate::audio::format::MediaFormat;
use crate::audio::pacer::{PacerEvent, PlaybackPacer};
use crate::error::RelayResult;
use crate::relay::session::SessionStats;
use crate::telephony::events::OutboundMessage;
use crate::telephony::DownstreamHandle;
use crate::upstream::{UpstreamEvent, UpstreamEvents};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

pub struct Downlink {
    stream_id: String,
    upstream_format: MediaFormat,
    telephony_format: MediaFormat,
    downstream: DownstreamHandle,
    pacer: Option<PlaybackPacer>,
    interrupted: bool,
    session_stats: Arc<SessionStats>,
    relay_stats: Arc<RelayStats>,
}

impl Downlink {
    pub fn new(
        stream_id: String,
        upstream_format: MediaFormat,
        telephony_format: MediaFormat,
        downstream: DownstreamHandle,
        session_stats: Arc<SessionStats>,
        relay_stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            stream_id,
            upstream_format,
            telephony_format,
            downstream,
            pacer: None,
            interrupted: false,
            session_stats,
            relay_stats,
        }
    }

    /// Route audio through `pacer`, which must run at the telephony rate.
    pub fn with_pacer(mut self, pacer: PlaybackPacer) -> Self {
        self.pacer = Some(pacer);
        self
    }

    /// PCM16 at the telephony sample rate; what the pacer consumes.
    fn pacer_format(&self) -> MediaFormat {
        MediaFormat::pcm16(self.telephony_format.sample_rate)
    }

    pub fn spawn(
        self,
        upstream: UpstreamEvents,
        pacer_events: Option<mpsc::UnboundedReceiver<PacerEvent>>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(upstream, pacer_events))
    }

    async fn run(
        mut self,
        mut upstream: UpstreamEvents,
        mut pacer_events: Option<mpsc::UnboundedReceiver<PacerEvent>>,
    ) {
        let mut upstream_open = true;

        loop {
            tokio::select! {
                event = upstream.recv(), if upstream_open => {
                    match event {
                        Some(UpstreamEvent::Close) | None => {
                            info!(stream_id = %self.stream_id, "Upstream link closed");
                            upstream_open = false;
                            match &self.pacer {
                                Some(pacer) => pacer.mark_complete(),
                                None => break,
                            }
                        }
                        Some(event) => self.on_upstream(event),
                    }
                }
                event = next_pacer_event(&mut pacer_events) => {
                    let Some(event) = event else {
                        break;
                    };
                    let drained = matches!(event, PacerEvent::Complete | PacerEvent::Stop);
                    if self.on_pacer(event).is_err() {
                        debug!(stream_id = %self.stream_id, "Telephony socket gone, ending downlink");
                        break;
                    }
                    if drained && !upstream_open {
                        break;
                    }
                }
            }
        }
        trace!(stream_id = %self.stream_id, "Downlink finished");
    }

    fn on_upstream(&mut self, event: UpstreamEvent) {
        match event {
            UpstreamEvent::Audio(pcm) => {
                if let Err(e) = self.on_audio(&pcm) {
                    warn!(stream_id = %self.stream_id, "Dropping upstream audio: {}", e);
                }
            }
            UpstreamEvent::Open => debug!(stream_id = %self.stream_id, "Upstream link open"),
            UpstreamEvent::Interrupted => {
                info!(stream_id = %self.stream_id, "Caller interrupted, clearing playback");
                self.interrupted = true;
                if let Some(pacer) = &self.pacer {
                    pacer.stop();
                }
                if let Err(e) = self.downstream.send(&OutboundMessage::clear(&self.stream_id)) {
                    debug!(stream_id = %self.stream_id, "Could not send clear: {}", e);
                }
            }
            UpstreamEvent::TurnComplete => {
                debug!(stream_id = %self.stream_id, "Upstream turn complete");
                if let Some(pacer) = &self.pacer {
                    pacer.mark_complete();
                }
            }
            UpstreamEvent::Close => {}
        }
    }

    fn on_audio(&mut self, pcm: &[u8]) -> RelayResult<()> {
        match &self.pacer {
            Some(pacer) => {
                if self.interrupted {
                    self.interrupted = false;
                    pacer.resume();
                }
                let resampled = convert(pcm, &self.upstream_format, &self.pacer_format())?;
                pacer.add_chunk(&resampled)
            }
            None => {
                let encoded = convert(pcm, &self.upstream_format, &self.telephony_format)?;
                self.send_media(&encoded)
            }
        }
    }

    fn on_pacer(&mut self, event: PacerEvent) -> RelayResult<()> {
        match event {
            PacerEvent::Play { samples, .. } => {
                let pcm = f32_to_pcm16(&samples);
                let encoded = convert(&pcm, &self.pacer_format(), &self.telephony_format)?;
                self.send_media(&encoded)
            }
            PacerEvent::Complete => {
                debug!(stream_id = %self.stream_id, "Playback complete");
                Ok(())
            }
            PacerEvent::Stop => {
                debug!(stream_id = %self.stream_id, "Playback stopped");
                Ok(())
            }
            PacerEvent::Resume => {
                debug!(stream_id = %self.stream_id, "Playback resumed");
                Ok(())
            }
        }
    }

    fn send_media(&self, audio: &[u8]) -> RelayResult<()> {
        self.downstream.send(&OutboundMessage::media(&self.stream_id, audio))?;
        self.session_stats.playback_frames_sent.fetch_add(1, Ordering::Relaxed);
        self.relay_stats.playback_frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

async fn next_pacer_event(events: &mut Option<mpsc::UnboundedReceiver<PacerEvent>>) -> Option<PacerEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::mulaw_to_pcm16;
    use crate::audio::pacer::PacerConfig;
    use crate::telephony::DownstreamCommand;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use std::time::Duration;

    fn downlink(downstream: DownstreamHandle) -> Downlink {
        Downlink::new(
            "MZ1".to_string(),
            MediaFormat::pcm16(24000),
            MediaFormat::telephony(),
            downstream,
            Arc::new(SessionStats::default()),
            Arc::new(RelayStats::default()),
        )
    }

    fn media_payload(command: DownstreamCommand) -> Vec<u8> {
        let DownstreamCommand::Text(text) = command else {
            panic!("expected text, got {:?}", command);
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "media");
        assert_eq!(value["streamSid"], "MZ1");
        STANDARD.decode(value["media"]["payload"].as_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_passthrough_writes_converted_audio() {
        let (downstream, mut rx) = DownstreamHandle::channel();
        let (tx, events) = mpsc::unbounded_channel();
        let task = downlink(downstream).spawn(events, None);

        // 30ms of 24kHz silence becomes 240 μ-law bytes at 8kHz
        tx.send(UpstreamEvent::Audio(vec![0u8; 720 * 2])).unwrap();
        tx.send(UpstreamEvent::Close).unwrap();
        task.await.unwrap();

        let payload = media_payload(rx.recv().await.unwrap());
        assert_eq!(payload.len(), 240);
        assert!(mulaw_to_pcm16(&payload).iter().all(|b| *b == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paced_audio_drains_after_close() {
        let (downstream, mut rx) = DownstreamHandle::channel();
        let (tx, events) = mpsc::unbounded_channel();
        let (pacer, pacer_events) =
            PlaybackPacer::spawn(PacerConfig::for_rate(8000, Duration::from_millis(480)));
        let task = downlink(downstream).with_pacer(pacer).spawn(events, Some(pacer_events));

        // one second of 24kHz audio is 8000 samples at 8kHz: 3840 + 3840 + 320
        tx.send(UpstreamEvent::Audio(vec![0u8; 24000 * 2])).unwrap();
        tx.send(UpstreamEvent::Close).unwrap();
        task.await.unwrap();

        let sizes: Vec<usize> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|command| media_payload(command).len())
            .collect();
        assert_eq!(sizes, vec![3840, 3840, 320]);
    }

    #[tokio::test]
    async fn test_interrupted_sends_clear() {
        let (downstream, mut rx) = DownstreamHandle::channel();
        let (tx, events) = mpsc::unbounded_channel();
        let task = downlink(downstream).spawn(events, None);

        tx.send(UpstreamEvent::Interrupted).unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            DownstreamCommand::Text(r#"{"event":"clear","streamSid":"MZ1"}"#.to_string())
        );
    }
}
