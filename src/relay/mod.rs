//! # Stream Relay
//!
//! The per-call state machine that sits between the telephony socket and the
//! upstream AI link.
//!
//! ## Per-Stream States:
//! ```text
//! absent --start--> started --media--> receiving --stop--> (removed)
//!                      |                 ^    |
//!                      |                 +----+ batch / forward
//!                      +------stop----------------> (removed)
//! ```
//!
//! ## Event Handling:
//! - **start**: open an upstream link and register the session
//! - **media**: buffer the frame; every full batch is converted and forwarded
//! - **mark**: logged only
//! - **stop**: disconnect upstream, close the socket, drop the session
//!
//! Events from one telephony socket are handled strictly in order by a single
//! worker ([`run_connection`]). Different sockets run independently and only
//! meet in the [`SessionTable`].

pub mod downlink;
pub mod session;

use crate::audio::buffer::{concat_payloads, FrameBufferConfig, MediaFrame};
use crate::audio::codec::{check_convertible, convert};
use crate::audio::format::MediaFormat;
use crate::audio::pacer::{PacerConfig, PlaybackPacer};
use crate::config::AppConfig;
use crate::error::RelayResult;
use crate::telephony::events::{StartPayload, StreamEvent};
use crate::telephony::DownstreamHandle;
use crate::upstream::{UpstreamConnector, UpstreamLink};
use downlink::Downlink;
use serde::Serialize;
use session::{PlaybackMode, SessionSummary, SessionTable, StreamSession};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Tuning for the relay, derived from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Frames buffered before a batch is forwarded upstream
    pub batch_threshold: usize,

    /// Format the upstream link expects for caller audio
    pub upstream_input: MediaFormat,

    /// Format of the audio the upstream link produces
    pub upstream_output: MediaFormat,

    /// Whether caller-bound audio goes through a pacer
    pub pacing_enabled: bool,

    /// Duration of one paced frame
    pub playback_frame: Duration,

    /// Pacer timings; rate and frame size are filled in per session
    pub pacer: PacerConfig,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            batch_threshold: FrameBufferConfig::default().batch_threshold,
            upstream_input: MediaFormat::pcm16(16000),
            upstream_output: MediaFormat::pcm16(24000),
            pacing_enabled: true,
            playback_frame: Duration::from_millis(480),
            pacer: PacerConfig::default(),
        }
    }
}

impl RelaySettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let playback = &config.playback;
        Self {
            batch_threshold: config.relay.batch_threshold,
            upstream_input: MediaFormat::pcm16(config.upstream.input_sample_rate),
            upstream_output: MediaFormat::pcm16(config.upstream.output_sample_rate),
            pacing_enabled: playback.enabled,
            playback_frame: Duration::from_millis(playback.frame_ms),
            pacer: PacerConfig {
                initial_buffer_delay: Duration::from_millis(playback.initial_buffer_ms),
                schedule_ahead: Duration::from_millis(playback.schedule_ahead_ms),
                poll_interval: Duration::from_millis(playback.poll_interval_ms),
                wake_lead: Duration::from_millis(playback.wake_lead_ms),
                ..PacerConfig::default()
            },
        }
    }

    /// Pacer configuration for a stream playing at `sample_rate`.
    fn pacer_for(&self, sample_rate: u32) -> PacerConfig {
        let sized = PacerConfig::for_rate(sample_rate, self.playback_frame);
        PacerConfig {
            sample_rate,
            frame_size: sized.frame_size,
            ..self.pacer.clone()
        }
    }
}

/// Relay-wide counters.
#[derive(Debug, Default)]
pub struct RelayStats {
    pub streams_started: AtomicU64,
    pub streams_stopped: AtomicU64,
    pub start_failures: AtomicU64,
    pub frames_received: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub batches_forwarded: AtomicU64,
    pub batches_requeued: AtomicU64,
    pub playback_frames_sent: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayStatsSnapshot {
    pub active_streams: usize,
    pub streams_started: u64,
    pub streams_stopped: u64,
    pub start_failures: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub batches_forwarded: u64,
    pub batches_requeued: u64,
    pub playback_frames_sent: u64,
}

/// Bridges telephony streams to upstream AI links.
///
/// One instance is built at startup and shared by every connection.
pub struct StreamRelay<C: UpstreamConnector> {
    connector: C,
    sessions: SessionTable<C::Link>,
    settings: RelaySettings,
    stats: Arc<RelayStats>,
}

impl<C: UpstreamConnector> StreamRelay<C> {
    pub fn new(connector: C, settings: RelaySettings) -> Self {
        Self {
            connector,
            sessions: SessionTable::new(),
            settings,
            stats: Arc::new(RelayStats::default()),
        }
    }

    pub fn sessions(&self) -> &SessionTable<C::Link> {
        &self.sessions
    }

    pub fn active_streams(&self) -> usize {
        self.sessions.count()
    }

    pub fn stream_summaries(&self) -> Vec<SessionSummary> {
        self.sessions.summaries()
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        RelayStatsSnapshot {
            active_streams: self.sessions.count(),
            streams_started: load(&self.stats.streams_started),
            streams_stopped: load(&self.stats.streams_stopped),
            start_failures: load(&self.stats.start_failures),
            frames_received: load(&self.stats.frames_received),
            frames_dropped: load(&self.stats.frames_dropped),
            batches_forwarded: load(&self.stats.batches_forwarded),
            batches_requeued: load(&self.stats.batches_requeued),
            playback_frames_sent: load(&self.stats.playback_frames_sent),
        }
    }

    /// Apply one signaling event.
    ///
    /// ## Errors:
    /// Only a failed `start` is returned: a media format the relay cannot
    /// convert, or a failed upstream connect. Every other per-event problem is
    /// logged here and the stream carries on.
    pub async fn handle_stream_data(&self, event: StreamEvent, downstream: &DownstreamHandle) -> RelayResult<()> {
        match event {
            StreamEvent::Connected { protocol, version } => {
                debug!(
                    protocol = protocol.as_deref().unwrap_or("-"),
                    version = version.as_deref().unwrap_or("-"),
                    "Telephony socket connected"
                );
                Ok(())
            }
            StreamEvent::Start { stream_id, start } => self.start_stream(stream_id, start, downstream).await,
            StreamEvent::Media { stream_id, media } => {
                self.on_media(&stream_id, media.into_frame()).await;
                Ok(())
            }
            StreamEvent::Mark { stream_id, mark } => {
                info!(stream_id = %stream_id, mark = %mark.name, "Mark received");
                Ok(())
            }
            StreamEvent::Stop { stream_id, .. } => {
                self.close_stream(&stream_id).await;
                Ok(())
            }
            StreamEvent::Unrecognized => {
                warn!("Unrecognized stream event, ignoring");
                Ok(())
            }
        }
    }

    async fn start_stream(&self, stream_id: String, start: StartPayload, downstream: &DownstreamHandle) -> RelayResult<()> {
        let format = start.media_format;
        let supported = check_convertible(&format, &self.settings.upstream_input)
            .and_then(|()| check_convertible(&self.settings.upstream_output, &format));
        if let Err(e) = supported {
            self.stats.start_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                stream_id = %stream_id,
                encoding = %format.encoding,
                sample_rate = format.sample_rate,
                channels = format.channels,
                "Rejecting stream with unsupported media format"
            );
            return Err(e);
        }

        if let Some(previous) = self.sessions.remove(&stream_id) {
            warn!(stream_id = %stream_id, "Stream restarted, disconnecting previous upstream link");
            previous.teardown(false).await;
        }

        let (link, upstream_events) = match self.connector.connect(&stream_id).await {
            Ok(opened) => opened,
            Err(e) => {
                self.stats.start_failures.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let playback = PlaybackMode::for_tracks(&start.tracks, self.settings.pacing_enabled);
        let session = Arc::new(StreamSession::new(
            stream_id.clone(),
            start.call_sid,
            start.media_format,
            start.tracks,
            playback,
            FrameBufferConfig {
                batch_threshold: self.settings.batch_threshold,
            },
            link,
            downstream.clone(),
        ));

        let downlink = Downlink::new(
            stream_id.clone(),
            self.settings.upstream_output,
            start.media_format,
            downstream.clone(),
            session.stats().clone(),
            self.stats.clone(),
        );
        let task = match playback {
            PlaybackMode::Paced => {
                let (pacer, pacer_events) = PlaybackPacer::spawn(self.settings.pacer_for(start.media_format.sample_rate));
                downlink.with_pacer(pacer).spawn(upstream_events, Some(pacer_events))
            }
            PlaybackMode::Passthrough => downlink.spawn(upstream_events, None),
        };
        session.attach_downlink(task);

        if let Some(displaced) = self.sessions.put(session.clone()) {
            warn!(stream_id = %stream_id, "Replaced a concurrently registered session");
            displaced.teardown(false).await;
        }
        self.stats.streams_started.fetch_add(1, Ordering::Relaxed);

        info!(
            stream_id = %stream_id,
            call_id = %session.call_id,
            encoding = %session.media_format.encoding,
            sample_rate = session.media_format.sample_rate,
            playback = ?playback,
            "Stream started"
        );
        Ok(())
    }

    async fn on_media(&self, stream_id: &str, frame: MediaFrame) {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);

        let Some(session) = self.sessions.get(stream_id) else {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(stream_id = %stream_id, "Media for unknown stream dropped");
            return;
        };

        if frame.track != "inbound" {
            trace!(stream_id = %stream_id, track = %frame.track, "Ignoring non-caller track");
            return;
        }

        let Some(batch) = session.push_frame(frame) else {
            return;
        };

        match self.forward_batch(&session, &batch).await {
            Ok(bytes) => {
                session.stats().batches_forwarded.fetch_add(1, Ordering::Relaxed);
                session.stats().bytes_forwarded.fetch_add(bytes as u64, Ordering::Relaxed);
                self.stats.batches_forwarded.fetch_add(1, Ordering::Relaxed);
                trace!(stream_id = %stream_id, frames = batch.len(), bytes, "Batch forwarded");
            }
            Err(e) if e.is_requeueable() => {
                // the send may have reached the service before failing locally
                warn!(
                    stream_id = %stream_id,
                    frames = batch.len(),
                    "Batch forward failed, requeued for retry (upstream may receive it twice): {}",
                    e
                );
                self.stats.batches_requeued.fetch_add(1, Ordering::Relaxed);
                session.requeue(batch);
            }
            Err(e) => {
                error!(stream_id = %stream_id, frames = batch.len(), "Batch dropped: {}", e);
            }
        }
    }

    /// Convert a batch to the upstream format and send it. Returns bytes sent.
    async fn forward_batch(&self, session: &StreamSession<C::Link>, batch: &[MediaFrame]) -> RelayResult<usize> {
        let payload = concat_payloads(batch);
        let target = self.settings.upstream_input;
        let pcm = convert(&payload, &session.media_format, &target)?;
        session.upstream().send_audio(&pcm, &target.mime_type()).await?;
        Ok(pcm.len())
    }

    /// Stop a stream: disconnect upstream, close its socket, remove it.
    ///
    /// Returns `false` when no such stream was registered.
    pub async fn close_stream(&self, stream_id: &str) -> bool {
        let Some(session) = self.sessions.remove(stream_id) else {
            debug!(stream_id = %stream_id, "Stop for unknown stream ignored");
            return false;
        };

        session.teardown(true).await;
        self.stats.streams_stopped.fetch_add(1, Ordering::Relaxed);
        info!(stream_id = %stream_id, "Stream stopped");
        true
    }

    /// Tear down a stream left open by a socket that went away.
    ///
    /// A session re-registered by another connection is left alone.
    async fn release_stream(&self, stream_id: &str, downstream: &DownstreamHandle) {
        if let Some(session) = self.sessions.remove_owned(stream_id, downstream.connection_id()) {
            session.teardown(true).await;
            self.stats.streams_stopped.fetch_add(1, Ordering::Relaxed);
            info!(stream_id = %stream_id, "Stream released after socket closed");
        }
    }

    /// Disconnect every active stream. Used at shutdown.
    pub async fn close_all(&self) {
        for stream_id in self.sessions.ids() {
            self.close_stream(&stream_id).await;
        }
    }
}

/// Process the signaling events of one telephony socket in arrival order.
///
/// Runs until the socket owner drops its sender. Streams opened through this
/// socket and never stopped are torn down on the way out. A failed `start`
/// closes the socket, since the call cannot proceed.
pub async fn run_connection<C: UpstreamConnector>(
    relay: Arc<StreamRelay<C>>,
    mut inbound: mpsc::UnboundedReceiver<StreamEvent>,
    downstream: DownstreamHandle,
) {
    let connection_id = downstream.connection_id();
    let mut opened: HashSet<String> = HashSet::new();
    debug!(connection_id = %connection_id, "Telephony connection worker started");

    while let Some(event) = inbound.recv().await {
        let kind = event.name();
        let stream_id = event.stream_id().map(str::to_string);
        let starting = matches!(event, StreamEvent::Start { .. });
        if let (StreamEvent::Stop { .. }, Some(id)) = (&event, &stream_id) {
            opened.remove(id);
        }
        trace!(connection_id = %connection_id, event = kind, stream_id = stream_id.as_deref().unwrap_or("-"), "Stream event");

        match relay.handle_stream_data(event, &downstream).await {
            Ok(()) => {
                if let (true, Some(id)) = (starting, stream_id) {
                    opened.insert(id);
                }
            }
            Err(e) => {
                error!(
                    connection_id = %connection_id,
                    stream_id = stream_id.as_deref().unwrap_or("-"),
                    "Failed to start stream, closing socket: {}",
                    e
                );
                downstream.close();
                break;
            }
        }
    }

    for stream_id in opened {
        relay.release_stream(&stream_id, &downstream).await;
    }
    debug!(connection_id = %connection_id, "Telephony connection worker finished");
}
