//! # Stream Sessions
//!
//! One [`StreamSession`] exists per active call. It owns the call's upstream
//! link, its pending inbound frames and the task that carries audio back to
//! the caller. Sessions live in a [`SessionTable`] keyed by stream id.
//!
//! ## Session Lifecycle:
//! 1. **Started**: upstream link open, no caller audio yet
//! 2. **Receiving**: caller frames are arriving and being batched
//! 3. **Stopped**: removed from the table, link disconnected (terminal)
//!
//! ## Thread Safety:
//! The table hands out `Arc<StreamSession>` clones. Table locks are held only
//! for the map operation itself, never across an upstream call.

use crate::audio::buffer::{FrameBuffer, FrameBufferConfig, MediaFrame};
use crate::audio::format::MediaFormat;
use crate::telephony::DownstreamHandle;
use crate::upstream::UpstreamLink;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// How synthesized audio reaches the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    /// Re-timed through a playback pacer
    Paced,
    /// Converted and written as soon as it arrives
    Passthrough,
}

impl PlaybackMode {
    /// Audio is paced when the stream carries the caller's inbound track
    /// and pacing is enabled.
    pub fn for_tracks(tracks: &[String], pacing_enabled: bool) -> Self {
        let has_caller = tracks
            .iter()
            .any(|track| track == "inbound" || track == "both_tracks");
        if pacing_enabled && has_caller {
            PlaybackMode::Paced
        } else {
            PlaybackMode::Passthrough
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Started,
    Receiving,
}

/// Per-session counters.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub frames_received: AtomicU64,
    pub batches_forwarded: AtomicU64,
    pub batches_requeued: AtomicU64,
    pub bytes_forwarded: AtomicU64,
    pub playback_frames_sent: AtomicU64,
}

/// State of one active call.
pub struct StreamSession<L: UpstreamLink> {
    pub stream_id: String,
    pub call_id: String,
    pub media_format: MediaFormat,
    pub tracks: Vec<String>,
    pub playback: PlaybackMode,
    pub created_at: DateTime<Utc>,
    pending: Mutex<FrameBuffer>,
    upstream: L,
    downstream: DownstreamHandle,
    downlink: Mutex<Option<JoinHandle<()>>>,
    receiving: AtomicBool,
    stats: Arc<SessionStats>,
}

impl<L: UpstreamLink> StreamSession<L> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream_id: String,
        call_id: String,
        media_format: MediaFormat,
        tracks: Vec<String>,
        playback: PlaybackMode,
        buffer_config: FrameBufferConfig,
        upstream: L,
        downstream: DownstreamHandle,
    ) -> Self {
        Self {
            stream_id,
            call_id,
            media_format,
            tracks,
            playback,
            created_at: Utc::now(),
            pending: Mutex::new(FrameBuffer::new(buffer_config)),
            upstream,
            downstream,
            downlink: Mutex::new(None),
            receiving: AtomicBool::new(false),
            stats: Arc::new(SessionStats::default()),
        }
    }

    pub fn upstream(&self) -> &L {
        &self.upstream
    }

    /// Connection the session was opened on.
    pub fn connection_id(&self) -> Uuid {
        self.downstream.connection_id()
    }

    pub fn stats(&self) -> &Arc<SessionStats> {
        &self.stats
    }

    pub fn status(&self) -> SessionStatus {
        if self.receiving.load(Ordering::Relaxed) {
            SessionStatus::Receiving
        } else {
            SessionStatus::Started
        }
    }

    /// Record the task that carries audio back to the caller.
    pub fn attach_downlink(&self, task: JoinHandle<()>) {
        if let Some(previous) = self.downlink.lock().replace(task) {
            previous.abort();
        }
    }

    /// Append a frame. Returns the whole pending batch, swapped out, once the
    /// batch threshold is reached.
    pub fn push_frame(&self, frame: MediaFrame) -> Option<Vec<MediaFrame>> {
        self.receiving.store(true, Ordering::Relaxed);
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);

        let mut pending = self.pending.lock();
        if pending.push(frame) {
            Some(pending.take_batch())
        } else {
            None
        }
    }

    /// Put a batch that failed to forward back in front of newer frames.
    pub fn requeue(&self, batch: Vec<MediaFrame>) {
        self.stats.batches_requeued.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().requeue_front(batch);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Release everything the session owns.
    ///
    /// Drops pending frames, cancels the downlink task (and with it the
    /// pacer's timers), then disconnects the upstream link. The telephony
    /// socket is closed only when `close_downstream` is set, since a session
    /// replaced by a repeated `start` shares its socket with the new one.
    pub async fn teardown(&self, close_downstream: bool) {
        self.pending.lock().clear();
        if let Some(task) = self.downlink.lock().take() {
            task.abort();
        }
        self.upstream.disconnect().await;
        if close_downstream {
            self.downstream.close();
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            stream_id: self.stream_id.clone(),
            call_id: self.call_id.clone(),
            media_format: self.media_format,
            tracks: self.tracks.clone(),
            playback: self.playback,
            status: self.status(),
            created_at: self.created_at,
            pending_frames: self.pending_len(),
            frames_received: self.stats.frames_received.load(Ordering::Relaxed),
            batches_forwarded: self.stats.batches_forwarded.load(Ordering::Relaxed),
            batches_requeued: self.stats.batches_requeued.load(Ordering::Relaxed),
            bytes_forwarded: self.stats.bytes_forwarded.load(Ordering::Relaxed),
            playback_frames_sent: self.stats.playback_frames_sent.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of a session for the API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub stream_id: String,
    pub call_id: String,
    pub media_format: MediaFormat,
    pub tracks: Vec<String>,
    pub playback: PlaybackMode,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub pending_frames: usize,
    pub frames_received: u64,
    pub batches_forwarded: u64,
    pub batches_requeued: u64,
    pub bytes_forwarded: u64,
    pub playback_frames_sent: u64,
}

/// Registry of active sessions keyed by stream id.
pub struct SessionTable<L: UpstreamLink> {
    sessions: RwLock<HashMap<String, Arc<StreamSession<L>>>>,
}

impl<L: UpstreamLink> Default for SessionTable<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: UpstreamLink> SessionTable<L> {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, stream_id: &str) -> Option<Arc<StreamSession<L>>> {
        self.sessions.read().get(stream_id).cloned()
    }

    /// Register a session.
    ///
    /// Returns the live session previously registered under the same id, if
    /// any. The caller must tear it down; it is never dropped silently.
    #[must_use = "a displaced session still owns an open upstream link"]
    pub fn put(&self, session: Arc<StreamSession<L>>) -> Option<Arc<StreamSession<L>>> {
        self.sessions.write().insert(session.stream_id.clone(), session)
    }

    /// Detach and return a session. Removing an absent id is a no-op.
    pub fn remove(&self, stream_id: &str) -> Option<Arc<StreamSession<L>>> {
        self.sessions.write().remove(stream_id)
    }

    /// Remove a session only if it was opened on `connection_id`.
    pub fn remove_owned(&self, stream_id: &str, connection_id: Uuid) -> Option<Arc<StreamSession<L>>> {
        let mut sessions = self.sessions.write();
        match sessions.get(stream_id) {
            Some(session) if session.connection_id() == connection_id => sessions.remove(stream_id),
            _ => None,
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        let sessions: Vec<_> = self.sessions.read().values().cloned().collect();
        sessions.iter().map(|session| session.summary()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::mock::MockConnector;
    use crate::upstream::UpstreamConnector;

    async fn session(connector: &MockConnector, id: &str, downstream: &DownstreamHandle) -> Arc<StreamSession<crate::upstream::mock::MockLink>> {
        let (link, _events) = connector.connect(id).await.unwrap();
        Arc::new(StreamSession::new(
            id.to_string(),
            format!("CA-{}", id),
            MediaFormat::telephony(),
            vec!["inbound".to_string()],
            PlaybackMode::Paced,
            FrameBufferConfig { batch_threshold: 2 },
            link,
            downstream.clone(),
        ))
    }

    #[test]
    fn test_playback_mode_for_tracks() {
        let inbound = vec!["inbound".to_string()];
        let outbound = vec!["outbound".to_string()];
        assert_eq!(PlaybackMode::for_tracks(&inbound, true), PlaybackMode::Paced);
        assert_eq!(PlaybackMode::for_tracks(&inbound, false), PlaybackMode::Passthrough);
        assert_eq!(PlaybackMode::for_tracks(&outbound, true), PlaybackMode::Passthrough);
    }

    #[tokio::test]
    async fn test_table_put_get_remove() {
        let connector = MockConnector::new();
        let (downstream, _rx) = DownstreamHandle::channel();
        let table = SessionTable::new();

        assert!(table.put(session(&connector, "MZ1", &downstream).await).is_none());
        assert_eq!(table.count(), 1);
        assert!(table.get("MZ1").is_some());

        assert!(table.remove("MZ1").is_some());
        assert!(table.remove("MZ1").is_none());
        assert_eq!(table.count(), 0);
    }

    #[tokio::test]
    async fn test_put_returns_displaced_session() {
        let connector = MockConnector::new();
        let (downstream, _rx) = DownstreamHandle::channel();
        let table = SessionTable::new();

        let first = session(&connector, "MZ1", &downstream).await;
        assert!(table.put(first.clone()).is_none());
        let displaced = table.put(session(&connector, "MZ1", &downstream).await).unwrap();
        assert!(Arc::ptr_eq(&displaced, &first));
        assert_eq!(table.count(), 1);
    }

    #[tokio::test]
    async fn test_remove_owned_checks_connection() {
        let connector = MockConnector::new();
        let (mine, _rx1) = DownstreamHandle::channel();
        let (theirs, _rx2) = DownstreamHandle::channel();
        let table = SessionTable::new();

        let _ = table.put(session(&connector, "MZ1", &theirs).await);
        assert!(table.remove_owned("MZ1", mine.connection_id()).is_none());
        assert!(table.remove_owned("MZ1", theirs.connection_id()).is_some());
    }

    #[tokio::test]
    async fn test_push_frame_swaps_batch_and_teardown_disconnects() {
        let connector = MockConnector::new();
        let (downstream, mut rx) = DownstreamHandle::channel();
        let session = session(&connector, "MZ1", &downstream).await;

        assert_eq!(session.status(), SessionStatus::Started);
        assert!(session.push_frame(MediaFrame::new("inbound", vec![1])).is_none());
        assert_eq!(session.status(), SessionStatus::Receiving);
        let batch = session.push_frame(MediaFrame::new("inbound", vec![2])).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(session.pending_len(), 0);

        session.requeue(batch);
        assert_eq!(session.pending_len(), 2);

        session.teardown(true).await;
        assert_eq!(session.pending_len(), 0);
        assert_eq!(connector.link(0).disconnect_count(), 1);
        assert_eq!(rx.try_recv().unwrap(), crate::telephony::DownstreamCommand::Close);
    }
}
