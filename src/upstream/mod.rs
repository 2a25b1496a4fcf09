//! # Upstream AI Link
//!
//! The speech-to-speech AI service each call is bridged to. The relay only
//! sees two seams:
//!
//! - [`UpstreamConnector`]: opens one link per stream
//! - [`UpstreamLink`]: sends caller audio and disconnects
//!
//! Everything the service says back arrives on the event channel returned by
//! `connect`, so consumers await messages instead of registering callbacks.
//!
//! ## Key Rust Concepts:
//! - **Return-position `impl Future` in traits**: async trait methods without boxing
//! - **Associated types**: each connector names the link type it produces

pub mod gemini;

use crate::error::RelayResult;
use std::future::Future;
use tokio::sync::mpsc;

/// Events emitted by an upstream link, in the order the service produced them.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// Synthesized speech as PCM16 little-endian at the upstream output rate
    Audio(Vec<u8>),
    /// The link finished its handshake
    Open,
    /// The link is gone; no further events follow
    Close,
    /// The caller barged in and the model abandoned its current answer
    Interrupted,
    /// The model finished its turn
    TurnComplete,
}

/// Receiving half of a link's event channel.
pub type UpstreamEvents = mpsc::UnboundedReceiver<UpstreamEvent>;

/// Opens links to the AI service.
pub trait UpstreamConnector: Send + Sync + 'static {
    type Link: UpstreamLink;

    /// Open a link for `stream_id`.
    ///
    /// Resolves once the service has acknowledged the session.
    fn connect(
        &self,
        stream_id: &str,
    ) -> impl Future<Output = RelayResult<(Self::Link, UpstreamEvents)>> + Send;
}

/// An open link to the AI service, owned by exactly one stream session.
pub trait UpstreamLink: Send + Sync + 'static {
    /// Send one chunk of caller audio described by `mime_type`.
    fn send_audio(&self, pcm: &[u8], mime_type: &str) -> impl Future<Output = RelayResult<()>> + Send;

    /// Close the link. Calling it again is a no-op.
    fn disconnect(&self) -> impl Future<Output = ()> + Send;
}

#[cfg(test)]
pub mod mock {
    //! In-memory connector that records what the relay does with its links.

    use super::*;
    use crate::error::RelayError;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Shared record of one mock link's activity.
    #[derive(Debug, Default)]
    pub struct LinkRecord {
        pub stream_id: String,
        pub sends: Mutex<Vec<(Vec<u8>, String)>>,
        pub disconnects: AtomicUsize,
        pub fail_sends: AtomicBool,
        pub events: Mutex<Option<mpsc::UnboundedSender<UpstreamEvent>>>,
    }

    impl LinkRecord {
        pub fn send_count(&self) -> usize {
            self.sends.lock().len()
        }

        pub fn disconnect_count(&self) -> usize {
            self.disconnects.load(Ordering::SeqCst)
        }

        /// Push an event as if the service had sent it.
        pub fn emit(&self, event: UpstreamEvent) {
            if let Some(tx) = self.events.lock().as_ref() {
                let _ = tx.send(event);
            }
        }
    }

    #[derive(Debug)]
    pub struct MockLink {
        record: Arc<LinkRecord>,
    }

    impl UpstreamLink for MockLink {
        async fn send_audio(&self, pcm: &[u8], mime_type: &str) -> RelayResult<()> {
            if self.record.fail_sends.load(Ordering::SeqCst) {
                return Err(RelayError::UpstreamSend("mock send failure".to_string()));
            }
            self.record.sends.lock().push((pcm.to_vec(), mime_type.to_string()));
            Ok(())
        }

        async fn disconnect(&self) {
            self.record.disconnects.fetch_add(1, Ordering::SeqCst);
            self.record.events.lock().take();
        }
    }

    #[derive(Debug, Default)]
    pub struct MockConnector {
        pub links: Mutex<Vec<Arc<LinkRecord>>>,
        pub fail_connects: AtomicBool,
    }

    impl MockConnector {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn link(&self, index: usize) -> Arc<LinkRecord> {
            self.links.lock()[index].clone()
        }

        pub fn link_for(&self, stream_id: &str) -> Option<Arc<LinkRecord>> {
            self.links
                .lock()
                .iter()
                .rev()
                .find(|record| record.stream_id == stream_id)
                .cloned()
        }
    }

    impl UpstreamConnector for MockConnector {
        type Link = MockLink;

        async fn connect(&self, stream_id: &str) -> RelayResult<(MockLink, UpstreamEvents)> {
            if self.fail_connects.load(Ordering::SeqCst) {
                return Err(RelayError::UpstreamConnect("mock connect failure".to_string()));
            }

            let (tx, rx) = mpsc::unbounded_channel();
            let record = Arc::new(LinkRecord {
                stream_id: stream_id.to_string(),
                events: Mutex::new(Some(tx)),
                ..LinkRecord::default()
            });
            record.emit(UpstreamEvent::Open);
            self.links.lock().push(record.clone());
            Ok((MockLink { record }, rx))
        }
    }
}
