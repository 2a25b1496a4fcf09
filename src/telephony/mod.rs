//! # Telephony Side
//!
//! Types for the media-stream WebSocket the telephony provider opens for
//! each call, plus the TwiML returned by the voice webhook that asks the
//! provider to open it.
//!
//! The socket itself is owned by an actor in `websocket.rs`. Everything else
//! talks to it through a [`DownstreamHandle`], a cheap clonable sender that
//! never owns the connection.

pub mod events;
pub mod twiml;

use crate::error::{RelayError, RelayResult};
use events::OutboundMessage;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Instructions for the actor that owns a telephony socket.
#[derive(Debug, Clone, PartialEq)]
pub enum DownstreamCommand {
    /// Write one text frame
    Text(String),
    /// Close the socket
    Close,
}

/// Non-owning handle to one telephony socket.
#[derive(Debug, Clone)]
pub struct DownstreamHandle {
    connection_id: Uuid,
    commands: mpsc::UnboundedSender<DownstreamCommand>,
}

impl DownstreamHandle {
    /// Create a handle and the receiver the socket owner drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DownstreamCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        (
            Self {
                connection_id: Uuid::new_v4(),
                commands,
            },
            rx,
        )
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Queue a message for the caller.
    ///
    /// ## Errors:
    /// `Downstream` once the socket owner has gone away.
    pub fn send(&self, message: &OutboundMessage) -> RelayResult<()> {
        let text = message.to_json()?;
        self.commands
            .send(DownstreamCommand::Text(text))
            .map_err(|_| RelayError::Downstream(format!("connection {} is closed", self.connection_id)))
    }

    /// Ask the socket owner to close the connection. No-op if already gone.
    pub fn close(&self) {
        let _ = self.commands.send(DownstreamCommand::Close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_and_close() {
        let (handle, mut rx) = DownstreamHandle::channel();
        handle.send(&OutboundMessage::clear("MZ1")).unwrap();
        handle.close();

        assert_eq!(
            rx.try_recv().unwrap(),
            DownstreamCommand::Text(r#"{"event":"clear","streamSid":"MZ1"}"#.to_string())
        );
        assert_eq!(rx.try_recv().unwrap(), DownstreamCommand::Close);
    }

    #[test]
    fn test_send_after_owner_dropped() {
        let (handle, rx) = DownstreamHandle::channel();
        drop(rx);
        assert!(matches!(
            handle.send(&OutboundMessage::clear("MZ1")),
            Err(RelayError::Downstream(_))
        ));
    }
}
