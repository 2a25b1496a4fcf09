//! # Telephony Media-Stream WebSocket
//!
//! The telephony provider connects to `/stream` once per call (as instructed
//! by the TwiML from `/api/voice`) and sends JSON signaling events over it.
//! The same socket carries synthesized audio back to the caller.
//!
//! ## Message Flow:
//! ```text
//! provider --text--> actor --StreamEvent--> run_connection worker --> relay
//! provider <-text--- actor <--DownstreamCommand-- relay / downlink tasks
//! ```
//!
//! ## Key Rust Concepts:
//! - **Actors**: the actor owns the socket; nothing else writes to it directly
//! - **Channels**: events leave the actor through an mpsc sender, and outbound
//!   messages come back in as an actor stream (`ctx.add_stream`)
//! - **tokio::spawn**: the per-connection worker runs on the runtime, so
//!   upstream network calls never block the actor's mailbox

use crate::relay::run_connection;
use crate::state::AppState;
use crate::telephony::events::StreamEvent;
use crate::telephony::{DownstreamCommand, DownstreamHandle};
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How often a ping is sent to the provider.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long without any frame before the socket is considered dead.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Actor owning one telephony socket.
pub struct TelephonyWebSocket {
    state: web::Data<AppState>,

    /// Events to the connection worker; dropped when the socket stops
    inbound: Option<mpsc::UnboundedSender<StreamEvent>>,

    /// Set once `started` has wired up the downstream channel
    connection_id: Option<Uuid>,

    /// Last frame of any kind from the provider
    last_heartbeat: Instant,
}

impl TelephonyWebSocket {
    pub fn new(state: web::Data<AppState>) -> Self {
        Self {
            state,
            inbound: None,
            connection_id: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn on_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let event = match StreamEvent::from_json(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(connection_id = ?self.connection_id, "Malformed stream message ignored: {}", e);
                return;
            }
        };

        if matches!(event, StreamEvent::Unrecognized) {
            debug!(connection_id = ?self.connection_id, raw = %text, "Unrecognized stream event");
        }

        let delivered = self
            .inbound
            .as_ref()
            .map(|inbound| inbound.send(event).is_ok())
            .unwrap_or(false);
        if !delivered {
            warn!(connection_id = ?self.connection_id, "Connection worker has stopped, closing socket");
            ctx.stop();
        }
    }
}

impl Actor for TelephonyWebSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Wire the socket to a connection worker and start the heartbeat.
    fn started(&mut self, ctx: &mut Self::Context) {
        let (downstream, commands) = DownstreamHandle::channel();
        let (inbound, inbound_rx) = mpsc::unbounded_channel();

        ctx.add_stream(UnboundedReceiverStream::new(commands));
        tokio::spawn(run_connection(self.state.relay.clone(), inbound_rx, downstream.clone()));

        self.inbound = Some(inbound);
        self.connection_id = Some(downstream.connection_id());
        self.state.connection_opened();
        info!(connection_id = %downstream.connection_id(), "Telephony socket opened");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(connection_id = ?act.connection_id, "Telephony socket heartbeat timeout, closing");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    /// Dropping the sender ends the worker, which tears down its streams.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.inbound.take();
        self.state.connection_closed();
        info!(connection_id = ?self.connection_id, "Telephony socket closed");
    }
}

/// Frames from the provider.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for TelephonyWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.on_text(&text, ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                warn!(connection_id = ?self.connection_id, bytes = data.len(), "Unexpected binary frame ignored");
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(connection_id = ?self.connection_id, "Provider closed socket: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(connection_id = ?self.connection_id, "Unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(connection_id = ?self.connection_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Messages from the relay for the caller.
impl StreamHandler<DownstreamCommand> for TelephonyWebSocket {
    fn handle(&mut self, command: DownstreamCommand, ctx: &mut Self::Context) {
        match command {
            DownstreamCommand::Text(text) => ctx.text(text),
            DownstreamCommand::Close => {
                debug!(connection_id = ?self.connection_id, "Relay closed socket");
                ctx.close(Some(ws::CloseCode::Normal.into()));
                ctx.stop();
            }
        }
    }

    /// The command stream only ends once every handle is gone; the socket's
    /// own frames decide when it stops.
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

/// WebSocket endpoint handler for `/stream`.
pub async fn telephony_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    debug!("Telephony stream request from: {:?}", req.connection_info().peer_addr());
    ws::start(TelephonyWebSocket::new(app_state), &req, stream)
}
