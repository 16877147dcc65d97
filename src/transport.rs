//! # Client Transport
//!
//! The connection handler talks to browsers through the `Transport` trait so its
//! read/write tasks can run as plain Tokio tasks (and be tested with a mock).
//! `WsTransport` implements it on top of an actix-web-actors WebSocket.
//!
//! ## Bridge Layout:
//! ```text
//! browser ──► WsBridge actor ──► inbound channel ──► read_message()
//! browser ◄── WsBridge actor ◄── outbound channel ◄── write_message()
//! ```
//!
//! The actor also answers pings and runs the heartbeat, so protocol-level
//! frames never reach the connection handler.

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often the bridge pings the browser.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Silence longer than this drops the connection.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Frames buffered in each direction between the actor and the tasks.
const FRAME_QUEUE_CAPACITY: usize = 64;

/// An application-level WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("websocket protocol error: {0}")]
    Protocol(String),
}

/// Bidirectional frame transport for one client connection.
///
/// ## Rust Concepts:
/// - **#[async_trait]**: async methods on a trait object (`Arc<dyn Transport>`)
/// - **&self everywhere**: the reader and writer tasks share one transport, so
///   implementations handle their own interior mutability
#[async_trait]
pub trait Transport: Send + Sync {
    /// Peer address (or another human-readable identity) for logging.
    fn remote_identity(&self) -> String;

    async fn write_message(&self, frame: Frame) -> Result<(), TransportError>;

    /// Next frame from the client. `Err(Closed)` once the connection is gone.
    async fn read_message(&self) -> Result<Frame, TransportError>;

    /// Close the connection. Safe to call more than once.
    async fn close(&self) -> Result<(), TransportError>;
}

/// `Transport` backed by an actix WebSocket actor.
pub struct WsTransport {
    peer: String,
    inbound: Mutex<mpsc::Receiver<Result<Frame, TransportError>>>,
    outbound: mpsc::Sender<Frame>,
    closed: CancellationToken,
}

#[async_trait]
impl Transport for WsTransport {
    fn remote_identity(&self) -> String {
        self.peer.clone()
    }

    async fn write_message(&self, frame: Frame) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            sent = self.outbound.send(frame) => sent.map_err(|_| TransportError::Closed),
        }
    }

    async fn read_message(&self) -> Result<Frame, TransportError> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            frame = inbound.recv() => frame.unwrap_or(Err(TransportError::Closed)),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.cancel();
        Ok(())
    }
}

/// Upgrade an HTTP request to a WebSocket and wrap it in a `WsTransport`.
///
/// ## Returns:
/// - the `101 Switching Protocols` response to hand back to actix-web
/// - the transport the connection handler reads from and writes to
pub fn upgrade(req: &HttpRequest, payload: web::Payload) -> Result<(HttpResponse, WsTransport), actix_web::Error> {
    let peer = req
        .connection_info()
        .peer_addr()
        .unwrap_or("unknown")
        .to_string();

    let (inbound_tx, inbound_rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
    let (outbound_tx, outbound_rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
    let closed = CancellationToken::new();

    let bridge = WsBridge {
        peer: peer.clone(),
        inbound: inbound_tx,
        outbound: Some(outbound_rx),
        closed: closed.clone(),
        last_heartbeat: Instant::now(),
    };
    let response = ws::start(bridge, req, payload)?;

    let transport = WsTransport {
        peer,
        inbound: Mutex::new(inbound_rx),
        outbound: outbound_tx,
        closed,
    };
    Ok((response, transport))
}

/// Actor that owns the actual WebSocket and shuttles frames through channels.
struct WsBridge {
    peer: String,
    inbound: mpsc::Sender<Result<Frame, TransportError>>,
    outbound: Option<mpsc::Receiver<Frame>>,
    closed: CancellationToken,
    last_heartbeat: Instant,
}

impl WsBridge {
    /// Hand a frame to the reader task.
    ///
    /// `ctx.wait` pauses the actor until the frame is accepted, so a slow reader
    /// slows the socket down instead of growing a queue.
    fn forward(&self, frame: Result<Frame, TransportError>, ctx: &mut ws::WebsocketContext<Self>) {
        let inbound = self.inbound.clone();
        let closed = self.closed.clone();
        ctx.wait(
            async move {
                tokio::select! {
                    _ = closed.cancelled() => {}
                    _ = inbound.send(frame) => {}
                }
            }
            .into_actor(self),
        );
    }
}

impl Actor for WsBridge {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(client = %self.peer, "WebSocket connection started");

        if let Some(outbound) = self.outbound.take() {
            ctx.add_stream(ReceiverStream::new(outbound));
        }

        // Close the socket when the connection handler closes the transport
        let closed = self.closed.clone();
        ctx.spawn(
            async move { closed.cancelled().await }
                .into_actor(self)
                .map(|_, _act, ctx| {
                    ctx.close(None);
                    ctx.stop();
                }),
        );

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(client = %act.peer, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.closed.cancel();
        info!(client = %self.peer, "WebSocket connection stopped");
    }
}

/// Frames arriving from the browser.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsBridge {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.forward(Ok(Frame::Binary(data.to_vec())), ctx);
            }
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.forward(Ok(Frame::Text(text.to_string())), ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(client = %self.peer, ?reason, "Client sent close frame");
                self.forward(Ok(Frame::Close), ctx);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(client = %self.peer, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(client = %self.peer, error = %err, "WebSocket protocol error");
                self.forward(Err(TransportError::Protocol(err.to_string())), ctx);
                ctx.stop();
            }
        }
    }
}

/// Frames queued by the writer task.
impl StreamHandler<Frame> for WsBridge {
    fn handle(&mut self, frame: Frame, ctx: &mut Self::Context) {
        match frame {
            Frame::Text(text) => ctx.text(text),
            Frame::Binary(data) => ctx.binary(data),
            Frame::Close => {
                ctx.close(None);
                ctx.stop();
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        ctx.close(None);
        ctx.stop();
    }
}
