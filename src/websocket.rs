//! # WebSocket Connection Handler
//!
//! Accepts browser connections on `/ws` and relays their audio upstream.
//!
//! ## WebSocket Protocol:
//! - **Client → Server (binary)**: 16-bit little-endian mono PCM at the input sample rate
//! - **Client → Server (text)**: `{"type":"context","role":"user","text":"..."}` adds a text turn
//! - **Server → Client (text)**: `{"type":"transcript","text":"..."}` for model output,
//!   `{"type":"error","text":"..."}` for user-visible failures
//!
//! ## Per-Connection Tasks:
//! 1. **Reader**: frames → session; the single teardown point (unregister, close
//!    session, close transport)
//! 2. **Writer**: outbound queue → transport; sends a close frame when the queue closes
//!    and leaves the transport to shut itself after flushing it
//! 3. **Response forwarder**: session responses → outbound queue
//! 4. **Error forwarder**: session errors → outbound queue

use crate::audio::session::{Session, SessionError, SessionOptions};
use crate::gemini::types::ServerResponse;
use crate::hub::{Client, Hub, SendError, OUTBOUND_QUEUE_CAPACITY};
use crate::state::AppState;
use crate::transport::{self, Frame, Transport};

use actix_web::{web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Messages sent to the browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    /// Model output text
    Transcript { text: String },
    /// A failure the user should know about
    Error { text: String },
}

impl ClientEnvelope {
    fn to_bytes(&self) -> Option<Vec<u8>> {
        match serde_json::to_vec(self) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!(error = %e, "Failed to encode client envelope");
                None
            }
        }
    }
}

/// Text commands accepted from the browser.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Add a text turn to the conversation
    Context {
        #[serde(default = "default_role")]
        role: String,
        text: String,
    },
}

fn default_role() -> String {
    "user".to_string()
}

/// `GET /ws`: upgrade and wire a new client into the hub.
///
/// ## Steps:
/// 1. Obtain the upstream client (shared, or a freshly connected dedicated one)
/// 2. Upgrade to WebSocket
/// 3. Create the session, register the client, spawn its tasks
///
/// Upstream failures happen before the upgrade, so the browser gets a normal
/// HTTP error response instead of a socket that closes immediately.
pub async fn handle_websocket(
    req: HttpRequest,
    payload: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let peer = req
        .connection_info()
        .peer_addr()
        .unwrap_or("unknown")
        .to_string();
    info!(client = %peer, "New WebSocket connection attempt");

    let config = state.get_config();
    let (remote, owns_remote) = state.remote_for_connection().await?;

    let (response, transport) = match transport::upgrade(&req, payload) {
        Ok(upgraded) => upgraded,
        Err(e) => {
            warn!(client = %peer, error = %e, "WebSocket upgrade failed");
            if owns_remote {
                let _ = remote.close().await;
            }
            return Err(e);
        }
    };
    let transport: Arc<dyn Transport> = Arc::new(transport);

    let mut options = SessionOptions::default().with_queue_capacity(config.gateway.session_queue_capacity);
    if !owns_remote {
        options = options.shared_remote();
    }

    match Session::new(remote.clone(), &config.audio, options) {
        Ok(session) => {
            serve(state.hub(), transport, session, config.gateway.client_queue_capacity).await;
            state.record_connection();
        }
        Err(e) => {
            error!(client = %peer, error = %e, "Failed to create session");
            if owns_remote {
                let _ = remote.close().await;
            }
            let _ = transport.close().await;
        }
    }

    Ok(response)
}

/// Register a client for `transport` + `session` and start its four tasks.
pub async fn serve(
    hub: &Hub,
    transport: Arc<dyn Transport>,
    session: Arc<Session>,
    queue_capacity: usize,
) -> Arc<Client> {
    let client = match queue_capacity {
        OUTBOUND_QUEUE_CAPACITY => Client::new(hub, transport, session.clone()),
        capacity => Client::with_capacity(hub, transport, session.clone(), capacity),
    };
    hub.register(client.clone()).await;

    tokio::spawn(read_loop(client.clone()));
    tokio::spawn(write_loop(client.clone()));
    if let Some(responses) = session.take_responses() {
        tokio::spawn(forward_responses(client.clone(), responses));
    }
    if let Some(errors) = session.take_errors() {
        tokio::spawn(forward_errors(client.clone(), errors));
    }

    info!(
        client = %client.remote_identity(),
        session_id = %session.id(),
        queue_capacity = client.queue_capacity(),
        "Client connected"
    );
    client
}

async fn read_loop(client: Arc<Client>) {
    let session = client.session().clone();

    loop {
        let frame = match client.transport().read_message().await {
            Ok(Frame::Close) => {
                debug!(client = %client.remote_identity(), "Client closed the connection");
                break;
            }
            Ok(frame) => frame,
            Err(e) => {
                debug!(client = %client.remote_identity(), error = %e, "Read ended");
                break;
            }
        };

        match frame {
            Frame::Binary(data) => match session.handle_incoming_audio(&data).await {
                Ok(()) => {}
                Err(e) if e.is_capacity() => {
                    warn!(session_id = %session.id(), error = %e, "Backpressure, audio dropped");
                }
                Err(e) => {
                    warn!(session_id = %session.id(), error = %e, "Failed to process audio");
                }
            },
            Frame::Text(text) => handle_command(&session, &text),
            Frame::Close => break,
        }
    }

    // Teardown
    match client.hub() {
        Some(hub) => hub.unregister(client.clone()).await,
        None => {
            client.close();
        }
    }
    if let Err(e) = session.close().await {
        warn!(session_id = %session.id(), error = %e, "Error closing session");
    }
    if let Err(e) = client.transport().close().await {
        debug!(client = %client.remote_identity(), error = %e, "Error closing transport");
    }
    info!(client = %client.remote_identity(), session_id = %session.id(), "Client disconnected");
}

fn handle_command(session: &Session, text: &str) {
    match serde_json::from_str::<ClientCommand>(text) {
        Ok(ClientCommand::Context { role, text }) => {
            if let Err(e) = session.add_context_message(&role, &text) {
                warn!(session_id = %session.id(), error = %e, "Failed to add context message");
            }
        }
        Err(e) => {
            debug!(session_id = %session.id(), error = %e, "Ignoring unrecognized text frame");
        }
    }
}

async fn write_loop(client: Arc<Client>) {
    let Some(mut outbound) = client.take_outbound() else {
        return;
    };
    let transport = client.transport().clone();

    while let Some(message) = outbound.recv().await {
        let frame = match String::from_utf8(message) {
            Ok(text) => Frame::Text(text),
            Err(e) => Frame::Binary(e.into_bytes()),
        };
        if let Err(e) = transport.write_message(frame).await {
            debug!(client = %client.remote_identity(), error = %e, "Write failed");
            let _ = transport.close().await;
            return;
        }
    }

    // Queue closed: the transport shuts down once the close frame is flushed
    if let Err(e) = transport.write_message(Frame::Close).await {
        debug!(client = %client.remote_identity(), error = %e, "Close frame not sent");
        let _ = transport.close().await;
    }
}

async fn forward_responses(client: Arc<Client>, mut responses: mpsc::Receiver<ServerResponse>) {
    while let Some(response) = responses.recv().await {
        let text = response.text();
        if text.is_empty() {
            continue;
        }
        deliver(&client, ClientEnvelope::Transcript { text });
    }
}

async fn forward_errors(client: Arc<Client>, mut errors: mpsc::Receiver<SessionError>) {
    while let Some(error) = errors.recv().await {
        deliver(&client, ClientEnvelope::Error { text: error.to_string() });
    }
}

fn deliver(client: &Client, envelope: ClientEnvelope) {
    let Some(bytes) = envelope.to_bytes() else {
        return;
    };
    match client.try_send(bytes) {
        Ok(()) => {}
        Err(SendError::Full) => {
            warn!(client = %client.remote_identity(), "Outbound queue full, dropping message");
        }
        Err(SendError::Closed) => {
            debug!(client = %client.remote_identity(), "Client closed, dropping message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gemini::types::Turn;
    use crate::testing::{test_audio_settings, wait_until, MockRemote, MockTransport};
    use std::time::Duration;

    async fn connect(hub: &Hub) -> (Arc<Client>, Arc<MockTransport>, Arc<MockRemote>) {
        serve_on(hub, MockTransport::new("10.0.0.7:4242"), 16).await
    }

    async fn serve_on(
        hub: &Hub,
        transport: Arc<MockTransport>,
        queue_capacity: usize,
    ) -> (Arc<Client>, Arc<MockTransport>, Arc<MockRemote>) {
        let remote = MockRemote::new();
        let session = Session::new(remote.clone(), &test_audio_settings(), SessionOptions::default()).unwrap();
        let client = serve(hub, transport.clone(), session, queue_capacity).await;
        (client, transport, remote)
    }

    #[test]
    fn test_envelope_wire_format() {
        let json = serde_json::to_string(&ClientEnvelope::Transcript { text: "hi".into() }).unwrap();
        assert_eq!(json, r#"{"type":"transcript","text":"hi"}"#);
        let json = serde_json::to_string(&ClientEnvelope::Error { text: "boom".into() }).unwrap();
        assert_eq!(json, r#"{"type":"error","text":"boom"}"#);
    }

    #[test]
    fn test_context_command_defaults_role() {
        let command: ClientCommand = serde_json::from_str(r#"{"type":"context","text":"hello"}"#).unwrap();
        let ClientCommand::Context { role, text } = command;
        assert_eq!(role, "user");
        assert_eq!(text, "hello");
    }

    #[tokio::test]
    async fn test_binary_frames_reach_remote() {
        let (hub, _task) = Hub::spawn();
        let (client, transport, remote) = connect(&hub).await;
        assert!(wait_until(|| hub.has_client(&client)).await);

        transport.push(Frame::Binary(vec![1, 2, 3, 4]));
        assert!(wait_until(|| remote.audio_sent() == vec![vec![1, 2, 3, 4]]).await);
    }

    #[tokio::test]
    async fn test_context_text_frame_reaches_remote() {
        let (hub, _task) = Hub::spawn();
        let (_client, transport, remote) = connect(&hub).await;

        transport.push(Frame::Text(r#"{"type":"context","role":"user","text":"be brief"}"#.into()));
        transport.push(Frame::Text("not json".into()));
        assert!(wait_until(|| remote.text_sent() == vec![Turn::text("user", "be brief")]).await);
    }

    #[tokio::test]
    async fn test_responses_are_forwarded_as_transcripts() {
        let (hub, _task) = Hub::spawn();
        let (_client, transport, remote) = connect(&hub).await;

        remote.push_response(ServerResponse::default());
        remote.push_response(ServerResponse {
            model_turn: Turn::text("model", "hello there"),
            ..Default::default()
        });

        assert!(wait_until(|| !transport.written_json().is_empty()).await);
        let messages = transport.written_json();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0], serde_json::json!({"type": "transcript", "text": "hello there"}));
    }

    #[tokio::test]
    async fn test_remote_loss_is_reported_to_client() {
        let (hub, _task) = Hub::spawn();
        let (_client, transport, remote) = connect(&hub).await;

        remote.end_responses();

        assert!(wait_until(|| {
            transport
                .written_json()
                .contains(&serde_json::json!({"type": "error", "text": "remote connection closed"}))
        })
        .await);
    }

    #[tokio::test]
    async fn test_disconnect_tears_everything_down() {
        let (hub, _task) = Hub::spawn();
        let (client, transport, remote) = connect(&hub).await;
        assert!(wait_until(|| hub.count() == 1).await);

        transport.disconnect();

        assert!(wait_until(|| hub.count() == 0).await);
        assert!(wait_until(|| transport.is_closed()).await);
        assert!(client.is_closed());
        assert!(!client.session().is_active());
        assert!(wait_until(|| remote.close_count() == 1).await);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_connected_client() {
        let (hub, _task) = Hub::spawn();
        let (client, transport, _remote) = connect(&hub).await;
        assert!(wait_until(|| hub.has_client(&client)).await);

        hub.broadcast(br#"{"type":"transcript","text":"all hands"}"#.to_vec()).await;

        assert!(wait_until(|| {
            transport.written().contains(&Frame::Text(r#"{"type":"transcript","text":"all hands"}"#.into()))
        })
        .await);
    }

    #[tokio::test]
    async fn test_hub_stop_sends_close_frame() {
        let (hub, task) = Hub::spawn();
        let (_client, transport, _remote) = connect(&hub).await;
        assert!(wait_until(|| hub.count() == 1).await);

        hub.stop();
        task.await.unwrap();

        assert!(wait_until(|| transport.is_closed()).await);
        assert_eq!(transport.written().last(), Some(&Frame::Close));
    }

    #[tokio::test]
    async fn test_default_capacity_client() {
        let (hub, _task) = Hub::spawn();
        let (client, _transport, _remote) =
            serve_on(&hub, MockTransport::new("10.0.0.8:4242"), OUTBOUND_QUEUE_CAPACITY).await;
        assert_eq!(client.queue_capacity(), OUTBOUND_QUEUE_CAPACITY);

        let (client, _transport, _remote) = connect(&hub).await;
        assert_eq!(client.queue_capacity(), 16);
    }

    #[tokio::test]
    async fn test_queued_messages_flushed_before_close_frame() {
        let (hub, _task) = Hub::spawn();
        let transport = MockTransport::ignoring_close_frames("10.0.0.9:4242");
        let (client, transport, _remote) = serve_on(&hub, transport, 16).await;

        client.try_send(b"first".to_vec()).unwrap();
        client.try_send(b"second".to_vec()).unwrap();
        client.close();

        assert!(wait_until(|| transport.written().last() == Some(&Frame::Close)).await);
        assert_eq!(
            transport.written(),
            vec![Frame::Text("first".into()), Frame::Text("second".into()), Frame::Close]
        );

        // Shutting the socket is left to the transport once it flushes the close frame
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!transport.is_closed());
    }
}
