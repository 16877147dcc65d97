//! # Gemini WebSocket Client
//!
//! One outbound WebSocket to the streaming endpoint, driven by two background tasks.
//!
//! ## Task Layout:
//! ```text
//! process_audio / send_text ──► outbound queue ──► drain task ──► sink
//! stream ──► read pump ──► response queue ──► next_response()
//! ```
//!
//! The drain task is the only writer, so frames go out one at a time in queue
//! order. Both tasks watch a per-connection token; the read pump cancels it on a
//! read error or a close frame, and `close` cancels it through the client's token.
//! Closing the socket is bounded by `CLOSE_TIMEOUT` so a stalled peer cannot
//! hold up shutdown.

use crate::audio::processor::AudioChunk;
use crate::config::GeminiConfig;
use crate::gemini::types::{
    ClientMessage, Frame, ServerResponse, SessionSetup, Turn, CLIENT_CONTENT_FRAME,
    REALTIME_INPUT_FRAME, SETUP_FRAME,
};
use crate::gemini::{RemoteClient, RemoteError};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on flushing and closing the socket.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Messages waiting for the drain task.
#[derive(Debug)]
enum Outbound {
    Audio(AudioChunk),
    Content(Turn),
}

impl Outbound {
    fn to_frame(self) -> Result<String, RemoteError> {
        let json = match self {
            Outbound::Audio(chunk) => {
                Frame::new(REALTIME_INPUT_FRAME, ClientMessage::audio(chunk.data)).to_json()?
            }
            Outbound::Content(turn) => {
                Frame::new(CLIENT_CONTENT_FRAME, ClientMessage::turn(turn)).to_json()?
            }
        };
        Ok(json)
    }
}

/// Client for the Gemini `BidiGenerateContent` endpoint.
///
/// ## Lifecycle:
/// 1. `new` validates configuration and allocates the queues (no I/O)
/// 2. `connect` dials, sends the setup frame, spawns the read pump and drain task
/// 3. `close` cancels both tasks and waits (bounded) for the socket to close
///
/// Audio queued before `connect` is held (up to the queue capacity) and sent
/// once the connection is up.
pub struct GeminiClient {
    config: GeminiConfig,
    endpoint: Url,
    sample_rate: u32,

    outbound_tx: mpsc::Sender<Outbound>,
    outbound_rx: parking_lot::Mutex<Option<mpsc::Receiver<Outbound>>>,

    responses_tx: parking_lot::Mutex<Option<mpsc::Sender<ServerResponse>>>,
    responses_rx: Mutex<mpsc::Receiver<ServerResponse>>,

    /// Owns the write half; finishes once the socket is closed
    drain_task: parking_lot::Mutex<Option<JoinHandle<()>>>,

    cancel: CancellationToken,
    connected: AtomicBool,
    alive: Arc<AtomicBool>,
}

impl GeminiClient {
    /// Create a client for `config`, tagging outgoing audio with `sample_rate`.
    ///
    /// ## Errors:
    /// `InvalidArgument` when no API key is configured or the endpoint URL
    /// does not parse.
    pub fn new(config: &GeminiConfig, sample_rate: u32) -> Result<Self, RemoteError> {
        if config.api_key.trim().is_empty() {
            return Err(RemoteError::InvalidArgument("API key is required".to_string()));
        }
        let endpoint = endpoint_with_key(&config.websocket_url, &config.api_key)?;

        let (outbound_tx, outbound_rx) = mpsc::channel(config.audio_queue_capacity.max(1));
        let (responses_tx, responses_rx) = mpsc::channel(config.response_queue_capacity.max(1));

        Ok(Self {
            config: config.clone(),
            endpoint,
            sample_rate,
            outbound_tx,
            outbound_rx: parking_lot::Mutex::new(Some(outbound_rx)),
            responses_tx: parking_lot::Mutex::new(Some(responses_tx)),
            responses_rx: Mutex::new(responses_rx),
            drain_task: parking_lot::Mutex::new(None),
            cancel: CancellationToken::new(),
            connected: AtomicBool::new(false),
            alive: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Endpoint URL with the API key attached as a query parameter.
    pub fn endpoint_url(&self) -> &str {
        self.endpoint.as_str()
    }

    /// True while the read pump is running on an open connection.
    pub fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn setup_frame(&self) -> Result<String, RemoteError> {
        let setup = SessionSetup {
            model: &self.config.model,
            generation_config: &self.config.generation,
            system_instruction: &self.config.system_instruction,
            tools: Vec::new(),
        };
        Ok(Frame::new(SETUP_FRAME, setup).to_json()?)
    }

    /// Queue a chunk for transmission.
    ///
    /// Never waits: a full queue is reported as `QueueFull` right away.
    pub fn send_audio(&self, chunk: AudioChunk) -> Result<(), RemoteError> {
        self.enqueue(Outbound::Audio(chunk))
    }

    fn enqueue(&self, message: Outbound) -> Result<(), RemoteError> {
        if self.cancel.is_cancelled() {
            return Err(RemoteError::Closed);
        }
        self.outbound_tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RemoteError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => RemoteError::Closed,
        })
    }

    async fn dial(&self) -> Result<WsStream, RemoteError> {
        let timeout = self.config.handshake_timeout();
        let handshake = tokio_tungstenite::connect_async(self.endpoint.as_str());

        let (stream, response) = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| RemoteError::HandshakeTimeout(timeout))?
            .map_err(|e| RemoteError::Connect(e.to_string()))?;

        debug!(status = %response.status(), "Remote handshake complete");
        Ok(stream)
    }

    async fn connect_inner(&self) -> Result<(), RemoteError> {
        let setup = self.setup_frame()?;
        let stream = self.dial().await?;
        let (mut sink, stream) = stream.split();

        send_setup(&mut sink, setup, self.config.handshake_timeout()).await?;

        let outbound_rx = self.outbound_rx.lock().take();
        let responses_tx = self.responses_tx.lock().take();
        let (Some(outbound_rx), Some(responses_tx)) = (outbound_rx, responses_tx) else {
            close_sink(&mut sink).await;
            return Err(RemoteError::Closed);
        };

        let connection = self.cancel.child_token();
        self.alive.store(true, Ordering::SeqCst);

        tokio::spawn(read_pump(stream, responses_tx, self.alive.clone(), connection.clone()));
        let drain = tokio::spawn(drain_outbound(outbound_rx, sink, connection));
        *self.drain_task.lock() = Some(drain);

        Ok(())
    }
}

/// Parse the configured endpoint and attach `key` unless the URL already has one.
fn endpoint_with_key(websocket_url: &str, api_key: &str) -> Result<Url, RemoteError> {
    let mut url = Url::parse(websocket_url)
        .map_err(|e| RemoteError::InvalidArgument(format!("invalid websocket URL {:?}: {}", websocket_url, e)))?;

    if !url.query_pairs().any(|(name, _)| name == "key") {
        url.query_pairs_mut().append_pair("key", api_key);
    }
    Ok(url)
}

#[async_trait]
impl RemoteClient for GeminiClient {
    async fn connect(&self) -> Result<(), RemoteError> {
        if self.cancel.is_cancelled() {
            return Err(RemoteError::Closed);
        }
        if self
            .connected
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RemoteError::AlreadyConnected);
        }

        info!(url = %self.config.websocket_url, model = %self.config.model, "Connecting to remote endpoint");
        match self.connect_inner().await {
            Ok(()) => {
                info!("Remote session established");
                Ok(())
            }
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                error!(error = %e, "Failed to connect to remote endpoint");
                Err(e)
            }
        }
    }

    async fn close(&self) -> Result<(), RemoteError> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        self.cancel.cancel();
        self.alive.store(false, Ordering::SeqCst);
        // Ends next_response() for clients that never connected
        self.responses_tx.lock().take();

        let drain = self.drain_task.lock().take();
        if let Some(drain) = drain {
            match tokio::time::timeout(CLOSE_TIMEOUT, drain).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Remote drain task failed"),
                Err(_) => warn!("Timed out waiting for the remote connection to close"),
            }
        }

        info!("Remote client closed");
        Ok(())
    }

    fn process_audio(&self, data: Vec<u8>) -> Result<(), RemoteError> {
        self.send_audio(AudioChunk::linear16(data, self.sample_rate))
    }

    fn send_text(&self, turn: Turn) -> Result<(), RemoteError> {
        self.enqueue(Outbound::Content(turn))
    }

    async fn next_response(&self) -> Option<ServerResponse> {
        self.responses_rx.lock().await.recv().await
    }
}

/// Send the setup frame; on failure the socket is closed before the error is returned.
async fn send_setup<S>(sink: &mut S, setup: String, timeout: Duration) -> Result<(), RemoteError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let error = match tokio::time::timeout(timeout, sink.send(Message::Text(setup))).await {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("setup frame not sent within {:?}", timeout),
    };
    close_sink(sink).await;
    Err(RemoteError::Setup(error))
}

/// Close the write half, giving up after `CLOSE_TIMEOUT`.
async fn close_sink<S>(sink: &mut S)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) => {}
        Ok(Err(e)) => debug!(error = %e, "Error closing remote connection"),
        Err(_) => warn!("Timed out closing remote connection"),
    }
}

/// Decode inbound frames and hand them to the response queue.
async fn read_pump(
    mut stream: SplitStream<WsStream>,
    responses: mpsc::Sender<ServerResponse>,
    alive: Arc<AtomicBool>,
    connection: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = connection.cancelled() => break,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerResponse>(&text) {
                Ok(response) => match responses.try_send(response) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("Response queue full, dropping response");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                },
                Err(e) => warn!(error = %e, "Failed to decode remote response"),
            },
            Some(Ok(Message::Binary(data))) => {
                debug!(bytes = data.len(), "Ignoring binary frame from remote");
            }
            Some(Ok(Message::Close(frame))) => {
                info!(?frame, "Remote endpoint closed the connection");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(error = %e, "Error reading from remote endpoint");
                break;
            }
            None => {
                info!("Remote stream ended");
                break;
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    // Stops the drain task, which closes the socket
    connection.cancel();
    debug!("Remote read pump stopped");
}

/// Send queued messages one at a time, then close the socket.
///
/// A send in progress is abandoned as soon as the connection is cancelled.
async fn drain_outbound(
    mut queue: mpsc::Receiver<Outbound>,
    mut sink: SplitSink<WsStream, Message>,
    connection: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = connection.cancelled() => break,
            message = queue.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let frame = match message.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping unencodable outbound message");
                continue;
            }
        };

        let result = tokio::select! {
            _ = connection.cancelled() => break,
            result = sink.send(Message::Text(frame)) => result,
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to send frame to remote endpoint");
        }
    }

    close_sink(&mut sink).await;
    debug!("Remote drain task stopped");
}
