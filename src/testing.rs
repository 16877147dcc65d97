//! Test doubles shared by the unit tests: a scripted transport, a recording
//! remote client and a couple of small helpers.

use crate::audio::session::{Session, SessionOptions};
use crate::config::AudioSettings;
use crate::gemini::types::{ServerResponse, Turn};
use crate::gemini::{RemoteClient, RemoteError};
use crate::hub::{Client, Hub};
use crate::transport::{Frame, Transport, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Equal rates and 4-byte frames, so forwarded audio equals the input bytes.
pub fn test_audio_settings() -> AudioSettings {
    AudioSettings {
        input_sample_rate: 16000,
        output_sample_rate: 16000,
        buffer_size: 64,
        chunk_size: 4,
        streaming: false,
    }
}

/// Poll `condition` every few milliseconds for up to two seconds.
pub async fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// A client with a mock transport and a session on a mock remote.
pub fn test_client(hub: &Hub, capacity: usize) -> (Arc<Client>, Arc<MockTransport>) {
    let transport = MockTransport::new("127.0.0.1:5000");
    let session = Session::new(MockRemote::new(), &test_audio_settings(), SessionOptions::default())
        .expect("session");
    let client = Client::with_capacity(hub, transport.clone(), session, capacity);
    (client, transport)
}

/// Transport whose inbound frames are pushed by the test and whose outbound
/// frames are recorded.
///
/// Like the actix bridge, writing `Frame::Close` shuts the transport down
/// unless it was built with `ignoring_close_frames`.
pub struct MockTransport {
    identity: String,
    shuts_on_close_frame: bool,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    written: Mutex<Vec<Frame>>,
    closed: AtomicBool,
}

impl MockTransport {
    pub fn new(identity: &str) -> Arc<Self> {
        Self::build(identity, true)
    }

    /// A transport that records close frames but stays open after them.
    pub fn ignoring_close_frames(identity: &str) -> Arc<Self> {
        Self::build(identity, false)
    }

    fn build(identity: &str, shuts_on_close_frame: bool) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            identity: identity.to_string(),
            shuts_on_close_frame,
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: tokio::sync::Mutex::new(rx),
            written: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Simulate a frame from the client.
    pub fn push(&self, frame: Frame) {
        if let Some(tx) = self.inbound_tx.lock().as_ref() {
            let _ = tx.send(frame);
        }
    }

    /// Simulate the client going away: pending reads fail with `Closed`.
    pub fn disconnect(&self) {
        self.inbound_tx.lock().take();
    }

    pub fn written(&self) -> Vec<Frame> {
        self.written.lock().clone()
    }

    /// Text frames written so far, parsed as JSON.
    pub fn written_json(&self) -> Vec<serde_json::Value> {
        self.written()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Text(text) => serde_json::from_str(&text).ok(),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn remote_identity(&self) -> String {
        self.identity.clone()
    }

    async fn write_message(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let shut = frame == Frame::Close && self.shuts_on_close_frame;
        self.written.lock().push(frame);
        if shut {
            self.closed.store(true, Ordering::SeqCst);
            self.disconnect();
        }
        Ok(())
    }

    async fn read_message(&self) -> Result<Frame, TransportError> {
        self.inbound_rx.lock().await.recv().await.ok_or(TransportError::Closed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        self.disconnect();
        Ok(())
    }
}

/// Remote client that records what it is sent and replays scripted responses.
pub struct MockRemote {
    audio: Mutex<Vec<Vec<u8>>>,
    text: Mutex<Vec<Turn>>,
    responses_tx: Mutex<Option<mpsc::UnboundedSender<ServerResponse>>>,
    responses_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerResponse>>,
    queue_full: AtomicBool,
    audio_limit: AtomicUsize,
    closes: AtomicUsize,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            audio: Mutex::new(Vec::new()),
            text: Mutex::new(Vec::new()),
            responses_tx: Mutex::new(Some(tx)),
            responses_rx: tokio::sync::Mutex::new(rx),
            queue_full: AtomicBool::new(false),
            audio_limit: AtomicUsize::new(usize::MAX),
            closes: AtomicUsize::new(0),
        })
    }

    pub fn push_response(&self, response: ServerResponse) {
        if let Some(tx) = self.responses_tx.lock().as_ref() {
            let _ = tx.send(response);
        }
    }

    /// End the response stream as a dropped upstream connection would.
    pub fn end_responses(&self) {
        self.responses_tx.lock().take();
    }

    /// Make `process_audio` report `QueueFull`.
    pub fn set_queue_full(&self, full: bool) {
        self.queue_full.store(full, Ordering::SeqCst);
    }

    /// Report `QueueFull` once `limit` chunks have been accepted in total.
    pub fn set_audio_limit(&self, limit: usize) {
        self.audio_limit.store(limit, Ordering::SeqCst);
    }

    pub fn audio_sent(&self) -> Vec<Vec<u8>> {
        self.audio.lock().clone()
    }

    pub fn text_sent(&self) -> Vec<Turn> {
        self.text.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteClient for MockRemote {
    async fn connect(&self) -> Result<(), RemoteError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), RemoteError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.end_responses();
        Ok(())
    }

    fn process_audio(&self, data: Vec<u8>) -> Result<(), RemoteError> {
        if self.queue_full.load(Ordering::SeqCst) {
            return Err(RemoteError::QueueFull);
        }
        let mut audio = self.audio.lock();
        if audio.len() >= self.audio_limit.load(Ordering::SeqCst) {
            return Err(RemoteError::QueueFull);
        }
        audio.push(data);
        Ok(())
    }

    fn send_text(&self, turn: Turn) -> Result<(), RemoteError> {
        self.text.lock().push(turn);
        Ok(())
    }

    async fn next_response(&self) -> Option<ServerResponse> {
        self.responses_rx.lock().await.recv().await
    }
}
