//! # Session State Management
//!
//! A session is the per-connection conversation: it owns the audio processor,
//! holds a reference to the upstream client, records the turns exchanged so far
//! and exposes two queues (responses, errors) the connection handler forwards
//! to the browser.
//!
//! ## Session Lifecycle:
//! 1. **Created**: id generated, response loop (and pipeline loop in streaming mode) spawned
//! 2. **Active**: audio and context messages accepted
//! 3. **Closed**: background tasks cancelled, queues closed, owned upstream client closed
//!
//! ## Thread Safety:
//! Mutable state lives behind a `parking_lot::RwLock`. Audio submissions take
//! the read lock so they can run concurrently; state changes take the write lock.

use crate::audio::processor::{AudioChunk, AudioError, AudioProcessor};
use crate::config::AudioSettings;
use crate::gemini::types::{ServerResponse, Turn};
use crate::gemini::{RemoteClient, RemoteError};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rand::{Rng, RngCore};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const ID_SUFFIX_LEN: usize = 6;

/// Default capacity of the response and error queues.
pub const SESSION_QUEUE_CAPACITY: usize = 10;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("session is not active")]
    Inactive,

    #[error("audio processing error: {0}")]
    Audio(#[from] AudioError),

    #[error("remote client error: {0}")]
    Remote(#[from] RemoteError),

    #[error("audio pipeline error: {0}")]
    Pipeline(AudioError),

    #[error("audio transmission error: {0}")]
    Transmission(RemoteError),

    #[error("remote connection closed")]
    RemoteClosed,
}

impl SessionError {
    /// Backpressure conditions: logged by callers, never shown to the user.
    pub fn is_capacity(&self) -> bool {
        match self {
            SessionError::Audio(e) | SessionError::Pipeline(e) => e.is_capacity(),
            SessionError::Remote(e) | SessionError::Transmission(e) => e.is_capacity(),
            _ => false,
        }
    }
}

/// Optional knobs for `Session::new`.
///
/// ## Usage Example:
/// ```rust
/// let options = SessionOptions::default()
///     .shared_remote()
///     .with_rng(StdRng::seed_from_u64(7));
/// ```
pub struct SessionOptions {
    owns_remote: bool,
    queue_capacity: usize,
    rng: Option<Box<dyn RngCore + Send>>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            owns_remote: true,
            queue_capacity: SESSION_QUEUE_CAPACITY,
            rng: None,
        }
    }
}

impl SessionOptions {
    /// The remote client is shared with other sessions; `close` leaves it open.
    pub fn shared_remote(mut self) -> Self {
        self.owns_remote = false;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Random source for the id suffix (defaults to the thread-local generator).
    pub fn with_rng(mut self, rng: impl RngCore + Send + 'static) -> Self {
        self.rng = Some(Box::new(rng));
        self
    }
}

struct SessionState {
    active: bool,
    turns: Vec<Turn>,
    responses_tx: Option<mpsc::Sender<ServerResponse>>,
    errors_tx: Option<mpsc::Sender<SessionError>>,
}

/// One client's conversation with the upstream model.
pub struct Session {
    id: String,
    remote: Arc<dyn RemoteClient>,
    owns_remote: bool,
    processor: AudioProcessor,
    state: RwLock<SessionState>,
    responses_rx: Mutex<Option<mpsc::Receiver<ServerResponse>>>,
    errors_rx: Mutex<Option<mpsc::Receiver<SessionError>>>,
    cancel: CancellationToken,
}

impl Session {
    /// Create a session bound to `remote` and start its background loops.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        settings: &AudioSettings,
        mut options: SessionOptions,
    ) -> Result<Arc<Self>, SessionError> {
        let id = match options.rng.as_mut() {
            Some(rng) => generate_session_id(rng.as_mut()),
            None => generate_session_id(&mut rand::thread_rng()),
        };

        let (responses_tx, responses_rx) = mpsc::channel(options.queue_capacity);
        let (errors_tx, errors_rx) = mpsc::channel(options.queue_capacity);

        let session = Arc::new(Self {
            id,
            remote: remote.clone(),
            owns_remote: options.owns_remote,
            processor: AudioProcessor::new(settings),
            state: RwLock::new(SessionState {
                active: true,
                turns: Vec::new(),
                responses_tx: Some(responses_tx),
                errors_tx: Some(errors_tx),
            }),
            responses_rx: Mutex::new(Some(responses_rx)),
            errors_rx: Mutex::new(Some(errors_rx)),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(response_loop(Arc::downgrade(&session), remote.clone(), session.cancel.clone()));

        if session.processor.is_streaming() {
            session.processor.start(session.processor.chunk_size())?;
            let output = session.processor.take_output();
            let errors = session.processor.take_errors();
            if let (Some(output), Some(errors)) = (output, errors) {
                tokio::spawn(pipeline_loop(
                    Arc::downgrade(&session),
                    remote,
                    output,
                    errors,
                    session.cancel.clone(),
                ));
            }
        }

        info!(session_id = %session.id, streaming = session.processor.is_streaming(), "Session created");
        Ok(session)
    }

    /// Like `new`, for callers whose remote client or settings may be absent.
    ///
    /// A missing remote client is an `InvalidArgument` error; missing settings
    /// fall back to `AudioSettings::default()`.
    pub fn try_new(
        remote: Option<Arc<dyn RemoteClient>>,
        settings: Option<&AudioSettings>,
        options: SessionOptions,
    ) -> Result<Arc<Self>, SessionError> {
        let remote = remote.ok_or(SessionError::InvalidArgument("remote client cannot be absent"))?;
        match settings {
            Some(settings) => Self::new(remote, settings, options),
            None => Self::new(remote, &AudioSettings::default(), options),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_active(&self) -> bool {
        self.state.read().active
    }

    /// Snapshot of the conversation so far.
    pub fn turns(&self) -> Vec<Turn> {
        self.state.read().turns.clone()
    }

    /// Normalize client audio and queue it upstream.
    ///
    /// ## Behaviour by mode:
    /// - **Synchronous**: every complete frame is resampled and handed to the
    ///   remote client before this returns
    /// - **Streaming**: the bytes go into the ring buffer; the pipeline loop
    ///   forwards them later
    ///
    /// ## Errors:
    /// - `Inactive` once the session is closed
    /// - `Audio(..)` for invalid input or a full buffer
    /// - `Remote(..)` when the remote client rejects a chunk (`QueueFull` is backpressure);
    ///   frames already sent stay sent and the rest of the message is dropped
    pub async fn handle_incoming_audio(&self, raw: &[u8]) -> Result<(), SessionError> {
        if !self.is_active() {
            return Err(SessionError::Inactive);
        }

        if self.processor.is_streaming() {
            self.processor.write(raw).await?;
            return Ok(());
        }

        let chunks = self.processor.accumulate(raw)?;
        let total = chunks.len();
        for (sent, chunk) in chunks.into_iter().enumerate() {
            if let Err(e) = self.remote.process_audio(chunk.data) {
                warn!(
                    session_id = %self.id,
                    error = %e,
                    dropped = total - sent,
                    total,
                    "Remote rejected audio, dropping the rest of this message"
                );
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Record a text turn and send it upstream as client content.
    pub fn add_context_message(&self, role: &str, text: &str) -> Result<(), SessionError> {
        let turn = Turn::text(role, text);
        {
            let mut state = self.state.write();
            if !state.active {
                return Err(SessionError::Inactive);
            }
            state.turns.push(turn.clone());
        }

        self.remote.send_text(turn)?;
        debug!(session_id = %self.id, role, "Context message sent");
        Ok(())
    }

    /// Receiving end of the response queue (handed out once).
    pub fn take_responses(&self) -> Option<mpsc::Receiver<ServerResponse>> {
        self.responses_rx.lock().take()
    }

    /// Receiving end of the error queue (handed out once).
    pub fn take_errors(&self) -> Option<mpsc::Receiver<SessionError>> {
        self.errors_rx.lock().take()
    }

    /// Deactivate the session and release everything it owns.
    ///
    /// Only the first call does anything; later calls return `Ok(())`. The
    /// remote client is closed only when this session owns it, and its close
    /// error (if any) is returned.
    pub async fn close(&self) -> Result<(), SessionError> {
        {
            let mut state = self.state.write();
            if !state.active {
                return Ok(());
            }
            state.active = false;
            state.responses_tx = None;
            state.errors_tx = None;
        }

        self.cancel.cancel();
        self.processor.stop();
        info!(session_id = %self.id, turns = self.state.read().turns.len(), "Session closed");

        if self.owns_remote {
            self.remote.close().await?;
        }
        Ok(())
    }

    fn handle_response(&self, response: ServerResponse) {
        let mut state = self.state.write();
        if !state.active {
            return;
        }

        if !response.model_turn.role.is_empty() {
            state.turns.push(response.model_turn.clone());
        }

        if let Some(tx) = &state.responses_tx {
            match tx.try_send(response) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(session_id = %self.id, "Response queue full, dropping response");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(session_id = %self.id, "Response queue closed");
                }
            }
        }
    }

    fn report_error(&self, error: SessionError) {
        let state = self.state.read();
        if !state.active {
            return;
        }
        if let Some(tx) = &state.errors_tx {
            if let Err(e) = tx.try_send(error) {
                warn!(session_id = %self.id, error = %e, "Error queue unavailable, dropping error");
            }
        }
    }
}

/// Build `YYYYMMDDhhmmss-xxxxxx` from the current UTC time and `rng`.
pub fn generate_session_id(rng: &mut dyn RngCore) -> String {
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| ID_CHARSET[rng.gen_range(0..ID_CHARSET.len())] as char)
        .collect();
    format!("{}-{}", Utc::now().format("%Y%m%d%H%M%S"), suffix)
}

/// Move remote responses into the session until the stream ends or the session closes.
async fn response_loop(session: Weak<Session>, remote: Arc<dyn RemoteClient>, cancel: CancellationToken) {
    loop {
        let response = tokio::select! {
            _ = cancel.cancelled() => return,
            response = remote.next_response() => response,
        };

        let Some(session) = session.upgrade() else {
            return;
        };

        match response {
            Some(response) => session.handle_response(response),
            None => {
                if session.is_active() {
                    warn!(session_id = %session.id, "Remote response stream ended");
                    session.report_error(SessionError::RemoteClosed);
                }
                return;
            }
        }
    }
}

/// Streaming mode: forward drained chunks upstream and surface pipeline errors.
async fn pipeline_loop(
    session: Weak<Session>,
    remote: Arc<dyn RemoteClient>,
    mut output: mpsc::Receiver<AudioChunk>,
    mut errors: mpsc::Receiver<AudioError>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            Some(error) = errors.recv() => {
                if error.is_capacity() {
                    warn!(error = %error, "Audio pipeline backpressure");
                } else if let Some(session) = session.upgrade() {
                    session.report_error(SessionError::Pipeline(error));
                }
            }
            chunk = output.recv() => {
                let Some(chunk) = chunk else { return };
                if let Err(e) = remote.process_audio(chunk.data) {
                    if e.is_capacity() {
                        warn!(error = %e, "Remote audio queue full, chunk dropped");
                    } else if let Some(session) = session.upgrade() {
                        session.report_error(SessionError::Transmission(e));
                    }
                }
            }
        }
    }
}
