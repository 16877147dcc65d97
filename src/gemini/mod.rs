//! # Remote Protocol Client
//!
//! Everything that talks to the upstream Gemini streaming endpoint.
//!
//! ## Key Components:
//! - **RemoteClient**: the seam sessions program against (mocked in tests)
//! - **GeminiClient**: the WebSocket implementation with its read pump and send queue
//! - **types**: the JSON frame shapes exchanged with the endpoint

pub mod client;
pub mod types;

pub use client::GeminiClient;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use types::{ServerResponse, Turn};

/// Failures of the upstream connection.
///
/// ## Categories:
/// - **Invalid argument**: `InvalidArgument` (missing API key, unparsable endpoint URL)
/// - **Connection**: `Connect`, `HandshakeTimeout`, `Setup`, `Closed`, `AlreadyConnected`
/// - **Capacity**: `QueueFull` (log and move on)
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to connect to remote endpoint: {0}")]
    Connect(String),

    #[error("remote handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("failed to send session setup: {0}")]
    Setup(String),

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("audio queue is full")]
    QueueFull,

    #[error("remote client is already connected")]
    AlreadyConnected,

    #[error("remote client is closed")]
    Closed,
}

impl RemoteError {
    pub fn is_capacity(&self) -> bool {
        matches!(self, RemoteError::QueueFull)
    }
}

/// Operations a session needs from its upstream connection.
///
/// ## Rust Concepts:
/// - **#[async_trait]**: lets the trait carry `async fn` while staying object safe,
///   so sessions can hold an `Arc<dyn RemoteClient>`
/// - **Send + Sync**: the same client may be shared by every connection's tasks
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Dial the endpoint, send the setup frame and start the background tasks.
    async fn connect(&self) -> Result<(), RemoteError>;

    /// Stop the background tasks and close the connection. Repeat calls are no-ops.
    async fn close(&self) -> Result<(), RemoteError>;

    /// Queue PCM bytes for transmission without waiting.
    fn process_audio(&self, data: Vec<u8>) -> Result<(), RemoteError>;

    /// Queue a complete conversational turn without waiting.
    fn send_text(&self, turn: Turn) -> Result<(), RemoteError>;

    /// Next decoded response, or `None` once the response stream has ended.
    async fn next_response(&self) -> Option<ServerResponse>;
}
