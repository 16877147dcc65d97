//! A connected client as the hub sees it.

use crate::audio::session::Session;
use crate::hub::{Hub, HubInner};
use crate::transport::Transport;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Outbound message slots per client unless configured otherwise.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

pub type ClientId = Uuid;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("outbound queue is full")]
    Full,

    #[error("outbound queue is closed")]
    Closed,
}

/// One browser connection: its transport, its session and its outbound queue.
///
/// ## Ownership:
/// - the hub holds an `Arc<Client>` while the client is registered
/// - the client holds only a `Weak` reference back to the hub
/// - the session is owned here and closed by the connection handler's reader task
///
/// ## One-shot close:
/// `close` flips an `AtomicBool` with `compare_exchange`, so exactly one caller
/// drops the outbound sender. Producers go through `try_send`, which checks the
/// sender under the same lock, so nothing is ever queued after close.
pub struct Client {
    id: ClientId,
    identity: String,
    transport: Arc<dyn Transport>,
    session: Arc<Session>,
    hub: Weak<HubInner>,
    outbound: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    capacity: usize,
    closed: AtomicBool,
}

impl Client {
    pub fn new(hub: &Hub, transport: Arc<dyn Transport>, session: Arc<Session>) -> Arc<Self> {
        Self::with_capacity(hub, transport, session, OUTBOUND_QUEUE_CAPACITY)
    }

    pub fn with_capacity(
        hub: &Hub,
        transport: Arc<dyn Transport>,
        session: Arc<Session>,
        capacity: usize,
    ) -> Arc<Self> {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Arc::new(Self {
            id: Uuid::new_v4(),
            identity: transport.remote_identity(),
            transport,
            session,
            hub: hub.downgrade(),
            outbound: Mutex::new(Some(tx)),
            outbound_rx: Mutex::new(Some(rx)),
            capacity,
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn remote_identity(&self) -> &str {
        &self.identity
    }

    /// Slots in the outbound queue.
    pub fn queue_capacity(&self) -> usize {
        self.capacity
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// The hub this client was created for, if it still exists.
    pub fn hub(&self) -> Option<Hub> {
        self.hub.upgrade().map(Hub::from_inner)
    }

    /// Queue a message without waiting.
    pub fn try_send(&self, message: Vec<u8>) -> Result<(), SendError> {
        let outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return Err(SendError::Closed);
        };
        tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Close the outbound queue. Returns `true` only for the call that closed it.
    ///
    /// Messages already queued are still delivered; the writer task sends a
    /// close frame once the queue is drained.
    pub fn close(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.outbound.lock().take();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Receiving end of the outbound queue, taken once by the writer task.
    pub fn take_outbound(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.outbound_rx.lock().take()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("session", &self.session.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_client;

    #[tokio::test]
    async fn test_close_is_one_shot() {
        let (hub, _task) = Hub::spawn();
        let (client, _transport) = test_client(&hub, 4);

        assert!(client.close());
        assert!(!client.close());
        assert!(client.is_closed());
        assert_eq!(client.try_send(b"late".to_vec()), Err(SendError::Closed));
    }

    #[tokio::test]
    async fn test_queued_messages_survive_close() {
        let (hub, _task) = Hub::spawn();
        let (client, _transport) = test_client(&hub, 4);
        let mut rx = client.take_outbound().unwrap();

        client.try_send(b"one".to_vec()).unwrap();
        client.close();

        assert_eq!(rx.recv().await, Some(b"one".to_vec()));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_full_queue_reports_full() {
        let (hub, _task) = Hub::spawn();
        let (client, _transport) = test_client(&hub, 1);

        client.try_send(vec![1]).unwrap();
        assert_eq!(client.try_send(vec![2]), Err(SendError::Full));
        assert!(client.hub().is_some());
    }
}
