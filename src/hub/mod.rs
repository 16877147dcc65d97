//! # Connection Hub
//!
//! Process-wide registry of connected clients with message fan-out.
//!
//! ## Design:
//! A single coordination task owns every change to the client map. Callers
//! submit requests through bounded queues (register, unregister, broadcast) and
//! a cancellation token (stop), so the map is never mutated concurrently.
//! Read-only queries (`count`, `has_client`) go through a `RwLock` and never
//! touch the queues.
//!
//! ## Policies:
//! - **Duplicate registration**: ignored
//! - **Unknown unregistration**: ignored
//! - **Slow clients**: a broadcast that finds a client's queue full removes and
//!   closes that client; everyone else still gets the message
//! - **After stop**: submissions are logged and the submitted client is closed

pub mod client;

pub use client::{Client, ClientId, SendError, OUTBOUND_QUEUE_CAPACITY};

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Register/unregister queue depth.
const MEMBERSHIP_QUEUE_CAPACITY: usize = 1;

/// Broadcast queue depth.
const BROADCAST_QUEUE_CAPACITY: usize = 16;

pub(crate) struct HubInner {
    register_tx: mpsc::Sender<Arc<Client>>,
    unregister_tx: mpsc::Sender<Arc<Client>>,
    broadcast_tx: mpsc::Sender<Vec<u8>>,
    shutdown: CancellationToken,
    clients: RwLock<HashMap<ClientId, Arc<Client>>>,
}

struct HubQueues {
    register_rx: mpsc::Receiver<Arc<Client>>,
    unregister_rx: mpsc::Receiver<Arc<Client>>,
    broadcast_rx: mpsc::Receiver<Vec<u8>>,
}

/// Cloneable handle to the hub.
///
/// ## Rust Concepts:
/// - **Arc<HubInner>**: every handle points at the same registry
/// - **Weak<HubInner>**: clients keep a non-owning back-reference
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Create the hub and start its coordination task.
    ///
    /// The returned `JoinHandle` completes after `stop` has torn everything down.
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (register_tx, register_rx) = mpsc::channel(MEMBERSHIP_QUEUE_CAPACITY);
        let (unregister_tx, unregister_rx) = mpsc::channel(MEMBERSHIP_QUEUE_CAPACITY);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_QUEUE_CAPACITY);

        let inner = Arc::new(HubInner {
            register_tx,
            unregister_tx,
            broadcast_tx,
            shutdown: CancellationToken::new(),
            clients: RwLock::new(HashMap::new()),
        });
        let queues = HubQueues {
            register_rx,
            unregister_rx,
            broadcast_rx,
        };

        let task = tokio::spawn(run(inner.clone(), queues));
        (Self { inner }, task)
    }

    pub(crate) fn from_inner(inner: Arc<HubInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<HubInner> {
        Arc::downgrade(&self.inner)
    }

    /// Add a client. Waits only for queue space.
    pub async fn register(&self, client: Arc<Client>) {
        if let Err(mpsc::error::SendError(client)) = self.inner.register_tx.send(client).await {
            warn!(client = %client.remote_identity(), "Hub is stopped, rejecting registration");
            client.close();
        }
    }

    /// Remove a client and close its outbound queue.
    pub async fn unregister(&self, client: Arc<Client>) {
        if let Err(mpsc::error::SendError(client)) = self.inner.unregister_tx.send(client).await {
            debug!(client = %client.remote_identity(), "Hub is stopped, closing client directly");
            client.close();
        }
    }

    /// Deliver `message` to every registered client.
    pub async fn broadcast(&self, message: Vec<u8>) {
        if self.inner.broadcast_tx.send(message).await.is_err() {
            warn!("Hub is stopped, dropping broadcast");
        }
    }

    pub fn count(&self) -> usize {
        self.inner.clients.read().len()
    }

    pub fn has_client(&self, client: &Client) -> bool {
        self.inner.clients.read().contains_key(&client.id())
    }

    /// Signal the coordination task to close every client and exit.
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

async fn run(inner: Arc<HubInner>, mut queues: HubQueues) {
    info!("Hub started");

    loop {
        tokio::select! {
            biased;

            _ = inner.shutdown.cancelled() => break,
            Some(client) = queues.register_rx.recv() => inner.add(client),
            Some(client) = queues.unregister_rx.recv() => inner.remove(&client),
            Some(message) = queues.broadcast_rx.recv() => inner.fan_out(&message),
            else => break,
        }
    }

    inner.shut_down(&mut queues);
    info!("Hub stopped");
}

impl HubInner {
    fn add(&self, client: Arc<Client>) {
        let mut clients = self.clients.write();
        if clients.contains_key(&client.id()) {
            debug!(client = %client.remote_identity(), "Client already registered");
            return;
        }
        clients.insert(client.id(), client.clone());
        info!(
            client = %client.remote_identity(),
            session_id = %client.session().id(),
            total = clients.len(),
            "Client registered"
        );
    }

    fn remove(&self, client: &Arc<Client>) {
        let removed = self.clients.write().remove(&client.id());
        match removed {
            Some(client) => {
                client.close();
                info!(client = %client.remote_identity(), total = self.clients.read().len(), "Client unregistered");
            }
            None => debug!(client = %client.remote_identity(), "Unregister for unknown client ignored"),
        }
    }

    fn fan_out(&self, message: &[u8]) {
        let slow: Vec<ClientId> = {
            let clients = self.clients.read();
            clients
                .values()
                .filter_map(|client| match client.try_send(message.to_vec()) {
                    Ok(()) => None,
                    Err(e) => {
                        warn!(client = %client.remote_identity(), error = %e, "Dropping client during broadcast");
                        Some(client.id())
                    }
                })
                .collect()
        };

        if slow.is_empty() {
            return;
        }

        let mut clients = self.clients.write();
        for id in slow {
            if let Some(client) = clients.remove(&id) {
                client.close();
            }
        }
    }

    /// Close every client, then close the queues and drain what was left in them.
    fn shut_down(&self, queues: &mut HubQueues) {
        let clients: Vec<Arc<Client>> = self.clients.write().drain().map(|(_, c)| c).collect();
        for client in &clients {
            client.close();
        }
        info!(closed = clients.len(), "Hub closed remaining clients");

        queues.register_rx.close();
        queues.unregister_rx.close();
        queues.broadcast_rx.close();

        while let Ok(client) = queues.register_rx.try_recv() {
            client.close();
        }
        while queues.unregister_rx.try_recv().is_ok() {}
        while queues.broadcast_rx.try_recv().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_client, wait_until};
    use futures_util::future::join_all;

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let (hub, _task) = Hub::spawn();
        let (client, _transport) = test_client(&hub, OUTBOUND_QUEUE_CAPACITY);

        hub.register(client.clone()).await;
        hub.register(client.clone()).await;

        assert!(wait_until(|| hub.has_client(&client)).await);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(hub.count(), 1);
    }

    #[tokio::test]
    async fn test_unregister_unknown_client_is_noop() {
        let (hub, _task) = Hub::spawn();
        let (known, _t1) = test_client(&hub, OUTBOUND_QUEUE_CAPACITY);
        let (stranger, _t2) = test_client(&hub, OUTBOUND_QUEUE_CAPACITY);

        hub.register(known.clone()).await;
        assert!(wait_until(|| hub.count() == 1).await);

        hub.unregister(stranger.clone()).await;
        hub.unregister(known.clone()).await;
        assert!(wait_until(|| hub.count() == 0).await);
        assert!(known.is_closed());
        assert!(!stranger.is_closed());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_client() {
        let (hub, _task) = Hub::spawn();
        let mut receivers = Vec::new();
        let mut transports = Vec::new();
        for _ in 0..3 {
            let (client, transport) = test_client(&hub, OUTBOUND_QUEUE_CAPACITY);
            receivers.push(client.take_outbound().unwrap());
            transports.push(transport);
            hub.register(client).await;
        }
        assert!(wait_until(|| hub.count() == 3).await);

        hub.broadcast(b"hello".to_vec()).await;

        for rx in &mut receivers {
            let message = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
                .await
                .unwrap();
            assert_eq!(message, Some(b"hello".to_vec()));
        }
    }

    #[tokio::test]
    async fn test_full_client_is_dropped_during_broadcast() {
        let (hub, _task) = Hub::spawn();
        let (slow, _t1) = test_client(&hub, 1);
        let (fast, _t2) = test_client(&hub, OUTBOUND_QUEUE_CAPACITY);
        let mut fast_rx = fast.take_outbound().unwrap();

        slow.try_send(b"backlog".to_vec()).unwrap();
        hub.register(slow.clone()).await;
        hub.register(fast.clone()).await;
        assert!(wait_until(|| hub.count() == 2).await);

        hub.broadcast(b"news".to_vec()).await;

        assert!(wait_until(|| !hub.has_client(&slow)).await);
        assert!(slow.is_closed());
        assert!(hub.has_client(&fast));
        assert_eq!(fast_rx.recv().await, Some(b"news".to_vec()));
    }

    #[tokio::test]
    async fn test_stop_closes_everything() {
        let (hub, task) = Hub::spawn();
        let mut receivers = Vec::new();
        let mut transports = Vec::new();
        let mut clients = Vec::new();
        for _ in 0..3 {
            let (client, transport) = test_client(&hub, OUTBOUND_QUEUE_CAPACITY);
            receivers.push(client.take_outbound().unwrap());
            transports.push(transport);
            hub.register(client.clone()).await;
            clients.push(client);
        }
        assert!(wait_until(|| hub.count() == 3).await);

        hub.stop();
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert!(hub.is_stopped());
        assert_eq!(hub.count(), 0);
        assert!(clients.iter().all(|c| c.is_closed()));
        for rx in &mut receivers {
            assert_eq!(rx.recv().await, None);
        }

        // Late registrations are rejected and the client closed
        let (late, _t) = test_client(&hub, OUTBOUND_QUEUE_CAPACITY);
        hub.register(late.clone()).await;
        assert!(late.is_closed());
        assert_eq!(hub.count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_registrations_then_broadcast() {
        let (hub, _task) = Hub::spawn();
        let mut clients = Vec::new();
        let mut transports = Vec::new();
        for _ in 0..5 {
            let (client, transport) = test_client(&hub, OUTBOUND_QUEUE_CAPACITY);
            clients.push(client);
            transports.push(transport);
        }
        let mut receivers: Vec<_> = clients.iter().map(|c| c.take_outbound().unwrap()).collect();

        join_all(clients.iter().map(|c| hub.register(c.clone()))).await;
        assert!(wait_until(|| hub.count() == 5).await);

        hub.broadcast(b"all".to_vec()).await;

        for rx in &mut receivers {
            let message = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
                .await
                .unwrap();
            assert_eq!(message, Some(b"all".to_vec()));
            assert!(rx.try_recv().is_err());
        }
    }
}
