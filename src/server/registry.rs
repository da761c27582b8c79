//! Connected-client registry for targeted and broadcast pushes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::protocol::Envelope;

pub type ClientId = u64;

/// Tracks every connected client's outbound channel. Each channel is drained
/// by that connection's writer task, so pushes and request replies reach a
/// client in the order they were queued.
///
/// Cloning is cheap: clones share the same underlying map via Arc.
#[derive(Clone)]
pub struct ClientRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    next_id: AtomicU64,
    clients: Mutex<HashMap<ClientId, mpsc::UnboundedSender<Envelope>>>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                next_id: AtomicU64::new(1),
                clients: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a new connection; the caller owns the receiving end.
    pub fn register(&self) -> (ClientId, mpsc::UnboundedReceiver<Envelope>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .clients
            .lock()
            .expect("registry lock poisoned")
            .insert(id, tx);
        (id, rx)
    }

    /// Drop a connection's channel; its writer task ends once drained.
    pub fn unregister(&self, id: ClientId) {
        self.inner
            .clients
            .lock()
            .expect("registry lock poisoned")
            .remove(&id);
    }

    /// Queue an envelope for one client. False when the client is gone.
    pub fn send_to(&self, id: ClientId, envelope: Envelope) -> bool {
        let sender = {
            let clients = self.inner.clients.lock().expect("registry lock poisoned");
            clients.get(&id).cloned()
        };
        match sender {
            Some(tx) => tx.send(envelope).is_ok(),
            None => false,
        }
    }

    /// Queue an envelope for every connected client. Iterates a snapshot so
    /// the lock is not held across sends.
    pub fn broadcast(&self, envelope: &Envelope) {
        let targets: Vec<mpsc::UnboundedSender<Envelope>> = {
            let clients = self.inner.clients.lock().expect("registry lock poisoned");
            clients.values().cloned().collect()
        };
        for tx in targets {
            let _ = tx.send(envelope.clone());
        }
    }

    pub fn connected(&self) -> usize {
        self.inner
            .clients
            .lock()
            .expect("registry lock poisoned")
            .len()
    }
}
