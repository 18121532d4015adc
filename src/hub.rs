//! Live-connection tracking and out-of-band broadcast.
//!
//! The registry holds the outbound queue sender of every admitted
//! connection; since each connection already serializes its writes through
//! one writer task, broadcast only needs to enqueue. Delivery is
//! best-effort per connection: a full or closed queue is skipped, never an
//! error that leaks into the caller or another connection.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::connection::Connection;

/// Tracks admitted connections by id.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<Uuid, mpsc::Sender<String>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a connection: its outbound queue becomes reachable for
    /// broadcast until [`remove`](Self::remove) is called.
    pub fn admit(&self, conn: &Connection) {
        self.inner.write().insert(conn.id(), conn.outbound_sender());
        tracing::debug!(conn = %conn.id(), total = self.len(), "connection admitted");
    }

    /// Remove a connection. Removing an unknown id is a no-op.
    pub fn remove(&self, id: Uuid) {
        self.inner.write().remove(&id);
        tracing::debug!(conn = %id, total = self.len(), "connection removed");
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    fn snapshot(&self) -> Vec<(Uuid, mpsc::Sender<String>)> {
        self.inner
            .read()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect()
    }
}

/// Fan-out of server-initiated messages (webhook notifications and the
/// like) to every admitted connection, independent of any in-flight
/// request or subscription.
#[derive(Clone)]
pub struct BroadcastHub {
    registry: ConnectionRegistry,
}

impl BroadcastHub {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    /// Deliver `payload` to every admitted connection. Returns how many
    /// connections accepted the message.
    pub fn broadcast(&self, payload: &Value) -> usize {
        let text = payload.to_string();
        let mut delivered = 0;
        for (id, tx) in self.registry.snapshot() {
            match tx.try_send(text.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(conn = %id, "outbound queue full, skipping broadcast");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(conn = %id, "outbound queue closed, skipping broadcast");
                }
            }
        }
        delivered
    }
}
