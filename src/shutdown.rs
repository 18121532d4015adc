//! Graceful shutdown coordination.
//!
//! Every connection read loop registers itself and selects on the shutdown
//! receiver; `signal()` flips the flag so loops exit cleanly, and `drain()`
//! waits (bounded) for the registered connections to finish tearing down.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Shared shutdown state. Clones observe the same signal.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    tx: Arc<watch::Sender<bool>>,
    active: Arc<AtomicUsize>,
}

/// RAII guard that decrements the active-connection count on drop.
pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Release);
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register one connection. Returns the guard keeping it counted and a
    /// receiver that flips to `true` when shutdown is signalled.
    pub fn register(&self) -> (ConnectionGuard, watch::Receiver<bool>) {
        self.active.fetch_add(1, Ordering::AcqRel);
        (
            ConnectionGuard {
                active: Arc::clone(&self.active),
            },
            self.tx.subscribe(),
        )
    }

    /// Signal shutdown to every registered connection.
    pub fn signal(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Signal shutdown and wait up to `grace` for connections to drain.
    /// Returns true if everything drained in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.signal();
        let deadline = tokio::time::Instant::now() + grace;
        while self.active_connections() > 0 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    remaining = self.active_connections(),
                    "connections still active after drain grace period"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
