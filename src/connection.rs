//! Per-client connection state.
//!
//! A `Connection` owns everything scoped to one client socket: the sender
//! half of the serialized outbound queue (one writer task per connection
//! drains the other half), and the set of active watch sessions keyed by
//! `uniqueId`. There is no global identity-keyed map — the connection is the
//! arena for its own sessions, and teardown is deterministic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::frame::WsResponse;
use crate::watch::WatchSession;

/// Default capacity of the per-connection outbound queue.
pub const OUTBOUND_CAPACITY: usize = 64;

/// Default grace period for producers to observe cancellation during
/// session close or connection teardown.
pub const TEARDOWN_GRACE: Duration = Duration::from_secs(3);

/// One admitted client connection.
pub struct Connection {
    id: Uuid,
    outbound: mpsc::Sender<String>,
    sessions: Mutex<HashMap<String, WatchSession>>,
    closed: CancellationToken,
    grace: Duration,
}

impl Connection {
    /// Create a connection with its outbound queue. The caller owns the
    /// receiver half and must drain it into the socket from a single task.
    pub fn new(outbound_capacity: usize, grace: Duration) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(outbound_capacity);
        let conn = Arc::new(Self {
            id: Uuid::new_v4(),
            outbound: tx,
            sessions: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
            grace,
        });
        (conn, rx)
    }

    /// Create a connection with default capacities (tests, mostly).
    pub fn with_defaults() -> (Arc<Self>, mpsc::Receiver<String>) {
        Self::new(OUTBOUND_CAPACITY, TEARDOWN_GRACE)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Sender half of the outbound queue, for registry admission.
    pub fn outbound_sender(&self) -> mpsc::Sender<String> {
        self.outbound.clone()
    }

    /// Token cancelled when this connection is torn down. The writer task
    /// selects on it to close the socket promptly.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Queue one outbound frame. A closed queue (socket gone, writer exited)
    /// is a no-op — transport failures trigger teardown elsewhere and must
    /// never propagate into the task doing the write.
    pub async fn send(&self, resp: &WsResponse) {
        if self.outbound.send(resp.encode()).await.is_err() {
            tracing::debug!(conn = %self.id, unique_id = %resp.unique_id, "outbound queue closed, dropping frame");
        }
    }

    /// Insert a session under `unique_id`. Returns false if one is already
    /// in flight for that id (the invariant "at most one WatchSession per
    /// (connection, uniqueId)" is enforced here).
    pub(crate) fn try_insert_session(&self, unique_id: &str, session: WatchSession) -> bool {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(unique_id) {
            return false;
        }
        sessions.insert(unique_id.to_owned(), session);
        true
    }

    /// Remove and return the session for `unique_id`, if present. Removal is
    /// idempotent: racing callers see `None` and treat it as a no-op.
    pub(crate) fn take_session(&self, unique_id: &str) -> Option<WatchSession> {
        self.sessions.lock().remove(unique_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Tear down the connection: cancel every owned session and wait, with
    /// a bounded grace period per session, for producers to observe the
    /// cancellation. Called exactly once when the read loop exits.
    pub async fn teardown(&self) {
        self.closed.cancel();
        let sessions: Vec<(String, WatchSession)> =
            { self.sessions.lock().drain().collect() };
        if sessions.is_empty() {
            return;
        }
        tracing::debug!(conn = %self.id, count = sessions.len(), "cancelling watch sessions");
        for (_, session) in &sessions {
            session.cancel();
        }
        let waits = sessions.iter().map(|(id, session)| {
            let grace = self.grace;
            async move {
                if !session.wait_done(grace).await {
                    tracing::warn!(conn = %self.id, unique_id = %id, "watch session did not stop within grace period");
                }
            }
        });
        futures::future::join_all(waits).await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}
