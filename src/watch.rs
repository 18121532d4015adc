//! Watch session lifecycle: one active subscription per `uniqueId`.
//!
//! A session is a bounded event channel with two tasks around it. The
//! *producer* runs the handler's `watch` with the sink end and a
//! cancellation token; the *forwarder* drains the source end and writes one
//! outbound frame per event, in production order, until the channel closes.
//! Cancellation is cooperative: the handler observes the token between
//! emitted items, and the channel being bounded means a slow client
//! backpressures the producer instead of dropping events.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::frame::{Frame, WsResponse};
use crate::handler::{EventSink, Handler, HandlerError};

/// Default capacity of the producer→forwarder event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Handle for one active subscription, stored in its owning connection's
/// session set. Terminal states (completed, cancelled, failed) all flow
/// through the forwarder, which removes the session and signals `done`.
pub struct WatchSession {
    cancel: CancellationToken,
    done: CancellationToken,
}

impl WatchSession {
    /// Trigger cooperative cancellation of the producer.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait up to `grace` for the session to reach a terminal state.
    /// Returns false if the producer did not stop in time.
    pub async fn wait_done(&self, grace: std::time::Duration) -> bool {
        tokio::time::timeout(grace, self.done.cancelled())
            .await
            .is_ok()
    }

    /// Session handle with no tasks attached, for exercising the
    /// connection's bookkeeping in tests.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[cfg(test)]
    pub(crate) fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }
}

/// Start a watch session for `frame` on `conn`.
///
/// The session is registered in the connection's set *before* the tasks
/// start, so a producer that completes immediately still finds its own
/// entry to remove. Returns false (and starts nothing) if a session for
/// this `uniqueId` is already in flight.
pub fn spawn(
    conn: Arc<Connection>,
    handler: Arc<dyn Handler>,
    frame: Frame,
    channel_capacity: usize,
) -> bool {
    let cancel = CancellationToken::new();
    let done = CancellationToken::new();
    let session = WatchSession {
        cancel: cancel.clone(),
        done: done.clone(),
    };
    if !conn.try_insert_session(&frame.unique_id, session) {
        return false;
    }

    let (event_tx, mut event_rx) = mpsc::channel::<Value>(channel_capacity);
    // Carries a handler error from the producer to the forwarder, so the
    // final error frame is written only after all produced events flushed.
    let (err_tx, err_rx) = oneshot::channel::<HandlerError>();

    let Frame {
        unique_id,
        request,
        body,
    } = frame;

    // Producer: run the handler with the sink end. Dropping the sink when
    // the handler returns is what closes the channel.
    let producer_id = unique_id.clone();
    tokio::spawn(async move {
        let sink = EventSink::new(event_tx);
        match handler
            .watch(&request.action, &request.path, body, sink, cancel)
            .await
        {
            Ok(()) => {
                tracing::debug!(unique_id = %producer_id, "watch producer finished");
            }
            Err(e) => {
                tracing::warn!(unique_id = %producer_id, error = %e, "watch producer failed");
                let _ = err_tx.send(e);
            }
        }
    });

    // Forwarder: one outbound frame per event, in order, then the terminal
    // bookkeeping. Removal from the session set is idempotent — an explicit
    // `ws:watch:close` or connection teardown may have taken it already.
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            conn.send(&WsResponse::data(&unique_id, event)).await;
        }
        if let Ok(err) = err_rx.await {
            conn.send(&WsResponse::error(&unique_id, err)).await;
        }
        conn.take_session(&unique_id);
        done.cancel();
    });

    true
}
