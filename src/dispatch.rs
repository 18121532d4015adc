//! Per-frame routing: control / call / watch.
//!
//! The connection read loop hands every decoded text frame to
//! [`RequestDispatcher::dispatch`] and acts on the returned [`Disposition`].
//! Dispatch never blocks on handler completion: calls and watches run as
//! their own tasks, and the only inline work is the reserved `ws` control
//! namespace plus session-set bookkeeping.

use std::sync::Arc;

use serde_json::json;

use crate::connection::Connection;
use crate::frame::{self, Frame, WsResponse};
use crate::handler::HandlerTable;
use crate::watch;

/// What the read loop should do after a frame was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep reading.
    Continue,
    /// Terminate the read loop; connection teardown follows.
    Close,
}

/// Routes decoded frames for every connection. Cheap to share: holds only
/// the immutable handler table and channel sizing.
pub struct RequestDispatcher {
    handlers: Arc<HandlerTable>,
    watch_channel_capacity: usize,
}

impl RequestDispatcher {
    pub fn new(handlers: Arc<HandlerTable>) -> Self {
        Self {
            handlers,
            watch_channel_capacity: watch::EVENT_CHANNEL_CAPACITY,
        }
    }

    pub fn with_watch_capacity(mut self, capacity: usize) -> Self {
        self.watch_channel_capacity = capacity;
        self
    }

    /// Handle one raw text frame from `conn`.
    ///
    /// A frame that fails to decode is protocol-fatal: the connection is
    /// closed without any error frame, since a client that sends malformed
    /// envelopes cannot be trusted to follow the cancel/close protocol.
    pub async fn dispatch(&self, conn: &Arc<Connection>, raw: &str) -> Disposition {
        let frame = match frame::decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(conn = %conn.id(), error = %e, "malformed frame, closing connection");
                return Disposition::Close;
            }
        };

        if frame.request.is_control() {
            return self.control(conn, frame).await;
        }

        let Some(handler) = self.handlers.resolve(&frame.request.target) else {
            tracing::warn!(conn = %conn.id(), target = %frame.request.target, "no handler for target");
            conn.send(&WsResponse::error(
                &frame.unique_id,
                format!("there is no handler to support '{}'", frame.request.target),
            ))
            .await;
            return Disposition::Continue;
        };

        if frame.request.action == "watch" {
            tracing::info!(conn = %conn.id(), request = %frame.request, unique_id = %frame.unique_id, "watching");
            let unique_id = frame.unique_id.clone();
            if !watch::spawn(conn.clone(), handler, frame, self.watch_channel_capacity) {
                conn.send(&WsResponse::error(
                    &unique_id,
                    format!("uniqueId '{unique_id}' already has a watch in flight"),
                ))
                .await;
            }
        } else {
            tracing::info!(conn = %conn.id(), request = %frame.request, unique_id = %frame.unique_id, "dispatching");
            let conn = conn.clone();
            tokio::spawn(async move {
                let resp = match handler
                    .call(&frame.request.action, &frame.request.path, frame.body)
                    .await
                {
                    Ok(value) => WsResponse::data(&frame.unique_id, value),
                    Err(e) => WsResponse::error(&frame.unique_id, e),
                };
                conn.send(&resp).await;
            });
        }

        Disposition::Continue
    }

    /// Reserved `ws` namespace. `ctl:close` ends the read loop;
    /// `watch:close` cancels one session; anything else is a per-request
    /// error and the connection stays open.
    async fn control(&self, conn: &Arc<Connection>, frame: Frame) -> Disposition {
        match (frame.request.action.as_str(), frame.request.path.as_str()) {
            ("ctl", "close") => {
                tracing::debug!(conn = %conn.id(), "client requested connection close");
                Disposition::Close
            }
            ("watch", "close") => {
                // Removal happens synchronously here, which makes a repeated
                // close (or a close racing natural completion) a silent
                // no-op. The cancel-wait-acknowledge runs on its own task so
                // the read loop never blocks on the grace period.
                if let Some(session) = conn.take_session(&frame.unique_id) {
                    let conn = conn.clone();
                    let unique_id = frame.unique_id;
                    tokio::spawn(async move {
                        session.cancel();
                        // The ack promises no further data frames for this
                        // id, so it is only sent once the producer actually
                        // reached a terminal state.
                        if session.wait_done(conn.grace()).await {
                            conn.send(&WsResponse::data(&unique_id, json!({"status": "closed"})))
                                .await;
                        } else {
                            tracing::warn!(conn = %conn.id(), unique_id = %unique_id, "watch did not close within grace period, withholding acknowledgement");
                        }
                    });
                } else {
                    tracing::debug!(conn = %conn.id(), unique_id = %frame.unique_id, "watch already closed");
                }
                Disposition::Continue
            }
            _ => {
                let request = frame.request.to_string();
                tracing::warn!(conn = %conn.id(), request = %request, "unsupported control request");
                conn.send(&WsResponse::error(
                    &frame.unique_id,
                    format!("the server doesn't support '{request}'"),
                ))
                .await;
                Disposition::Continue
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{EventSink, Handler, HandlerError};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn call(
            &self,
            action: &str,
            path: &str,
            body: Value,
        ) -> Result<Value, HandlerError> {
            if action == "fail" {
                return Err(HandlerError::failed("handler exploded"));
            }
            Ok(json!({ "action": action, "path": path, "body": body }))
        }

        async fn watch(
            &self,
            _action: &str,
            _path: &str,
            _body: Value,
            sink: EventSink,
            cancel: CancellationToken,
        ) -> Result<(), HandlerError> {
            let mut i = 0u64;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {
                        if sink.send(json!({"tick": i})).await.is_err() {
                            return Ok(());
                        }
                        i += 1;
                    }
                }
            }
        }
    }

    fn dispatcher() -> RequestDispatcher {
        let mut table = HandlerTable::new();
        table.register("echo", Arc::new(Echo)).unwrap();
        RequestDispatcher::new(Arc::new(table))
    }

    async fn recv_frame(rx: &mut mpsc::Receiver<String>) -> Value {
        let text = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("outbound queue closed");
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn malformed_frame_is_protocol_fatal_with_no_output() {
        let d = dispatcher();
        let (conn, mut rx) = Connection::with_defaults();
        assert_eq!(d.dispatch(&conn, "not json").await, Disposition::Close);
        assert_eq!(
            d.dispatch(&conn, r#"{"uniqueId":"1","request":"only:two"}"#)
                .await,
            Disposition::Close
        );
        assert_eq!(
            d.dispatch(&conn, r#"{"request":"a:b:c","dataRequest":{}}"#).await,
            Disposition::Close
        );
        assert!(rx.try_recv().is_err(), "no frame may be sent for malformed input");
    }

    #[tokio::test]
    async fn unknown_target_is_per_request_error() {
        let d = dispatcher();
        let (conn, mut rx) = Connection::with_defaults();
        let disposition = d
            .dispatch(&conn, r#"{"uniqueId":"3","request":"bogus:read:/x","dataRequest":{}}"#)
            .await;
        assert_eq!(disposition, Disposition::Continue);
        let v = recv_frame(&mut rx).await;
        assert_eq!(v["uniqueId"], "3");
        assert!(v["error"].as_str().unwrap().contains("bogus"));
    }

    #[tokio::test]
    async fn call_emits_exactly_one_data_frame() {
        let d = dispatcher();
        let (conn, mut rx) = Connection::with_defaults();
        d.dispatch(
            &conn,
            r#"{"uniqueId":"1","request":"echo:read:/status","dataRequest":{"k":1}}"#,
        )
        .await;
        let v = recv_frame(&mut rx).await;
        assert_eq!(v["uniqueId"], "1");
        assert_eq!(v["dataResponse"]["action"], "read");
        assert_eq!(v["dataResponse"]["body"]["k"], 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn handler_error_becomes_error_frame_and_does_not_affect_others() {
        let d = dispatcher();
        let (conn, mut rx) = Connection::with_defaults();
        d.dispatch(&conn, r#"{"uniqueId":"A","request":"echo:fail:/x","dataRequest":{}}"#)
            .await;
        let v = recv_frame(&mut rx).await;
        assert_eq!(v["uniqueId"], "A");
        assert_eq!(v["error"], "handler exploded");

        // The connection is still usable for another request id.
        d.dispatch(&conn, r#"{"uniqueId":"B","request":"echo:read:/y","dataRequest":{}}"#)
            .await;
        let v = recv_frame(&mut rx).await;
        assert_eq!(v["uniqueId"], "B");
        assert!(v.get("error").is_none());
    }

    #[tokio::test]
    async fn ctl_close_terminates_read_loop() {
        let d = dispatcher();
        let (conn, mut rx) = Connection::with_defaults();
        let disposition = d
            .dispatch(&conn, r#"{"uniqueId":"1","request":"ws:ctl:close","dataRequest":{}}"#)
            .await;
        assert_eq!(disposition, Disposition::Close);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_control_request_keeps_connection_open() {
        let d = dispatcher();
        let (conn, mut rx) = Connection::with_defaults();
        let disposition = d
            .dispatch(&conn, r#"{"uniqueId":"1","request":"ws:ctl:reboot","dataRequest":{}}"#)
            .await;
        assert_eq!(disposition, Disposition::Continue);
        let v = recv_frame(&mut rx).await;
        assert!(v["error"].as_str().unwrap().contains("ws:ctl:reboot"));
    }

    #[tokio::test]
    async fn watch_close_cancels_and_acknowledges_once() {
        let d = dispatcher();
        let (conn, mut rx) = Connection::with_defaults();
        d.dispatch(&conn, r#"{"uniqueId":"2","request":"echo:watch:/repos","dataRequest":{}}"#)
            .await;
        // At least one event before the close.
        let v = recv_frame(&mut rx).await;
        assert_eq!(v["uniqueId"], "2");

        d.dispatch(&conn, r#"{"uniqueId":"2","request":"ws:watch:close","dataRequest":{}}"#)
            .await;

        // Drain remaining ticks; the final frame must be the closed ack.
        let ack = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let v = recv_frame(&mut rx).await;
                if v["dataResponse"]["status"] == "closed" {
                    return v;
                }
            }
        })
        .await
        .expect("no closed acknowledgement");
        assert_eq!(ack["uniqueId"], "2");

        // Second close for the same id: silent no-op, no second ack.
        d.dispatch(&conn, r#"{"uniqueId":"2","request":"ws:watch:close","dataRequest":{}}"#)
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    /// Never observes its cancellation token.
    struct Stubborn;

    #[async_trait]
    impl Handler for Stubborn {
        async fn watch(
            &self,
            _action: &str,
            _path: &str,
            _body: Value,
            _sink: EventSink,
            _cancel: CancellationToken,
        ) -> Result<(), HandlerError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn close_ack_is_withheld_when_producer_ignores_cancel() {
        let mut table = HandlerTable::new();
        table.register("stuck", Arc::new(Stubborn)).unwrap();
        let d = RequestDispatcher::new(Arc::new(table));
        let (conn, mut rx) = Connection::new(8, Duration::from_millis(50));

        d.dispatch(&conn, r#"{"uniqueId":"s","request":"stuck:watch:/x","dataRequest":{}}"#)
            .await;
        d.dispatch(&conn, r#"{"uniqueId":"s","request":"ws:watch:close","dataRequest":{}}"#)
            .await;

        // Grace period elapses without the producer stopping: no frame at
        // all may be sent for this id.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn watch_close_for_unknown_id_is_silent() {
        let d = dispatcher();
        let (conn, mut rx) = Connection::with_defaults();
        let disposition = d
            .dispatch(&conn, r#"{"uniqueId":"9","request":"ws:watch:close","dataRequest":{}}"#)
            .await;
        assert_eq!(disposition, Disposition::Continue);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_watch_id_is_rejected_with_error_frame() {
        let d = dispatcher();
        let (conn, mut rx) = Connection::with_defaults();
        d.dispatch(&conn, r#"{"uniqueId":"2","request":"echo:watch:/a","dataRequest":{}}"#)
            .await;
        d.dispatch(&conn, r#"{"uniqueId":"2","request":"echo:watch:/b","dataRequest":{}}"#)
            .await;

        let err = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let v = recv_frame(&mut rx).await;
                if let Some(e) = v.get("error") {
                    return e.as_str().unwrap().to_owned();
                }
            }
        })
        .await
        .expect("no rejection frame");
        assert!(err.contains("already has a watch in flight"));
    }
}
