//! Handler contract and the startup-time target registry.
//!
//! A handler serves one `target` namespace (e.g. `"sccs"`, `"k8s"`). A call
//! produces exactly one response payload; a watch pushes zero or more events
//! into an [`EventSink`] until it completes or observes its cancellation
//! token. Handlers are registered once at process startup and the table is
//! shared immutably afterwards, so resolution needs no locking.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Error returned by a handler invocation. Converted to the wire `error`
/// field at the dispatch boundary; never propagates further.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("dispatcher does not support {action}:{path} with provided dataRequest")]
    UnsupportedRequest { action: String, path: String },
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn unsupported(action: &str, path: &str) -> Self {
        Self::UnsupportedRequest {
            action: action.to_owned(),
            path: path.to_owned(),
        }
    }

    pub fn failed(message: impl std::fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }
}

/// The event channel closed because the session was torn down.
#[derive(Debug, thiserror::Error)]
#[error("watch event sink is closed")]
pub struct SinkClosed;

/// Write-only end of a watch session's bounded event channel.
///
/// `send` blocks when the forwarder falls behind (slow client socket);
/// there is no event-dropping semantics in this protocol.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Value>,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::Sender<Value>) -> Self {
        Self { tx }
    }

    /// Push one event toward the client. Returns [`SinkClosed`] once the
    /// session has been cancelled or the connection torn down; producers
    /// should return promptly when they see it.
    pub async fn send(&self, event: Value) -> Result<(), SinkClosed> {
        self.tx.send(event).await.map_err(|_| SinkClosed)
    }
}

/// One registered target. Implement `call` for one-shot requests, `watch`
/// for subscriptions, or both; the defaults reject the request.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// One-shot request: return a single response payload.
    async fn call(&self, action: &str, path: &str, body: Value) -> Result<Value, HandlerError> {
        let _ = body;
        Err(HandlerError::unsupported(action, path))
    }

    /// Streaming request: push events to `sink` until the sequence is
    /// exhausted or `cancel` fires. Must observe `cancel` between units of
    /// work (the framework never preempts handler code mid-instruction).
    async fn watch(
        &self,
        action: &str,
        path: &str,
        body: Value,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> Result<(), HandlerError> {
        let _ = (body, sink, cancel);
        Err(HandlerError::unsupported(action, path))
    }
}

/// A `target` name is already registered.
#[derive(Debug, thiserror::Error)]
#[error("target '{0}' is already registered")]
pub struct DuplicateTarget(pub String);

/// Maps target names to handlers. Built at startup, then frozen behind an
/// `Arc` — reads are unsynchronized by construction.
#[derive(Default)]
pub struct HandlerTable {
    entries: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `target`. Errors if the target already exists.
    pub fn register(
        &mut self,
        target: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<(), DuplicateTarget> {
        if self.entries.contains_key(target) {
            return Err(DuplicateTarget(target.to_owned()));
        }
        self.entries.insert(target.to_owned(), handler);
        Ok(())
    }

    /// Look up the handler for `target`.
    pub fn resolve(&self, target: &str) -> Option<Arc<dyn Handler>> {
        self.entries.get(target).cloned()
    }
}
