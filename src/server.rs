//! HTTP/WebSocket transport glue.
//!
//! One route matters: `/wscom1`, the multiplexed WebSocket endpoint. Each
//! upgraded socket gets a read-loop task (this module) and a writer task
//! that drains the connection's serialized outbound queue, so concurrent
//! call responses, watch events, and broadcasts never interleave
//! mid-frame. `/hooks` is the webhook ingress that fans incoming events out
//! to every client through the [`BroadcastHub`].

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::connection::Connection;
use crate::dispatch::{Disposition, RequestDispatcher};
use crate::handler::{Handler, HandlerError, HandlerTable};
use crate::hub::{BroadcastHub, ConnectionRegistry};
use crate::shutdown::ShutdownCoordinator;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<RequestDispatcher>,
    pub registry: ConnectionRegistry,
    pub hub: BroadcastHub,
    pub shutdown: ShutdownCoordinator,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(handlers: HandlerTable, config: Config) -> Self {
        Self::with_registry(handlers, ConnectionRegistry::new(), config)
    }

    /// Build state around an existing registry, for handlers (like
    /// [`StatusHandler`]) that need to observe the connection set.
    pub fn with_registry(
        handlers: HandlerTable,
        registry: ConnectionRegistry,
        config: Config,
    ) -> Self {
        let dispatcher = RequestDispatcher::new(Arc::new(handlers))
            .with_watch_capacity(config.watch_channel_capacity);
        Self {
            dispatcher: Arc::new(dispatcher),
            hub: BroadcastHub::new(registry.clone()),
            registry,
            shutdown: ShutdownCoordinator::new(),
            config: Arc::new(config),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/wscom1", get(wscom1))
        .route("/hooks", post(hooks))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    connections: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.registry.len(),
    })
}

/// Webhook ingress: accepts a JSON object and broadcasts it to every
/// connected client. Event-key validation belongs to the business layer.
async fn hooks(State(state): State<AppState>, Json(payload): Json<Value>) -> impl IntoResponse {
    if !payload.is_object() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "payload must be a JSON object"})),
        )
            .into_response();
    }
    let delivered = state.hub.broadcast(&payload);
    tracing::info!(delivered, "webhook event broadcast");
    StatusCode::NO_CONTENT.into_response()
}

async fn wscom1(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_wscom1(socket, state))
}

async fn handle_wscom1(socket: WebSocket, state: AppState) {
    let (_guard, mut shutdown_rx) = state.shutdown.register();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (conn, mut outbound_rx) = Connection::new(
        state.config.outbound_capacity,
        state.config.teardown_grace(),
    );
    state.registry.admit(&conn);
    tracing::debug!(conn = %conn.id(), "websocket connected");

    // Writer task: the single owner of the sink half. Everything outbound
    // (responses, watch events, broadcasts) funnels through the queue, so
    // frames never interleave. On teardown it drains what's already queued,
    // then closes the socket.
    let closed = conn.closed_token();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = outbound_rx.recv() => match maybe {
                    Some(text) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            return;
                        }
                    }
                    None => break,
                },
                _ = closed.cancelled() => {
                    while let Ok(text) = outbound_rx.try_recv() {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            return;
                        }
                    }
                    break;
                }
            }
        }
        let close_frame = CloseFrame {
            code: close_code::NORMAL,
            reason: "connection closed".into(),
        };
        let _ = ws_tx.send(Message::Close(Some(close_frame))).await;
        let _ = ws_tx.flush().await;
    });

    // Read loop: never blocks on handler completion. Exits on client
    // close, transport error, protocol-fatal frame, or server shutdown.
    loop {
        tokio::select! {
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if state.dispatcher.dispatch(&conn, text.as_str()).await == Disposition::Close {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::debug!(conn = %conn.id(), "websocket disconnected");
                    break;
                }
                Some(Ok(_)) => continue, // ping/pong handled by axum
                Some(Err(e)) => {
                    tracing::debug!(conn = %conn.id(), error = %e, "websocket transport error");
                    break;
                }
            },
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::debug!(conn = %conn.id(), "closing on server shutdown");
                    break;
                }
            }
        }
    }

    // Deterministic cleanup: unregister first so broadcasts stop targeting
    // this connection, then cancel and await every owned watch session.
    state.registry.remove(conn.id());
    conn.teardown().await;
    let _ = writer.await;
}

/// Built-in `sys` target: operational status of the multiplexer itself.
/// Registered by the binary so a fresh deployment is exercisable without
/// any business handlers.
pub struct StatusHandler {
    registry: ConnectionRegistry,
}

impl StatusHandler {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Handler for StatusHandler {
    async fn call(&self, action: &str, path: &str, _body: Value) -> Result<Value, HandlerError> {
        match (action, path) {
            ("read", "/status") => Ok(json!({
                "status": "ok",
                "connections": self.registry.len(),
            })),
            _ => Err(HandlerError::unsupported(action, path)),
        }
    }
}

/// Bind and serve until ctrl-c, then drain connections.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let bind = state.config.bind;
    let grace = state.config.teardown_grace();
    let shutdown = state.shutdown.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    let signal_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            signal_shutdown.signal();
        })
        .await?;

    shutdown.drain(grace).await;
    Ok(())
}
