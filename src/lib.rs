//! wscom: a WebSocket request-multiplexing engine.
//!
//! Clients open a single WebSocket to `/wscom1` and multiplex many
//! concurrent requests over it, each tagged with a client-chosen
//! `uniqueId`. A request names its destination as `target:action:path`;
//! registered [`Handler`](handler::Handler)s supply the behavior per
//! target. Two interaction shapes exist:
//!
//! - **call**: one request, one response (`dataResponse` or `error`).
//! - **watch** (`action == "watch"`): one request, a stream of
//!   `dataResponse` events until the client cancels with
//!   `ws:watch:close` or the connection ends.
//!
//! The reserved `ws` target carries control traffic and is never routed
//! to handlers. Server-initiated broadcasts (webhooks posted to `/hooks`)
//! reach every live connection through the [`hub::BroadcastHub`].

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod frame;
pub mod handler;
pub mod hub;
pub mod server;
pub mod shutdown;
pub mod watch;

pub use config::Config;
pub use connection::Connection;
pub use dispatch::{Disposition, RequestDispatcher};
pub use frame::{Frame, RequestPath, WsResponse};
pub use handler::{EventSink, Handler, HandlerError, HandlerTable};
pub use hub::{BroadcastHub, ConnectionRegistry};
pub use server::{AppState, StatusHandler};
pub use shutdown::ShutdownCoordinator;
