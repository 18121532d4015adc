#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use wscom::{AppState, Config, HandlerTable};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server on an ephemeral port and return its address.
pub async fn spawn_server(handlers: HandlerTable) -> SocketAddr {
    spawn_server_with_config(handlers, Config::default()).await
}

pub async fn spawn_server_with_config(handlers: HandlerTable, config: Config) -> SocketAddr {
    let state = AppState::new(handlers, config);
    let app = wscom::server::router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

pub async fn ws_connect(addr: SocketAddr) -> WsClient {
    let (ws, _) = connect_async(format!("ws://{addr}/wscom1"))
        .await
        .expect("websocket connect");
    ws
}

pub async fn send_request(ws: &mut WsClient, unique_id: &str, request: &str, body: Value) {
    let frame = json!({
        "uniqueId": unique_id,
        "request": request,
        "dataRequest": body,
    });
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .expect("send frame");
}

pub async fn send_raw(ws: &mut WsClient, raw: &str) {
    ws.send(Message::Text(raw.to_owned().into()))
        .await
        .expect("send raw frame");
}

/// Receive the next text frame as JSON, skipping pings/pongs.
pub async fn recv_json(ws: &mut WsClient) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed while waiting for frame")
            .expect("transport error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected websocket message: {other:?}"),
        }
    }
}

/// Assert the server closes the socket without sending any further text
/// frame.
pub async fn expect_close(ws: &mut WsClient) {
    loop {
        let next = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for close");
        match next {
            None | Some(Ok(Message::Close(_))) | Some(Err(_)) => return,
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(other)) => panic!("expected close, got {other:?}"),
        }
    }
}
