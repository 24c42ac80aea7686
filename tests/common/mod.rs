#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use maze_fleet::app::{AppState, BalancerState};
use maze_fleet::config::{BalancerConfig, ServerConfig};
use maze_fleet::http::{build_balancer_router, build_router};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Start a room server on an ephemeral port
pub async fn spawn_server(config: ServerConfig) -> (SocketAddr, AppState) {
    let state = AppState::new(config);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, state)
}

/// Start a balancer on an ephemeral port
pub async fn spawn_balancer(config: BalancerConfig) -> (SocketAddr, BalancerState) {
    let state = BalancerState::new(config);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = build_balancer_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, state)
}

/// An address nothing is listening on
pub fn dead_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

pub async fn connect(addr: SocketAddr, query: &str) -> Client {
    let url = if query.is_empty() {
        format!("ws://{addr}/ws")
    } else {
        format!("ws://{addr}/ws?{query}")
    };
    let (client, _) = connect_async(url.as_str()).await.unwrap();
    client
}

/// Next JSON text frame, or None once the server closes
pub async fn next_json(client: &mut Client) -> Option<Value> {
    loop {
        let frame = tokio::time::timeout(FRAME_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for a frame")?;
        match frame {
            Ok(Message::Text(text)) => return Some(serde_json::from_str(&text).unwrap()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

/// Skip frames until one of the given type arrives
pub async fn next_of_type(client: &mut Client, kind: &str) -> Value {
    loop {
        let frame = next_json(client)
            .await
            .unwrap_or_else(|| panic!("connection closed before a {kind} frame"));
        if frame["type"] == kind {
            return frame;
        }
    }
}

pub async fn send_json(client: &mut Client, value: Value) {
    client.send(Message::Text(value.to_string())).await.unwrap();
}

/// Poll until `check` holds or the deadline passes
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
