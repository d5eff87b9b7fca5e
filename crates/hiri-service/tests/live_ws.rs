//! Live WebSocket tests against the served router.
//!
//! The app is bound to a local port and driven by a real WebSocket client;
//! rows are published straight into the hub, no collector runs.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use hiri_core::MockUpstream;
use hiri_service::{AppState, Config, LogBuffer, app};
use hiri_store::DayStore;
use hiri_types::{PartitionKey, Reading};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn serve(broadcast_buffer: usize) -> (TempDir, Arc<AppState>, SocketAddr) {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.server.broadcast_buffer = broadcast_buffer;
    let store = DayStore::open(dir.path()).unwrap();
    let state = AppState::new(store, Arc::new(MockUpstream::new()), config, LogBuffer::new(32));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(Arc::clone(&state));
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (dir, state, addr)
}

async fn connect(addr: SocketAddr) -> Client {
    let (mut client, _) = connect_async(format!("ws://{addr}/api/ws")).await.unwrap();
    let hello = next_json(&mut client).await;
    assert_eq!(hello["event"], "status");
    client
}

/// Next text frame as JSON; `None` on close.
async fn next_frame(client: &mut Client) -> Option<Value> {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("no frame within 5s")?;
        match message.unwrap() {
            Message::Text(text) => return Some(serde_json::from_str(text.as_str()).unwrap()),
            Message::Close(_) => return None,
            _ => {}
        }
    }
}

async fn next_json(client: &mut Client) -> Value {
    next_frame(client).await.expect("connection closed")
}

async fn send(client: &mut Client, value: Value) {
    client.send(Message::text(value.to_string())).await.unwrap();
}

fn key() -> PartitionKey {
    PartitionKey::new("18", "HIRIPRO-01", "datos").unwrap()
}

fn row(second: u32) -> Reading {
    let time = format!("2025-09-01T10:00:{second:02}").parse().unwrap();
    Reading::new("HIRIPRO-01", time, Some(u64::from(second)))
}

#[tokio::test]
async fn test_subscribe_receives_new_data() {
    let (_dir, state, addr) = serve(16).await;
    let mut client = connect(addr).await;

    send(&mut client, json!({"type": "subscribe", "device_code": "HIRIPRO-01"})).await;
    let reply = next_json(&mut client).await;
    assert_eq!(reply["event"], "subscribed");
    assert_eq!(reply["project_id"], "18");
    assert_eq!(reply["tabla"], "datos");

    assert_eq!(state.hub.publish(&key(), vec![row(1), row(2)]), 1);
    let event = next_json(&mut client).await;
    assert_eq!(event["event"], "new_data");
    assert_eq!(event["count"], 2);
    assert_eq!(event["key"]["device_code"], "HIRIPRO-01");
    assert_eq!(event["rows"][1]["envio_n"], 2);
    assert_eq!(event["days"][0], "2025-09-01");
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (_dir, state, addr) = serve(16).await;
    let mut client = connect(addr).await;

    send(&mut client, json!({"type": "subscribe"})).await;
    assert_eq!(next_json(&mut client).await["event"], "subscribed");
    send(&mut client, json!({"type": "unsubscribe"})).await;
    assert_eq!(next_json(&mut client).await["event"], "unsubscribed");

    state.hub.publish(&key(), vec![row(3)]);
    let silent = tokio::time::timeout(Duration::from_millis(200), client.next()).await;
    assert!(silent.is_err(), "unexpected frame after unsubscribe");

    // the connection itself stays usable
    send(&mut client, json!({"type": "shout"})).await;
    assert_eq!(next_json(&mut client).await["event"], "error");
}

#[tokio::test]
async fn test_lagging_subscriber_gets_error_then_close() {
    let (_dir, state, addr) = serve(1).await;
    let mut client = connect(addr).await;

    send(&mut client, json!({"type": "subscribe"})).await;
    assert_eq!(next_json(&mut client).await["event"], "subscribed");

    // published back to back, before the forwarder can drain
    for second in 0..5 {
        state.hub.publish(&key(), vec![row(second)]);
    }

    let error = next_json(&mut client).await;
    assert_eq!(error["event"], "error");
    assert!(error["message"].as_str().unwrap().contains("missed"));
    assert!(next_frame(&mut client).await.is_none());
}
