//! WebSocket channel for live updates.
//!
//! Protocol (JSON text frames):
//!
//! - server → `{"event":"status","message":...}` on connect
//! - client → `{"type":"subscribe","project_id":..,"device_code":..,"tabla":..}`
//!   (missing fields use the configured defaults), answered by
//!   `{"event":"subscribed",...}`
//! - server → `{"event":"new_data","key":{..},"rows":[..],"count":n,"days":[..]}`
//! - client → `{"type":"unsubscribe",...}`, answered by `{"event":"unsubscribed",...}`
//! - server → `{"event":"error","message":...}` for invalid messages
//!
//! A connection that falls behind on any subscription is told so and closed;
//! the client is expected to catch up through `/api/data?mode=day&since=`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use hiri_types::PartitionKey;

use crate::hub::{HubError, LiveEvent};
use crate::query::PartitionParams;
use crate::state::AppState;

/// Frames queued per connection before forwarding waits.
const OUTBOX_CAPACITY: usize = 64;

/// Create the WebSocket router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api/ws", get(ws_handler))
}

/// Messages accepted from clients.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        #[serde(flatten)]
        partition: PartitionParams,
    },
    Unsubscribe {
        #[serde(flatten)]
        partition: PartitionParams,
    },
}

/// Messages sent to clients.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerMessage<'a> {
    Status {
        message: &'a str,
    },
    Subscribed {
        id: Uuid,
        project_id: &'a str,
        device_code: &'a str,
        tabla: &'a str,
    },
    Unsubscribed {
        project_id: &'a str,
        device_code: &'a str,
        tabla: &'a str,
    },
    NewData(&'a LiveEvent),
    Error {
        message: &'a str,
    },
}

impl ServerMessage<'_> {
    fn to_frame(&self) -> Option<Outgoing> {
        match serde_json::to_string(self) {
            Ok(json) => Some(Outgoing::Text(json)),
            Err(e) => {
                warn!("Failed to serialize message: {}", e);
                None
            }
        }
    }
}

enum Outgoing {
    Text(String),
    Close,
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outgoing>(OUTBOX_CAPACITY);

    info!("WebSocket client connected");

    if let Some(frame) = (ServerMessage::Status {
        message: "Connected to HIRI live updates",
    })
    .to_frame()
    {
        let _ = tx.send(frame).await;
    }

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                Outgoing::Text(json) => {
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Outgoing::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        let mut forwarders = JoinSet::new();
        let mut subscriptions: HashMap<PartitionKey, AbortHandle> = HashMap::new();

        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Text(text)) => {
                    handle_client_text(
                        &state,
                        &tx,
                        text.as_str(),
                        &mut forwarders,
                        &mut subscriptions,
                    )
                    .await;
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("WebSocket receive error: {}", e);
                    break;
                }
            }
        }
        // dropping the JoinSet aborts every forwarder
        drop(forwarders);
    });

    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        },
        _ = &mut recv_task => {
            send_task.abort();
        },
    }

    info!("WebSocket client disconnected");
}

async fn handle_client_text(
    state: &Arc<AppState>,
    tx: &mpsc::Sender<Outgoing>,
    text: &str,
    forwarders: &mut JoinSet<()>,
    subscriptions: &mut HashMap<PartitionKey, AbortHandle>,
) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            send_error(tx, &format!("invalid message: {e}")).await;
            return;
        }
    };

    match message {
        ClientMessage::Subscribe { partition } => {
            let key = match partition.key(&state.defaults) {
                Ok(key) => key,
                Err(e) => return send_error(tx, &e.to_string()).await,
            };
            let subscription = state.hub.subscribe(&key);
            let id = subscription.id;
            if let Some(previous) = subscriptions.remove(&key) {
                previous.abort();
            }
            let handle = forwarders.spawn(forward(subscription, tx.clone()));
            subscriptions.insert(key.clone(), handle);

            info!("WebSocket subscriber {} joined {}", id, key);
            let reply = ServerMessage::Subscribed {
                id,
                project_id: &key.project_id,
                device_code: &key.device_code,
                tabla: &key.tabla,
            };
            send(tx, &reply).await;
        }
        ClientMessage::Unsubscribe { partition } => {
            let key = match partition.key(&state.defaults) {
                Ok(key) => key,
                Err(e) => return send_error(tx, &e.to_string()).await,
            };
            if let Some(handle) = subscriptions.remove(&key) {
                handle.abort();
                debug!("WebSocket subscriber left {}", key);
            }
            let reply = ServerMessage::Unsubscribed {
                project_id: &key.project_id,
                device_code: &key.device_code,
                tabla: &key.tabla,
            };
            send(tx, &reply).await;
        }
    }
}

/// Relay hub events for one subscription into the connection's outbox.
async fn forward(mut subscription: crate::hub::Subscription, tx: mpsc::Sender<Outgoing>) {
    loop {
        match subscription.recv().await {
            Ok(event) => {
                let Some(frame) = ServerMessage::NewData(&event).to_frame() else {
                    continue;
                };
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
            Err(HubError::Lagged(missed)) => {
                let message = format!(
                    "missed {missed} updates for {}; reload through /api/data",
                    subscription.key
                );
                send_error(&tx, &message).await;
                let _ = tx.send(Outgoing::Close).await;
                break;
            }
            Err(HubError::Closed) => break,
        }
    }
}

async fn send(tx: &mpsc::Sender<Outgoing>, message: &ServerMessage<'_>) {
    if let Some(frame) = message.to_frame() {
        let _ = tx.send(frame).await;
    }
}

async fn send_error(tx: &mpsc::Sender<Outgoing>, message: &str) {
    send(tx, &ServerMessage::Error { message }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use hiri_types::Reading;

    #[test]
    fn test_client_message_parsing() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"subscribe","project_id":"18","device_code":"HIRIPRO-01"}"#,
        )
        .unwrap();
        let ClientMessage::Subscribe { partition } = msg else {
            panic!("expected subscribe");
        };
        assert_eq!(partition.device_code.as_deref(), Some("HIRIPRO-01"));
        assert_eq!(partition.tabla, None);

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"unsubscribe"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Unsubscribe { .. }));

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"shout"}"#).is_err());
    }

    #[test]
    fn test_server_message_shapes() {
        let json = serde_json::to_value(ServerMessage::Status { message: "hi" }).unwrap();
        assert_eq!(json, serde_json::json!({"event": "status", "message": "hi"}));

        let key = PartitionKey::new("18", "HIRIPRO-01", "datos").unwrap();
        let time = "2025-09-01T10:00:00".parse().unwrap();
        let event = LiveEvent::new(key, vec![Reading::new("HIRIPRO-01", time, Some(7))]);
        let json = serde_json::to_value(ServerMessage::NewData(&event)).unwrap();
        assert_eq!(json["event"], "new_data");
        assert_eq!(json["count"], 1);
        assert_eq!(json["key"]["project_id"], "18");
        assert_eq!(json["rows"][0]["envio_n"], 7);
        assert_eq!(json["days"][0], "2025-09-01");
    }
}
