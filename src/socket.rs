//! WebSocket relay of catalog change notifications.
//!
//! A client that changed the catalog announces it with a `*-cliente` event.
//! The relay re-emits it under its public name to every other connected
//! client. Frames are JSON `{"event": "...", "data": ...}`. Unknown events
//! and malformed frames are ignored.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

use crate::auth::Account;
use crate::handlers::AppState;

const RELAY_CAPACITY: usize = 256;

/// Client event and the name it is re-broadcast under.
pub const EVENT_MAP: &[(&str, &str)] = &[
    ("producto-creado-cliente", "producto-creado"),
    ("producto-actualizado-cliente", "producto-actualizado"),
    ("producto-eliminado-cliente", "producto-eliminado"),
    ("productos-eliminados-cliente", "productos-eliminados"),
];

pub fn relayed_event(event: &str) -> Option<&'static str> {
    EVENT_MAP
        .iter()
        .find(|(inbound, _)| *inbound == event)
        .map(|(_, outbound)| *outbound)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone)]
struct Envelope {
    origin: u64,
    text: String,
}

pub struct Relay {
    sender: broadcast::Sender<Envelope>,
    next_client: AtomicU64,
}

impl Default for Relay {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(RELAY_CAPACITY);
        Self {
            sender,
            next_client: AtomicU64::new(1),
        }
    }
}

impl Relay {
    /// Registers a client and returns its handle.
    pub fn join(self: &Arc<Self>) -> RelayClient {
        RelayClient {
            id: self.next_client.fetch_add(1, Ordering::Relaxed),
            relay: Arc::clone(self),
            inbox: self.sender.subscribe(),
        }
    }

    pub fn clients(&self) -> usize {
        self.sender.receiver_count()
    }
}

pub struct RelayClient {
    id: u64,
    relay: Arc<Relay>,
    inbox: broadcast::Receiver<Envelope>,
}

impl RelayClient {
    /// Re-broadcasts a client frame. Returns `false` when it was ignored.
    pub fn publish(&self, text: &str) -> bool {
        let Ok(frame) = serde_json::from_str::<Frame>(text) else {
            return false;
        };
        let Some(event) = relayed_event(&frame.event) else {
            return false;
        };
        let outbound = Frame {
            event: event.to_string(),
            data: frame.data,
        };
        let Ok(text) = serde_json::to_string(&outbound) else {
            return false;
        };
        // no receivers is fine
        let _ = self.relay.sender.send(Envelope {
            origin: self.id,
            text,
        });
        true
    }

    /// Next frame published by another client, or `None` once the relay is gone.
    pub async fn next(&mut self) -> Option<String> {
        loop {
            match self.inbox.recv().await {
                Ok(envelope) if envelope.origin == self.id => continue,
                Ok(envelope) => return Some(envelope.text),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(client = self.id, skipped, "Relay client lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// `GET /socket`: upgrades an authenticated request to a relay connection.
pub async fn get_socket(
    State(state): State<Arc<AppState>>,
    Extension(Account(account)): Extension<Account>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let client = state.relay.join();
    upgrade.on_upgrade(move |socket| serve(socket, client, account))
}

async fn serve(socket: WebSocket, mut client: RelayClient, account: alloy::primitives::Address) {
    tracing::debug!(client = client.id, account = %account, "Relay client connected");
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if !client.publish(text.as_str()) {
                        tracing::debug!(client = client.id, "Ignored relay frame");
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(client = client.id, error = %err, "Relay socket error");
                    break;
                }
            },
            outbound = client.next() => match outbound {
                Some(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    tracing::debug!(client = client.id, "Relay client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_event_mapping() {
        assert_eq!(
            relayed_event("producto-creado-cliente"),
            Some("producto-creado")
        );
        assert_eq!(
            relayed_event("productos-eliminados-cliente"),
            Some("productos-eliminados")
        );
        assert_eq!(relayed_event("producto-creado"), None);
        assert_eq!(relayed_event("chat"), None);
    }

    #[tokio::test]
    async fn test_relay_reaches_others_only() {
        let relay = Arc::new(Relay::default());
        let mut sender = relay.join();
        let mut receiver = relay.join();
        assert_eq!(relay.clients(), 2);

        let frame = json!({"event": "producto-eliminado-cliente", "data": {"id": "0x01"}});
        assert!(sender.publish(&frame.to_string()));

        let text = receiver.next().await.unwrap();
        let relayed: Frame = serde_json::from_str(&text).unwrap();
        assert_eq!(relayed.event, "producto-eliminado");
        assert_eq!(relayed.data, json!({"id": "0x01"}));

        let own = tokio::time::timeout(Duration::from_millis(50), sender.next()).await;
        assert!(own.is_err(), "sender must not receive its own frame");
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_frames_are_ignored() {
        let relay = Arc::new(Relay::default());
        let sender = relay.join();
        let mut receiver = relay.join();

        assert!(!sender.publish("not json"));
        assert!(!sender.publish(&json!({"event": "producto-creado"}).to_string()));
        assert!(sender.publish(&json!({"event": "producto-creado-cliente"}).to_string()));

        let relayed: Frame = serde_json::from_str(&receiver.next().await.unwrap()).unwrap();
        assert_eq!(relayed.event, "producto-creado");
        assert_eq!(relayed.data, serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_dropped_client_leaves_relay() {
        let relay = Arc::new(Relay::default());
        let client = relay.join();
        assert_eq!(relay.clients(), 1);
        drop(client);
        assert_eq!(relay.clients(), 0);
    }
}
