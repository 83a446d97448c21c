//! WebSocket push gateway (spec.md §4.6), grounded on
//! `original_source/internal/push/gateway.go`.
//!
//! One `RwLock`-guarded table tracks connected clients, the topics each one
//! subscribed to, and the live bus subscription backing each topic. The bus
//! subscription for a topic is attached lazily on its first subscriber and
//! detached once its last subscriber leaves — the gateway is never
//! subscribed to a topic nobody is listening to. Fan-out is best-effort:
//! a client whose outbound queue is full gets the update dropped, not the
//! connection killed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::MarketBus;
use crate::metrics;

const CLIENT_QUEUE_CAPACITY: usize = 256;

/// Client command protocol (spec.md §4.6): `{"action": "subscribe" |
/// "unsubscribe", "topic": "<bus subject pattern>"}`. Clients address bus
/// subjects directly (e.g. `market.kline.1m.BTCUSDT`) rather than symbol
/// fields the gateway would have to reassemble.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum ClientMessage {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ServerMessage<'a> {
    Subscribed { topic: &'a str },
    Unsubscribed { topic: &'a str },
    Error { message: &'a str },
}

struct Shared {
    /// Connected clients and their outbound queues.
    clients: HashMap<Uuid, mpsc::Sender<String>>,
    /// Topic -> set of subscribed client ids.
    subscriptions: HashMap<String, HashSet<Uuid>>,
    /// Topic -> handle for the task forwarding bus messages to subscribers.
    bus_subs: HashMap<String, tokio::task::JoinHandle<()>>,
}

/// Shared gateway state. Clone is cheap (`Arc` inside); every websocket
/// connection holds one.
#[derive(Clone)]
pub struct PushGateway {
    bus: MarketBus,
    shared: Arc<RwLock<Shared>>,
}

impl PushGateway {
    pub fn new(bus: MarketBus) -> Self {
        Self {
            bus,
            shared: Arc::new(RwLock::new(Shared {
                clients: HashMap::new(),
                subscriptions: HashMap::new(),
                bus_subs: HashMap::new(),
            })),
        }
    }

    /// Register a new client, returning its id and the receiving half of
    /// its outbound queue. The caller (the websocket handler) owns draining
    /// that queue onto the socket.
    pub fn register_client(&self) -> (Uuid, mpsc::Receiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        self.shared.write().clients.insert(id, tx);
        metrics::record_push_client_connected();
        (id, rx)
    }

    /// Tear down a client: remove it from every topic it subscribed to,
    /// detaching any topic's bus subscription that becomes empty.
    pub fn deregister_client(&self, client_id: Uuid) {
        let mut shared = self.shared.write();
        shared.clients.remove(&client_id);

        let mut emptied_topics = Vec::new();
        for (topic, subscribers) in shared.subscriptions.iter_mut() {
            if subscribers.remove(&client_id) && subscribers.is_empty() {
                emptied_topics.push(topic.clone());
            }
        }
        for topic in emptied_topics {
            shared.subscriptions.remove(&topic);
            if let Some(handle) = shared.bus_subs.remove(&topic) {
                handle.abort();
            }
        }

        metrics::record_push_client_disconnected();
    }

    /// Handle one inbound JSON protocol message from a client, returning
    /// the reply to send back (or `None` on a malformed frame, matching the
    /// original's "ignore it" policy rather than closing the connection).
    pub async fn handle_client_message(&self, client_id: Uuid, raw: &str) -> Option<String> {
        let message: ClientMessage = match serde_json::from_str(raw) {
            Ok(m) => m,
            Err(err) => {
                debug!(error = %err, "dropping malformed push protocol frame");
                return serde_json::to_string(&ServerMessage::Error { message: "malformed request" }).ok();
            }
        };

        match message {
            ClientMessage::Subscribe { topic } => {
                self.subscribe(client_id, &topic).await;
                serde_json::to_string(&ServerMessage::Subscribed { topic: &topic }).ok()
            }
            ClientMessage::Unsubscribe { topic } => {
                self.unsubscribe(client_id, &topic);
                serde_json::to_string(&ServerMessage::Unsubscribed { topic: &topic }).ok()
            }
        }
    }

    async fn subscribe(&self, client_id: Uuid, topic: &str) {
        let needs_attach = {
            let mut shared = self.shared.write();
            let subscribers = shared.subscriptions.entry(topic.to_string()).or_default();
            let was_empty = subscribers.is_empty();
            subscribers.insert(client_id);
            was_empty && !shared.bus_subs.contains_key(topic)
        };

        if needs_attach {
            self.attach_bus_subscription(topic.to_string()).await;
        }
    }

    fn unsubscribe(&self, client_id: Uuid, topic: &str) {
        let mut shared = self.shared.write();
        let Some(subscribers) = shared.subscriptions.get_mut(topic) else { return };
        subscribers.remove(&client_id);
        if subscribers.is_empty() {
            shared.subscriptions.remove(topic);
            if let Some(handle) = shared.bus_subs.remove(topic) {
                handle.abort();
            }
        }
    }

    /// Attach a live bus subscription for `topic`, forwarding every message
    /// to every current subscriber until the topic is detached.
    async fn attach_bus_subscription(&self, topic: String) {
        let mut subscriber = match self.bus.subscribe_subject(&topic).await {
            Ok(s) => s,
            Err(err) => {
                warn!(error = %err, topic, "failed to attach bus subscription for push topic");
                return;
            }
        };

        let shared = self.shared.clone();
        let topic_for_task = topic.clone();
        let handle = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                let payload = match std::str::from_utf8(&message.payload) {
                    Ok(p) => p.to_string(),
                    Err(_) => continue,
                };
                fan_out(&shared, &topic_for_task, payload);
            }
        });

        self.shared.write().bus_subs.insert(topic, handle);
    }
}

/// Best-effort fan-out: a client with a full queue just misses this
/// update, it is never disconnected over it.
fn fan_out(shared: &Arc<RwLock<Shared>>, topic: &str, payload: String) {
    let shared = shared.read();
    let Some(subscribers) = shared.subscriptions.get(topic) else { return };
    for client_id in subscribers {
        if let Some(sender) = shared.clients.get(client_id) {
            if sender.try_send(payload.clone()).is_err() {
                debug!(%client_id, topic, "client outbound queue full, dropping update");
            }
        }
    }
}

/// `GET /ws` (spec.md §4.6 / §6). Upgrades the connection then hands it to
/// [`handle_socket`].
pub async fn websocket_handler(State(gateway): State<PushGateway>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(gateway, socket))
}

/// Drives one client connection until it closes. Reader and writer share a
/// single task because both need the same `SplitSink` half: inbound
/// subscribe/unsubscribe frames produce a reply on it, and fanned-out bus
/// messages arrive on the same outbound queue.
async fn handle_socket(gateway: PushGateway, socket: WebSocket) {
    let (client_id, mut outbound_rx) = gateway.register_client();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = gateway.handle_client_message(client_id, &text).await {
                            if sender.send(Message::Text(reply)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(%client_id, error = %err, "websocket read error");
                        break;
                    }
                }
            }
            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(payload) => {
                        if sender.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    gateway.deregister_client(client_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_shared() -> Arc<RwLock<Shared>> {
        Arc::new(RwLock::new(Shared {
            clients: HashMap::new(),
            subscriptions: HashMap::new(),
            bus_subs: HashMap::new(),
        }))
    }

    #[test]
    fn test_unsubscribe_last_client_clears_topic_entry() {
        let shared = empty_shared();
        let client_id = Uuid::new_v4();
        let topic = "market.kline.1m.BTCUSDT";
        shared.write().subscriptions.entry(topic.to_string()).or_default().insert(client_id);

        let mut guard = shared.write();
        let subscribers = guard.subscriptions.get_mut(topic).unwrap();
        subscribers.remove(&client_id);
        if subscribers.is_empty() {
            guard.subscriptions.remove(topic);
        }
        drop(guard);

        assert!(shared.read().subscriptions.is_empty());
    }

    #[test]
    fn test_fan_out_skips_topics_with_no_subscribers() {
        let shared = empty_shared();
        // No subscribers registered for this topic; fan_out must not panic
        // and must leave client/subscription state untouched.
        fan_out(&shared, "market.kline.1m.ETHUSDT", "{}".to_string());
        assert!(shared.read().clients.is_empty());
    }

    #[test]
    fn test_client_message_parses_topic_field() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"action":"subscribe","topic":"market.kline.1m.BTCUSDT"}"#,
        )
        .expect("valid subscribe frame");
        match msg {
            ClientMessage::Subscribe { topic } => assert_eq!(topic, "market.kline.1m.BTCUSDT"),
            ClientMessage::Unsubscribe { .. } => panic!("expected subscribe"),
        }
    }
}
