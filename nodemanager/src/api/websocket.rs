//! WebSocket access to the event broadcaster
//!
//! A connection subscribes to any number of named channels (`log:<project>`,
//! `log:<project>:<app>`, `lifecycle:<project>`). Every subscription is a
//! broadcaster [`Subscription`] forwarded by its own task; dropping the
//! connection drops all of them.

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::events::{EventBroadcaster, Subscription};

const OUTBOUND_BUFFER: usize = 256;

/// WebSocket subscription message from client
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsSubscriptionMessage {
    /// Subscribe to channels
    Subscribe { channels: Vec<String> },
    /// Unsubscribe from channels
    Unsubscribe { channels: Vec<String> },
    /// Ping for keepalive
    Ping,
}

/// WebSocket message to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsClientMessage {
    /// A message published on a subscribed channel
    Event { channel: String, data: String },
    /// Subscription confirmation
    Subscribed { channels: Vec<String> },
    /// Unsubscription confirmation
    Unsubscribed { channels: Vec<String> },
    /// Pong response
    Pong,
    /// Error message
    Error { message: String },
}

/// Connection info
#[derive(Debug, Clone)]
struct ConnectionInfo {
    subscribed_channels: Vec<String>,
}

/// WebSocket manager
#[derive(Clone)]
pub struct WsManager {
    events: EventBroadcaster,
    /// Active connections
    connections: Arc<RwLock<HashMap<String, ConnectionInfo>>>,
}

impl WsManager {
    pub fn new(events: EventBroadcaster) -> Self {
        Self {
            events,
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get active connection count
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Number of connections subscribed to a channel
    pub async fn channel_subscribers(&self, channel: &str) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|conn| conn.subscribed_channels.iter().any(|c| c == channel))
            .count()
    }
}

/// Server side of one connection
struct Connection {
    id: String,
    manager: WsManager,
    outbound: mpsc::Sender<WsClientMessage>,
    forwarders: HashMap<String, JoinHandle<()>>,
}

impl Connection {
    async fn subscribe(&mut self, channels: &[String]) {
        for channel in channels {
            if self.forwarders.contains_key(channel) {
                continue;
            }
            let subscription = self.manager.events.subscribe(channel);
            let forwarder = tokio::spawn(forward(subscription, self.outbound.clone()));
            self.forwarders.insert(channel.clone(), forwarder);
        }
        self.sync_info().await;
    }

    async fn unsubscribe(&mut self, channels: &[String]) {
        for channel in channels {
            if let Some(forwarder) = self.forwarders.remove(channel) {
                forwarder.abort();
            }
        }
        self.sync_info().await;
    }

    async fn sync_info(&self) {
        let mut subscribed: Vec<String> = self.forwarders.keys().cloned().collect();
        subscribed.sort();
        if let Some(conn) = self.manager.connections.write().await.get_mut(&self.id) {
            conn.subscribed_channels = subscribed;
        }
    }

    async fn reply(&self, message: WsClientMessage) {
        if self.outbound.send(message).await.is_err() {
            debug!("Connection {} is closing, reply dropped", self.id);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for forwarder in self.forwarders.values() {
            forwarder.abort();
        }
    }
}

async fn forward(mut subscription: Subscription, outbound: mpsc::Sender<WsClientMessage>) {
    while let Some(data) = subscription.recv().await {
        let message = WsClientMessage::Event {
            channel: subscription.channel().to_string(),
            data,
        };
        if outbound.send(message).await.is_err() {
            break;
        }
    }
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(manager): State<WsManager>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, manager))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, manager: WsManager) {
    let connection_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {}", connection_id);

    let (sender, receiver) = socket.split();
    let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);

    manager.connections.write().await.insert(
        connection_id.clone(),
        ConnectionInfo {
            subscribed_channels: Vec::new(),
        },
    );

    let connection = Connection {
        id: connection_id.clone(),
        manager: manager.clone(),
        outbound,
        forwarders: HashMap::new(),
    };

    let mut send_task = tokio::spawn(send_messages(sender, outbound_rx, connection_id.clone()));
    let mut recv_task = tokio::spawn(receive_messages(receiver, connection));

    tokio::select! {
        _ = &mut send_task => {
            debug!("Send task completed for connection {}", connection_id);
            recv_task.abort();
        }
        _ = &mut recv_task => {
            debug!("Receive task completed for connection {}", connection_id);
            send_task.abort();
        }
    }

    manager.connections.write().await.remove(&connection_id);
    info!("WebSocket connection closed: {}", connection_id);
}

/// Send queued messages to client
async fn send_messages(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<WsClientMessage>,
    connection_id: String,
) {
    while let Some(message) = outbound.recv().await {
        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize message for {}: {}", connection_id, e);
                continue;
            }
        };
        if let Err(e) = sender.send(Message::Text(json.into())).await {
            debug!("Failed to send message to {}: {}", connection_id, e);
            break;
        }
    }
}

/// Receive messages from client
async fn receive_messages(mut receiver: SplitStream<WebSocket>, mut connection: Connection) {
    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => handle_client_message(&text, &mut connection).await,
            Ok(Message::Close(_)) => {
                debug!("Received close message from {}", connection.id);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!("WebSocket error for {}: {}", connection.id, e);
                break;
            }
        }
    }
}

/// Handle client subscription messages
async fn handle_client_message(text: &str, connection: &mut Connection) {
    let msg: WsSubscriptionMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            connection
                .reply(WsClientMessage::Error {
                    message: format!("Invalid message: {}", e),
                })
                .await;
            return;
        }
    };

    match msg {
        WsSubscriptionMessage::Subscribe { channels } => {
            debug!("Connection {} subscribing to {:?}", connection.id, channels);
            connection.subscribe(&channels).await;
            connection.reply(WsClientMessage::Subscribed { channels }).await;
        }
        WsSubscriptionMessage::Unsubscribe { channels } => {
            debug!("Connection {} unsubscribing from {:?}", connection.id, channels);
            connection.unsubscribe(&channels).await;
            connection.reply(WsClientMessage::Unsubscribed { channels }).await;
        }
        WsSubscriptionMessage::Ping => connection.reply(WsClientMessage::Pong).await,
    }
}

/// Create WebSocket routes
pub fn websocket_routes(manager: WsManager) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(manager)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(events: EventBroadcaster) -> (Connection, mpsc::Receiver<WsClientMessage>) {
        let (outbound, rx) = mpsc::channel(16);
        let connection = Connection {
            id: "test".into(),
            manager: WsManager::new(events),
            outbound,
            forwarders: HashMap::new(),
        };
        (connection, rx)
    }

    #[test]
    fn test_message_shapes() {
        let msg: WsSubscriptionMessage =
            serde_json::from_str(r#"{"type":"Subscribe","channels":["log:42"]}"#).unwrap();
        assert!(matches!(msg, WsSubscriptionMessage::Subscribe { channels } if channels == ["log:42"]));

        let event = WsClientMessage::Event {
            channel: "log:42".into(),
            data: "hi\n".into(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({"type": "Event", "channel": "log:42", "data": "hi\n"})
        );
    }

    #[tokio::test]
    async fn test_subscribe_forwards_events() {
        let events = EventBroadcaster::default();
        let (mut conn, mut rx) = connection(events.clone());

        handle_client_message(r#"{"type":"Subscribe","channels":["log:42"]}"#, &mut conn).await;
        assert_eq!(
            rx.recv().await,
            Some(WsClientMessage::Subscribed {
                channels: vec!["log:42".into()]
            })
        );

        events.publish("log:42", "ready");
        assert_eq!(
            rx.recv().await,
            Some(WsClientMessage::Event {
                channel: "log:42".into(),
                data: "ready".into()
            })
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_and_errors() {
        let events = EventBroadcaster::default();
        let (mut conn, mut rx) = connection(events.clone());

        handle_client_message(r#"{"type":"Subscribe","channels":["a"]}"#, &mut conn).await;
        rx.recv().await;
        handle_client_message(r#"{"type":"Unsubscribe","channels":["a"]}"#, &mut conn).await;
        assert!(matches!(rx.recv().await, Some(WsClientMessage::Unsubscribed { .. })));

        // The aborted forwarder released its subscription
        for _ in 0..100 {
            if events.subscriber_count("a") == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(events.publish("a", "lost"), 0);

        handle_client_message(r#"{"type":"Ping"}"#, &mut conn).await;
        assert_eq!(rx.recv().await, Some(WsClientMessage::Pong));

        handle_client_message("not json", &mut conn).await;
        assert!(matches!(rx.recv().await, Some(WsClientMessage::Error { .. })));
    }
}
