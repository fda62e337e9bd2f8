//! Per-channel publish/subscribe for process output
//!
//! Delivery is at-most-once and best-effort: nothing is buffered for channels
//! without subscribers, and late subscribers never see earlier messages.

use dashmap::DashMap;
use futures::Stream;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{trace, warn};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Text broadcaster keyed by channel name
#[derive(Clone)]
pub struct EventBroadcaster {
    channels: Arc<DashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Publish to the current subscribers of `channel`, returning how many received it
    pub fn publish(&self, channel: &str, text: impl Into<String>) -> usize {
        let delivered = match self.channels.get(channel) {
            Some(sender) => sender.send(text.into()).unwrap_or(0),
            None => return 0,
        };

        if delivered == 0 {
            // Every subscriber is gone
            self.channels.remove_if(channel, |_, sender| sender.receiver_count() == 0);
        }
        trace!("Published to {} ({} subscribers)", channel, delivered);
        delivered
    }

    /// Subscribe to one channel. Dropping the subscription unsubscribes.
    pub fn subscribe(&self, channel: &str) -> Subscription {
        let receiver = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        Subscription {
            channel: channel.to_string(),
            receiver,
        }
    }

    /// Number of live subscribers of a channel
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Number of channels that currently have a sender
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// A live subscription to one channel
pub struct Subscription {
    channel: String,
    receiver: broadcast::Receiver<String>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next message, or `None` once the channel is gone. Lag skips ahead.
    pub async fn recv(&mut self) -> Option<String> {
        loop {
            match self.receiver.recv().await {
                Ok(text) => return Some(text),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Subscriber of {} lagged by {} messages", self.channel, n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Convert into a stream of messages, skipping lag notifications
    pub fn into_stream(self) -> impl Stream<Item = String> + Send + 'static {
        let channel = self.channel;
        BroadcastStream::new(self.receiver).filter_map(move |item| match item {
            Ok(text) => Some(text),
            Err(BroadcastStreamRecvError::Lagged(n)) => {
                warn!("Subscriber of {} lagged by {} messages", channel, n);
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_reaches_exact_channel_only() {
        let broadcaster = EventBroadcaster::default();
        let mut qualified = broadcaster.subscribe("log:42:web");
        let mut legacy = broadcaster.subscribe("log:42");

        assert_eq!(broadcaster.publish("log:42:web", "hello"), 1);
        assert_eq!(qualified.recv().await.as_deref(), Some("hello"));

        let nothing = tokio::time::timeout(Duration::from_millis(50), legacy.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_no_replay_for_late_subscribers() {
        let broadcaster = EventBroadcaster::default();
        assert_eq!(broadcaster.publish("log:1", "early"), 0);

        let mut sub = broadcaster.subscribe("log:1");
        broadcaster.publish("log:1", "late");
        assert_eq!(sub.recv().await.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_drop_unsubscribes_and_prunes() {
        let broadcaster = EventBroadcaster::default();
        let sub = broadcaster.subscribe("log:1:api");
        assert_eq!(broadcaster.subscriber_count("log:1:api"), 1);

        drop(sub);
        assert_eq!(broadcaster.subscriber_count("log:1:api"), 0);
        assert_eq!(broadcaster.publish("log:1:api", "gone"), 0);
        assert_eq!(broadcaster.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_ordering_and_fan_out() {
        let broadcaster = EventBroadcaster::default();
        let a = broadcaster.subscribe("c");
        let b = broadcaster.subscribe("c");

        for i in 0..5 {
            assert_eq!(broadcaster.publish("c", format!("line {}", i)), 2);
        }

        let from_a: Vec<String> = a.into_stream().take(5).collect().await;
        let from_b: Vec<String> = b.into_stream().take(5).collect().await;
        let expected: Vec<String> = (0..5).map(|i| format!("line {}", i)).collect();
        assert_eq!(from_a, expected);
        assert_eq!(from_b, expected);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_ahead() {
        let broadcaster = EventBroadcaster::new(2);
        let mut sub = broadcaster.subscribe("c");

        for i in 0..5 {
            broadcaster.publish("c", i.to_string());
        }

        assert_eq!(sub.recv().await.as_deref(), Some("3"));
        assert_eq!(sub.recv().await.as_deref(), Some("4"));
    }
}
