//! Event distribution
//!
//! Child output and lifecycle notifications are published as text on named
//! channels. Output goes to `log:*` channels verbatim; lifecycle events are
//! JSON documents on `lifecycle:<project>` and are the only confirmation of
//! commands that return before the OS acts (stop, kill, restart).

pub mod broadcaster;
pub mod channels;

pub use broadcaster::{EventBroadcaster, Subscription};
pub use channels::LogRoute;

use serde::{Deserialize, Serialize};

/// Lifecycle notification for one app
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// Child spawned and registered
    Started {
        app: String,
        pid: u32,
        generation: u64,
    },
    /// The OS refused to spawn the child
    SpawnFailed { app: String, error: String },
    /// Termination signal sent to the tree
    StopRequested { app: String, signal: String },
    /// Restart accepted, the fresh start follows after `delay_ms`
    RestartScheduled { app: String, delay_ms: u64 },
    /// Child exited and was deregistered
    Exited {
        app: String,
        code: Option<i32>,
        generation: u64,
    },
}

impl EventBroadcaster {
    /// Publish a line of app output (or a synthetic status line) on every log route
    pub fn publish_log(&self, route: &LogRoute, text: &str) {
        for channel in route.targets() {
            self.publish(channel, text);
        }
    }

    /// Publish a lifecycle event on the project's lifecycle channel
    pub fn publish_lifecycle(&self, project_id: &str, event: &LifecycleEvent) {
        match serde_json::to_string(event) {
            Ok(json) => {
                self.publish(&channels::lifecycle(project_id), json);
            }
            Err(e) => tracing::error!("Failed to serialize lifecycle event: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_output_is_mirrored() {
        let broadcaster = EventBroadcaster::default();
        let mut qualified = broadcaster.subscribe("log:42:default");
        let mut legacy = broadcaster.subscribe("log:42");

        broadcaster.publish_log(&LogRoute::new("42", "default"), "ready\n");

        assert_eq!(qualified.recv().await.as_deref(), Some("ready\n"));
        assert_eq!(legacy.recv().await.as_deref(), Some("ready\n"));
    }

    #[tokio::test]
    async fn test_lifecycle_event_json() {
        let broadcaster = EventBroadcaster::default();
        let mut sub = broadcaster.subscribe("lifecycle:42");

        broadcaster.publish_lifecycle(
            "42",
            &LifecycleEvent::Exited {
                app: "web".into(),
                code: Some(1),
                generation: 3,
            },
        );

        let json: serde_json::Value = serde_json::from_str(&sub.recv().await.unwrap()).unwrap();
        assert_eq!(json["type"], "exited");
        assert_eq!(json["app"], "web");
        assert_eq!(json["code"], 1);
    }
}
