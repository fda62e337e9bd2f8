//! Shared fixtures for the integration tests
//!
//! Every fixture owns a temporary project root with a `nodemanager.json` and a
//! supervisor wired to an in-memory project store. Apps are plain shell
//! commands (`sleep`, `echo`, `exit`) so the tests run real child processes.

#![allow(dead_code)]

use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;

use nodemanager::config::SupervisorConfig;
use nodemanager::events::{EventBroadcaster, Subscription};
use nodemanager::project::{MemoryProjectStore, Project};
use nodemanager::runtime::Supervisor;

/// Upper bound for anything the OS has to do
pub const TIMEOUT: Duration = Duration::from_secs(10);

pub struct Fixture {
    pub dir: TempDir,
    pub store: Arc<MemoryProjectStore>,
    pub supervisor: Supervisor,
}

impl Fixture {
    /// Project `project_id` whose root holds `launch_config` as `nodemanager.json`
    pub fn new(project_id: &str, launch_config: Value) -> Self {
        let dir = tempfile::tempdir().unwrap();
        write_launch_config(dir.path(), &launch_config);

        let store = Arc::new(MemoryProjectStore::with_projects([Project::new(
            project_id,
            dir.path(),
        )]));
        let supervisor = Supervisor::builder(store.clone(), EventBroadcaster::default())
            .config(SupervisorConfig {
                restart_grace_ms: 100,
                output_drain_ms: 500,
                ..Default::default()
            })
            .build();

        Self {
            dir,
            store,
            supervisor,
        }
    }

    pub fn subscribe(&self, channel: &str) -> Subscription {
        self.supervisor.events().subscribe(channel)
    }
}

/// Launch config with one entry per `(name, command, args)`, args split on whitespace
pub fn apps(entries: &[(&str, &str, &str)]) -> Value {
    let apps: Vec<Value> = entries
        .iter()
        .map(|(name, command, args)| {
            let args: Vec<&str> = args.split_whitespace().collect();
            serde_json::json!({ "name": name, "command": command, "args": args })
        })
        .collect();
    serde_json::json!({ "apps": apps })
}

pub fn write_launch_config(root: &Path, config: &Value) {
    std::fs::write(
        root.join("nodemanager.json"),
        serde_json::to_string_pretty(config).unwrap(),
    )
    .unwrap();
}

/// Poll `condition` until it holds or [`TIMEOUT`] elapses
pub async fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Next message on `subscription` satisfying `predicate`
pub async fn recv_matching(subscription: &mut Subscription, predicate: impl Fn(&str) -> bool) -> String {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            match subscription.recv().await {
                Some(text) if predicate(&text) => return text,
                Some(_) => continue,
                None => panic!("channel {} closed", subscription.channel()),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting on {}", subscription.channel()))
}

/// Collect everything published on `subscription` until `predicate` matches
pub async fn collect_until(subscription: &mut Subscription, predicate: impl Fn(&str) -> bool) -> String {
    let mut collected = String::new();
    tokio::time::timeout(TIMEOUT, async {
        while let Some(text) = subscription.recv().await {
            collected.push_str(&text);
            if predicate(&text) {
                break;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting on {}", subscription.channel()));
    collected
}
