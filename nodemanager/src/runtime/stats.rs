//! On-demand resource statistics for a project's apps
//!
//! "Running" comes from the registry alone. Resource numbers are best-effort:
//! if the OS query fails or a process vanished between snapshot and query, the
//! app is still reported as running, with zeroed CPU and memory.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::warn;

use super::process::{ProcessControl, ResourceUsage};
use super::registry::Registry;

/// Statistics of one app
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppStats {
    pub running: bool,

    #[serde(rename = "uptime")]
    pub uptime_ms: u64,

    #[serde(rename = "cpu")]
    pub cpu_percent: f64,

    #[serde(rename = "memory")]
    pub memory_bytes: u64,
}

/// Statistics of a project
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectStats {
    pub running: bool,
    pub apps: BTreeMap<String, AppStats>,
}

/// Reads registry snapshots and queries the OS for their usage
#[derive(Clone)]
pub struct StatsCollector {
    registry: Arc<Registry>,
    control: Arc<dyn ProcessControl>,
}

impl StatsCollector {
    pub fn new(registry: Arc<Registry>, control: Arc<dyn ProcessControl>) -> Self {
        Self { registry, control }
    }

    pub async fn stats(&self, project_id: &str) -> ProjectStats {
        let snapshot = self.registry.snapshot(project_id);
        if snapshot.is_empty() {
            return ProjectStats::default();
        }

        let pids: Vec<u32> = snapshot.iter().filter_map(|app| app.pid).collect();
        let usage: HashMap<u32, ResourceUsage> = if pids.is_empty() {
            Default::default()
        } else {
            let control = self.control.clone();
            let query = pids.clone();
            match tokio::task::spawn_blocking(move || control.resource_usage(&query)).await {
                Ok(Ok(usage)) => usage,
                Ok(Err(e)) => {
                    warn!("Stats error for project {}: {}", project_id, e);
                    Default::default()
                }
                Err(e) => {
                    warn!("Stats query task failed for project {}: {}", project_id, e);
                    Default::default()
                }
            }
        };

        let apps = snapshot
            .into_iter()
            .map(|app| {
                let measured = app
                    .pid
                    .and_then(|pid| usage.get(&pid).copied())
                    .unwrap_or_default();
                let stats = AppStats {
                    running: true,
                    uptime_ms: app.uptime().as_millis() as u64,
                    cpu_percent: measured.cpu_percent,
                    memory_bytes: measured.memory_bytes,
                };
                (app.app_name, stats)
            })
            .collect();

        ProjectStats {
            running: true,
            apps,
        }
    }
}
