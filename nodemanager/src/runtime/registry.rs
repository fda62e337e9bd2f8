//! Process registry
//!
//! The single source of truth for "is this app running". Entries are keyed by
//! `(project id, app name)` and at most one exists per key. Every entry carries a
//! generation number so that the exit of an old incarnation can never remove
//! a newer one registered under the same key.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Result, SupervisorError};

/// Registry key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AppKey {
    pub project_id: String,
    pub app_name: String,
}

impl AppKey {
    pub fn new(project_id: impl Into<String>, app_name: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            app_name: app_name.into(),
        }
    }
}

impl fmt::Display for AppKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project_id, self.app_name)
    }
}

/// A registered app
#[derive(Debug, Clone)]
pub struct RunningApp {
    pub project_id: String,
    pub app_name: String,

    /// Incarnation of this key
    pub generation: u64,

    /// OS process id, `None` between claim and spawn
    pub pid: Option<u32>,

    /// Wall-clock claim time
    pub started_at: DateTime<Utc>,

    started: Instant,
}

impl RunningApp {
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

/// In-memory table of running apps
#[derive(Default)]
pub struct Registry {
    projects: DashMap<String, HashMap<String, RunningApp>>,
    next_generation: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a free key, returning the generation of the new entry.
    ///
    /// Fails with `AlreadyRunning` if the key is taken. The check and the insert
    /// happen under the same shard lock.
    pub fn claim(&self, key: &AppKey) -> Result<u64> {
        let mut apps = self.projects.entry(key.project_id.clone()).or_default();
        if apps.contains_key(&key.app_name) {
            return Err(SupervisorError::AlreadyRunning {
                project_id: key.project_id.clone(),
                app: key.app_name.clone(),
            });
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        apps.insert(
            key.app_name.clone(),
            RunningApp {
                project_id: key.project_id.clone(),
                app_name: key.app_name.clone(),
                generation,
                pid: None,
                started_at: Utc::now(),
                started: Instant::now(),
            },
        );
        Ok(generation)
    }

    /// Record the pid of a claimed entry. Returns false if the claim is gone.
    pub fn attach_pid(&self, key: &AppKey, generation: u64, pid: u32) -> bool {
        let Some(mut apps) = self.projects.get_mut(&key.project_id) else {
            return false;
        };
        match apps.get_mut(&key.app_name) {
            Some(app) if app.generation == generation => {
                app.pid = Some(pid);
                true
            }
            _ => false,
        }
    }

    /// Remove the entry for `key` only if it is still `generation`.
    pub fn release(&self, key: &AppKey, generation: u64) -> Option<RunningApp> {
        let removed = {
            let mut apps = self.projects.get_mut(&key.project_id)?;
            let current = apps
                .get(&key.app_name)
                .is_some_and(|app| app.generation == generation);
            if current { apps.remove(&key.app_name) } else { None }
        };

        if removed.is_some() {
            self.projects.remove_if(&key.project_id, |_, apps| apps.is_empty());
        }
        removed
    }

    /// Snapshot of one entry
    pub fn get(&self, key: &AppKey) -> Option<RunningApp> {
        self.projects
            .get(&key.project_id)
            .and_then(|apps| apps.get(&key.app_name).cloned())
    }

    /// Snapshot of every entry of a project, sorted by app name
    pub fn snapshot(&self, project_id: &str) -> Vec<RunningApp> {
        let mut apps: Vec<RunningApp> = self
            .projects
            .get(project_id)
            .map(|apps| apps.values().cloned().collect())
            .unwrap_or_default();
        apps.sort_by(|a, b| a.app_name.cmp(&b.app_name));
        apps
    }

    /// Snapshot of every entry of every project
    pub fn all(&self) -> Vec<RunningApp> {
        self.projects
            .iter()
            .flat_map(|entry| entry.value().values().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub fn is_project_running(&self, project_id: &str) -> bool {
        self.projects
            .get(project_id)
            .map(|apps| !apps.is_empty())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.projects.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_claim_is_exclusive_per_key() {
        let registry = Registry::new();
        let web = AppKey::new("42", "web");

        let generation = registry.claim(&web).unwrap();
        assert!(matches!(
            registry.claim(&web),
            Err(SupervisorError::AlreadyRunning { .. })
        ));

        // Other apps of the same project and other projects are independent
        registry.claim(&AppKey::new("42", "api")).unwrap();
        registry.claim(&AppKey::new("43", "web")).unwrap();
        assert_eq!(registry.len(), 3);

        assert!(registry.release(&web, generation).is_some());
        registry.claim(&web).unwrap();
    }

    #[test]
    fn test_release_ignores_other_generations() {
        let registry = Registry::new();
        let key = AppKey::new("42", "default");

        let old = registry.claim(&key).unwrap();
        assert!(registry.release(&key, old).is_some());
        let new = registry.claim(&key).unwrap();
        assert_ne!(old, new);

        // A late exit of the old incarnation
        assert!(registry.release(&key, old).is_none());
        assert_eq!(registry.get(&key).map(|a| a.generation), Some(new));
    }

    #[test]
    fn test_attach_pid() {
        let registry = Registry::new();
        let key = AppKey::new("1", "web");
        let generation = registry.claim(&key).unwrap();

        assert_eq!(registry.get(&key).unwrap().pid, None);
        assert!(registry.attach_pid(&key, generation, 4242));
        assert_eq!(registry.get(&key).unwrap().pid, Some(4242));
        assert!(!registry.attach_pid(&key, generation + 1, 1));
    }

    #[test]
    fn test_empty_projects_are_pruned() {
        let registry = Registry::new();
        let key = AppKey::new("9", "web");
        assert!(!registry.is_project_running("9"));
        assert!(registry.snapshot("9").is_empty());

        let generation = registry.claim(&key).unwrap();
        assert!(registry.is_project_running("9"));

        registry.release(&key, generation);
        assert!(!registry.is_project_running("9"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let registry = Registry::new();
        for app in ["web", "api", "worker"] {
            registry.claim(&AppKey::new("5", app)).unwrap();
        }
        let names: Vec<String> = registry.snapshot("5").into_iter().map(|a| a.app_name).collect();
        assert_eq!(names, vec!["api", "web", "worker"]);
        assert_eq!(registry.all().len(), 3);
    }

    #[test]
    fn test_concurrent_claims_admit_one() {
        let registry = Arc::new(Registry::new());
        let key = AppKey::new("42", "web");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                let key = key.clone();
                std::thread::spawn(move || registry.claim(&key).is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
