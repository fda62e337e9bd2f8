use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

use super::{Project, ProjectStatus, ProjectStore};
use crate::error::{Result, SupervisorError};

/// Project store backed by a pretty-printed JSON array file
pub struct JsonProjectStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles on the file
    write_lock: Mutex<()>,
}

impl JsonProjectStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<Project>> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        if data.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&data).map_err(|e| {
            SupervisorError::Store(format!("Invalid project file {}: {}", self.path.display(), e))
        })
    }

    async fn write_all(&self, projects: &[Project]) -> Result<()> {
        let content = serde_json::to_string_pretty(projects)?;
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }

    /// Reset every project marked `running` to `stopped`.
    ///
    /// A fresh daemon has an empty registry, so persisted `running` flags are stale.
    pub async fn reset_statuses(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let mut projects = self.read_all().await?;

        let mut reset = 0;
        for project in projects.iter_mut().filter(|p| p.status == ProjectStatus::Running) {
            project.status = ProjectStatus::Stopped;
            reset += 1;
        }

        if reset > 0 {
            self.write_all(&projects).await?;
        }
        Ok(reset)
    }
}

#[async_trait]
impl ProjectStore for JsonProjectStore {
    async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        Ok(self.read_all().await?.into_iter().find(|p| p.id == id))
    }

    async fn set_status(&self, id: &str, status: ProjectStatus) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut projects = self.read_all().await?;

        let Some(project) = projects.iter_mut().find(|p| p.id == id) else {
            debug!("Ignoring status update for unknown project {}", id);
            return Ok(());
        };

        if project.status == status {
            return Ok(());
        }
        project.status = status;
        self.write_all(&projects).await
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        self.read_all().await
    }
}

/// In-memory project store
#[derive(Default)]
pub struct MemoryProjectStore {
    projects: RwLock<BTreeMap<String, Project>>,
}

impl MemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_projects(projects: impl IntoIterator<Item = Project>) -> Self {
        let store = Self::new();
        for project in projects {
            store.insert(project);
        }
        store
    }

    pub fn insert(&self, project: Project) {
        self.projects.write().insert(project.id.clone(), project);
    }

    pub fn status(&self, id: &str) -> Option<ProjectStatus> {
        self.projects.read().get(id).map(|p| p.status)
    }
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        Ok(self.projects.read().get(id).cloned())
    }

    async fn set_status(&self, id: &str, status: ProjectStatus) -> Result<()> {
        if let Some(project) = self.projects.write().get_mut(id) {
            project.status = status;
        }
        Ok(())
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        Ok(self.projects.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_projects(dir: &Path, value: serde_json::Value) -> PathBuf {
        let path = dir.join("projects.json");
        std::fs::write(&path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
        path
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonProjectStore::new(dir.path().join("projects.json"));

        assert!(store.list_projects().await.unwrap().is_empty());
        assert!(store.get_project("1").await.unwrap().is_none());
        store.set_status("1", ProjectStatus::Running).await.unwrap();
    }

    #[tokio::test]
    async fn test_set_status_preserves_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_projects(
            dir.path(),
            json!([
                {"id": "42", "name": "Dummy", "path": "/srv/dummy", "status": "stopped", "repo": "git@x"},
                {"id": "43", "name": "Other", "path": "/srv/other"}
            ]),
        );
        let store = JsonProjectStore::new(&path);

        store.set_status("42", ProjectStatus::Running).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw[0]["status"], "running");
        assert_eq!(raw[0]["repo"], "git@x");
        assert_eq!(raw[0]["path"], "/srv/dummy");

        let other = store.get_project("43").await.unwrap().unwrap();
        assert_eq!(other.status, ProjectStatus::Stopped);
        assert_eq!(other.root_path, PathBuf::from("/srv/other"));
    }

    #[tokio::test]
    async fn test_reset_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_projects(
            dir.path(),
            json!([
                {"id": "1", "path": "/a", "status": "running"},
                {"id": "2", "path": "/b", "status": "stopped"},
                {"id": "3", "path": "/c", "status": "running"}
            ]),
        );
        let store = JsonProjectStore::new(&path);

        assert_eq!(store.reset_statuses().await.unwrap(), 2);
        let projects = store.list_projects().await.unwrap();
        assert!(projects.iter().all(|p| p.status == ProjectStatus::Stopped));
    }

    #[tokio::test]
    async fn test_invalid_file_is_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("projects.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = JsonProjectStore::new(&path);

        let err = store.get_project("1").await.unwrap_err();
        assert_eq!(err.kind(), "StoreError");
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryProjectStore::with_projects([Project::new("7", "/tmp/seven")]);

        store.set_status("7", ProjectStatus::Running).await.unwrap();
        assert_eq!(store.status("7"), Some(ProjectStatus::Running));
        assert_eq!(store.list_projects().await.unwrap().len(), 1);
        assert!(store.get_project("8").await.unwrap().is_none());
    }
}
