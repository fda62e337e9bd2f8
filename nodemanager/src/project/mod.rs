//! Project records consumed by the supervisor
//!
//! Projects are registered and edited elsewhere. The supervisor only reads them
//! and writes back the derived `status`.

mod store;

pub use store::{JsonProjectStore, MemoryProjectStore};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::Result;

/// Aggregate project status, derived from the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    #[default]
    Stopped,
    Running,
}

/// A registered project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Filesystem root of the project
    #[serde(rename = "path")]
    pub root_path: PathBuf,

    #[serde(default)]
    pub status: ProjectStatus,

    /// Fields owned by other components, kept verbatim on write-back
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Project {
    pub fn new(id: impl Into<String>, root_path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            name: None,
            root_path: root_path.into(),
            status: ProjectStatus::Stopped,
            extra: serde_json::Map::new(),
        }
    }
}

/// Source of project records
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Look up a project by id
    async fn get_project(&self, id: &str) -> Result<Option<Project>>;

    /// Persist the aggregate status of a project. Unknown ids are ignored.
    async fn set_status(&self, id: &str, status: ProjectStatus) -> Result<()>;

    /// All known projects
    async fn list_projects(&self) -> Result<Vec<Project>>;
}
