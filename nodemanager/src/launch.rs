//! Launch resolution
//!
//! Turns a project and an app name into the command line to run. Projects may
//! carry a `nodemanager.json` file at their root, in one of two shapes:
//!
//! ```json
//! { "command": "node", "args": ["server.js"] }
//! ```
//!
//! or, for projects with several apps:
//!
//! ```json
//! { "apps": [
//!     { "name": "api", "command": "npm", "args": ["run", "api"], "path": "server" },
//!     { "name": "web", "command": "npm", "args": ["run", "dev"], "path": "client" }
//! ] }
//! ```
//!
//! Resolution never fails: anything missing or unreadable falls back to `npm start`
//! in the project root.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::project::Project;

/// Name of the per-project launch configuration file
pub const LAUNCH_CONFIG_FILE: &str = "nodemanager.json";

/// App name used by callers that predate multi-app projects
pub const DEFAULT_APP: &str = "default";

const DEFAULT_COMMAND: &str = "npm";
const DEFAULT_ARGS: &[&str] = &["start"];

/// Fully resolved launch of one app
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    pub working_directory: PathBuf,
}

impl LaunchSpec {
    /// `npm start` in the project root
    pub fn default_for(root: &Path) -> Self {
        Self {
            command: DEFAULT_COMMAND.to_string(),
            args: DEFAULT_ARGS.iter().map(|s| s.to_string()).collect(),
            working_directory: root.to_path_buf(),
        }
    }

    /// Command line as handed to the shell
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }

    /// Resolve against an optional parsed configuration
    pub fn resolve(root: &Path, config: Option<&LaunchConfig>, app_name: &str) -> Self {
        let mut spec = Self::default_for(root);
        let Some(config) = config else {
            return spec;
        };

        match &config.apps {
            Some(apps) => {
                let entry = apps
                    .iter()
                    .find(|a| a.name.as_deref() == Some(app_name))
                    .or_else(|| {
                        // Single-app callers keep working after a project moves to an app list
                        if app_name == DEFAULT_APP { apps.first() } else { None }
                    });

                if let Some(entry) = entry {
                    spec.apply(entry.command.as_deref(), entry.args.as_ref());
                    if let Some(path) = entry.path.as_deref() {
                        spec.working_directory = join_within(root, Path::new(path));
                    }
                }
            }
            None => spec.apply(config.command.as_deref(), config.args.as_ref()),
        }

        spec
    }

    fn apply(&mut self, command: Option<&str>, args: Option<&Vec<String>>) {
        if let Some(command) = command.filter(|c| !c.is_empty()) {
            self.command = command.to_string();
        }
        if let Some(args) = args {
            self.args = args.clone();
        }
    }
}

/// Parsed `nodemanager.json`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LaunchConfig {
    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub args: Option<Vec<String>>,

    /// Named apps. A non-array value is treated as absent (legacy schema).
    #[serde(default, deserialize_with = "lenient_apps")]
    pub apps: Option<Vec<AppLaunchConfig>>,
}

/// One entry of the `apps` list
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppLaunchConfig {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub args: Option<Vec<String>>,

    /// Working directory relative to the project root
    #[serde(default)]
    pub path: Option<String>,
}

fn lenient_apps<'de, D>(deserializer: D) -> Result<Option<Vec<AppLaunchConfig>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Array(_) => serde_json::from_value(value)
            .map(Some)
            .map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}

/// Join `relative` onto `root` without ever leaving `root`.
///
/// Root and prefix components are dropped, `..` stops at `root`.
pub fn join_within(root: &Path, relative: &Path) -> PathBuf {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::ParentDir => {
                parts.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }

    let mut joined = root.to_path_buf();
    joined.extend(parts);
    joined
}

/// Where launch configurations come from
#[async_trait]
pub trait LaunchConfigSource: Send + Sync {
    /// Read the launch configuration of a project, `None` when absent or unusable
    async fn read_launch_config(&self, project: &Project) -> Option<LaunchConfig>;
}

/// Reads `nodemanager.json` from the project root
#[derive(Debug, Default, Clone)]
pub struct FsLaunchConfigSource;

#[async_trait]
impl LaunchConfigSource for FsLaunchConfigSource {
    async fn read_launch_config(&self, project: &Project) -> Option<LaunchConfig> {
        let path = project.root_path.join(LAUNCH_CONFIG_FILE);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => {
                debug!("No launch config at {}: {}", path.display(), e);
                return None;
            }
        };

        match serde_json::from_str(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("Failed to read config {}, using default: {}", path.display(), e);
                None
            }
        }
    }
}

/// Resolves launch specs, re-reading configuration on every call
#[derive(Clone)]
pub struct LaunchResolver {
    source: Arc<dyn LaunchConfigSource>,
}

impl Default for LaunchResolver {
    fn default() -> Self {
        Self::new(Arc::new(FsLaunchConfigSource))
    }
}

impl LaunchResolver {
    pub fn new(source: Arc<dyn LaunchConfigSource>) -> Self {
        Self { source }
    }

    pub async fn resolve(&self, project: &Project, app_name: &str) -> LaunchSpec {
        let config = self.source.read_launch_config(project).await;
        LaunchSpec::resolve(&project.root_path, config.as_ref(), app_name)
    }
}
