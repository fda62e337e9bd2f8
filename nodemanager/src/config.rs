//! Configuration management for the nodemanager daemon
//!
//! Settings live in a TOML file (`nodemanager.toml` in the working directory by
//! default). Every section has defaults, so a partial file is valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name
pub const CONFIG_FILE_NAME: &str = "nodemanager.toml";

/// Daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeManagerConfig {
    /// HTTP/WebSocket server settings
    pub server: ServerConfig,

    /// Process supervisor settings
    pub supervisor: SupervisorConfig,

    /// Project store settings
    pub store: StoreConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server host address
    pub host: String,

    /// Server port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

/// Process supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Delay between the SIGTERM of a restart and the fresh start
    pub restart_grace_ms: u64,

    /// How long to keep draining stdout/stderr after the child exited
    pub output_drain_ms: u64,

    /// Per-channel buffer of the event broadcaster
    pub channel_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_grace_ms: 1000,
            output_drain_ms: 2000,
            channel_capacity: 1024,
        }
    }
}

impl SupervisorConfig {
    pub fn restart_grace(&self) -> Duration {
        Duration::from_millis(self.restart_grace_ms)
    }

    pub fn output_drain(&self) -> Duration {
        Duration::from_millis(self.output_drain_ms)
    }
}

/// Project store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON file holding the project records
    pub projects_file: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            projects_file: PathBuf::from("projects.json"),
        }
    }
}

impl NodeManagerConfig {
    /// Load configuration
    ///
    /// An explicit path must exist and parse. Without one, `nodemanager.toml` in the
    /// working directory is used when present, otherwise defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from_path(path);
        }

        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Self::load_from_path(&local);
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Save configuration to a specific path
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> Result<String> {
        match key {
            "server.host" => Ok(self.server.host.clone()),
            "server.port" => Ok(self.server.port.to_string()),
            "supervisor.restart_grace_ms" => Ok(self.supervisor.restart_grace_ms.to_string()),
            "supervisor.output_drain_ms" => Ok(self.supervisor.output_drain_ms.to_string()),
            "supervisor.channel_capacity" => Ok(self.supervisor.channel_capacity.to_string()),
            "store.projects_file" => Ok(self.store.projects_file.display().to_string()),
            _ => Err(anyhow::anyhow!("Unknown configuration key: {}", key)),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "server.host" => {
                self.server.host = value.to_string();
            }
            "server.port" => {
                self.server.port = value.parse().context("Invalid port")?;
            }
            "supervisor.restart_grace_ms" => {
                self.supervisor.restart_grace_ms = value.parse().context("Invalid duration in ms")?;
            }
            "supervisor.output_drain_ms" => {
                self.supervisor.output_drain_ms = value.parse().context("Invalid duration in ms")?;
            }
            "supervisor.channel_capacity" => {
                self.supervisor.channel_capacity = value.parse().context("Invalid capacity")?;
            }
            "store.projects_file" => {
                self.store.projects_file = PathBuf::from(value);
            }
            _ => {
                return Err(anyhow::anyhow!("Unknown configuration key: {}", key));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeManagerConfig::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.supervisor.restart_grace(), Duration::from_secs(1));
        assert_eq!(config.store.projects_file, PathBuf::from("projects.json"));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: NodeManagerConfig = toml::from_str(
            r#"
            [supervisor]
            restart_grace_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.supervisor.restart_grace_ms, 250);
        assert_eq!(config.supervisor.output_drain_ms, 2000);
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_config_get_set() {
        let mut config = NodeManagerConfig::default();

        config.set("server.port", "4000").unwrap();
        assert_eq!(config.get("server.port").unwrap(), "4000");

        config.set("store.projects_file", "/tmp/p.json").unwrap();
        assert_eq!(config.get("store.projects_file").unwrap(), "/tmp/p.json");

        assert!(config.set("server.port", "not-a-port").is_err());
        assert!(config.get("unknown.key").is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join(CONFIG_FILE_NAME);

        let mut config = NodeManagerConfig::default();
        config.server.port = 3100;
        config.save_to_path(&path).unwrap();

        let loaded = NodeManagerConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.server.port, 3100);
    }

    #[test]
    fn test_explicit_missing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(NodeManagerConfig::load(Some(&dir.path().join("nope.toml"))).is_err());
    }
}
