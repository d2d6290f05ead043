//! stagehand.toml configuration parser.
//!
//! Every section is optional; a missing file section falls back to the
//! defaults a single-host install expects (blue on 8080, green on 8081,
//! backend ports 20000-29999).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StagehandConfig {
    pub server: ServerConfig,
    pub layout: LayoutConfig,
    pub ports: PortRange,
    pub repository: RepositoryConfig,
    pub supervisor: SupervisorConfig,
    pub routing: RoutingConfig,
    pub events: EventsConfig,
    pub rollout: RolloutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Instance name, e.g. "blue" or "green".
    pub instance: String,
    /// First path segment reserved for the management API.
    pub api_prefix: String,
    /// Reported by the version endpoint; defaults to the crate version.
    pub version: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            instance: "blue".to_string(),
            api_prefix: "stagehand".to_string(),
            version: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub root: PathBuf,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/stagehand"),
        }
    }
}

/// Inclusive range of backend ports handed out to deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 20000,
            end: 29999,
        }
    }
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Remote the managed application is cloned from.
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub unit_dir: PathBuf,
    pub unit_prefix: String,
    pub use_sudo: bool,
    pub systemctl: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            unit_dir: PathBuf::from("/etc/systemd/system"),
            unit_prefix: "stagehand-backend".to_string(),
            use_sudo: true,
            systemctl: "systemctl".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Seconds between full routing rebuilds. Zero disables the loop.
    pub reconcile_interval_secs: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 30,
        }
    }
}

/// Lifecycle event batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Events queued before emitters write through directly.
    pub buffer: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            buffer: 1000,
            batch_size: 50,
            flush_interval_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    pub settle_secs: u64,
    pub stabilize_secs: u64,
    pub verify_delay_secs: u64,
    pub health_attempts: u32,
    pub health_interval_ms: u64,
    pub health_timeout_ms: u64,
    /// Where orchestrator binaries are built, one file per version.
    pub builds_dir: PathBuf,
    /// Config file passed to the rewritten `ExecStart=` line.
    pub config_path: PathBuf,
    pub unit_dir: PathBuf,
    pub instances: Vec<InstanceConfig>,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            settle_secs: 5,
            stabilize_secs: 5,
            verify_delay_secs: 3,
            health_attempts: 30,
            health_interval_ms: 1000,
            health_timeout_ms: 2000,
            builds_dir: PathBuf::from("/var/stagehand/self-builds"),
            config_path: PathBuf::from("/etc/stagehand/stagehand.toml"),
            unit_dir: PathBuf::from("/etc/systemd/system"),
            instances: vec![
                InstanceConfig::new("blue", 8080, true),
                InstanceConfig::new("green", 8081, false),
            ],
        }
    }
}

/// One of the two permanently running orchestrator instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub unit: String,
    /// The primary receives all traffic and gets an extra stabilization wait.
    #[serde(default)]
    pub primary: bool,
}

impl InstanceConfig {
    pub fn new(name: &str, port: u16, primary: bool) -> Self {
        Self {
            name: name.to_string(),
            address: "127.0.0.1".to_string(),
            port,
            unit: format!("stagehand-{name}.service"),
            primary,
        }
    }

    pub fn host(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl StagehandConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: StagehandConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.start > self.ports.end {
            return Err(ConfigError::Invalid(format!(
                "port range {}-{} is empty",
                self.ports.start, self.ports.end
            )));
        }
        if self.server.api_prefix.is_empty() || self.server.api_prefix.contains('/') {
            return Err(ConfigError::Invalid(
                "api_prefix must be a single path segment".to_string(),
            ));
        }
        if self.events.buffer == 0 || self.events.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "events.buffer and events.batch_size must be at least 1".to_string(),
            ));
        }
        if self.rollout.health_attempts == 0 {
            return Err(ConfigError::Invalid(
                "rollout.health_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn layout(&self) -> crate::Layout {
        crate::Layout::new(&self.layout.root)
    }

    pub fn version(&self) -> String {
        self.server
            .version
            .clone()
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string())
    }
}
