//! stagehand-core — configuration, on-disk layout, and small helpers shared
//! by every Stagehand crate.
//!
//! Nothing here talks to the network or spawns processes; it only knows
//! where things live and how the daemon is configured.

pub mod config;
pub mod layout;
pub mod version;

pub use config::{
    ConfigError, EventsConfig, InstanceConfig, PortRange, RolloutConfig, ServerConfig, StagehandConfig,
    SupervisorConfig,
};
pub use layout::Layout;
pub use version::{binary_name, compare_versions, newest_version};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
