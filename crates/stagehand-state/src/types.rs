//! Record types persisted by the lifecycle store.
//!
//! Timestamps are Unix epoch seconds. Status enums serialize as lowercase
//! snake_case strings so they read naturally in API responses.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ── Release ────────────────────────────────────────────────────────

/// An immutable tagged snapshot of the managed application's source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Release {
    /// Tag name, e.g. `v1.4.0`.
    pub id: String,
    /// Commit the tag points at.
    pub sha: String,
    pub created_at: u64,
}

// ── Stage ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Checked out, configuration not yet written.
    Pre,
    /// Configuration written, no passing test for it yet.
    Active,
    /// Latest test passed.
    Ready,
    /// A deployment has been created from this stage.
    Promoted,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pre => "pre",
            Self::Active => "active",
            Self::Ready => "ready",
            Self::Promoted => "promoted",
        };
        f.write_str(s)
    }
}

/// Outcome of the most recent test run against a stage's configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestSummary {
    pub test_id: String,
    pub status: TestStatus,
}

/// A release checked out and configured for one environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stage {
    pub id: String,
    pub release_id: String,
    pub env_tag: String,
    pub status: StageStatus,
    /// Last allocated test sequence number; the next test gets `+1`.
    pub test_sequence: u32,
    /// Cleared whenever the configuration changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_test: Option<TestSummary>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Stage {
    pub fn key(release_id: &str, env_tag: &str) -> String {
        format!("{release_id}-{env_tag}")
    }

    pub fn has_passed_test(&self) -> bool {
        matches!(&self.last_test, Some(t) if t.status == TestStatus::Passed)
    }
}

// ── Test ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Running,
    Passed,
    Failed,
    Canceled,
    Error,
}

impl TestStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// One execution of the test script against a stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Test {
    pub id: String,
    pub stage_id: String,
    pub sequence: u32,
    pub status: TestStatus,
    /// Opaque token a log viewer presents to attach to this run.
    pub ws_token: String,
    pub log_path: String,
    pub started_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Test {
    pub fn key(stage_id: &str, sequence: u32) -> String {
        format!("{stage_id}-test-{sequence}")
    }
}

// ── Deployment ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Staged,
    Provisioning,
    Ready,
    BuildFailed,
    ProvisionFailed,
    Stopped,
}

impl DeploymentStatus {
    /// States a provisioning log stream ends on.
    pub fn is_settled(self) -> bool {
        !matches!(self, Self::Staged | Self::Provisioning)
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Staged => "staged",
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::BuildFailed => "build_failed",
            Self::ProvisionFailed => "provision_failed",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// A provisioned backend process derived from a promoted stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Deployment {
    /// Same as the stage id.
    pub id: String,
    pub stage_id: String,
    /// Release tag being deployed.
    pub version: String,
    pub env_tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub status: DeploymentStatus,
    pub log_path: String,
    pub created_at: u64,
    /// Set on exactly one deployment: the main deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promoted_at: Option<u64>,
}

impl Deployment {
    pub fn is_main(&self) -> bool {
        self.promoted_at.is_some()
    }

    pub fn is_ready(&self) -> bool {
        self.status == DeploymentStatus::Ready
    }
}

// ── LifecycleEvent ─────────────────────────────────────────────────

/// Audit record of one lifecycle transition, e.g. `deployment.promoted`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LifecycleEvent {
    /// Assigned by the store on append; zero until then.
    #[serde(default)]
    pub seq: u64,
    pub at: u64,
    pub action: String,
    pub actor: String,
    pub target_type: String,
    pub target_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub props: BTreeMap<String, String>,
}

impl LifecycleEvent {
    pub const ACTOR_SYSTEM: &'static str = "system";

    pub fn new(action: &str, target_type: &str, target_id: &str, at: u64) -> Self {
        Self {
            seq: 0,
            at,
            action: action.to_string(),
            actor: Self::ACTOR_SYSTEM.to_string(),
            target_type: target_type.to_string(),
            target_id: target_id.to_string(),
            props: BTreeMap::new(),
        }
    }

    pub fn prop(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.props.insert(key.to_string(), value.to_string());
        self
    }
}
