//! Error types for lifecycle orchestration.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use stagehand_state::StateError;

pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Coarse classification surfaced to API callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidRequest,
    UpstreamFailure,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::InvalidRequest => "invalid_request",
            Self::UpstreamFailure => "upstream_failure",
            Self::Internal => "internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("stage {0} not found")]
    StageNotFound(String),

    #[error("release {0} not found")]
    ReleaseNotFound(String),

    #[error("test {0} not found")]
    TestNotFound(String),

    #[error("deployment {0} not found")]
    DeploymentNotFound(String),

    #[error("stage {0} already exists")]
    AlreadyExists(String),

    #[error("stage {0} has no environment configured")]
    MissingEnv(String),

    #[error("stage {0} has no passing test")]
    TestNotPassed(String),

    #[error("a deployment already exists for stage {0}")]
    DeploymentExists(String),

    #[error("deployment {0} is the main deployment")]
    CannotDeleteMain(String),

    #[error("deployment {0} is not ready")]
    NotReady(String),

    #[error("deployment {0} has never been provisioned")]
    NotProvisioned(String),

    #[error("deployment {0} is already provisioning")]
    ProvisioningInProgress(String),

    #[error("test {0} is not running")]
    TestNotRunning(String),

    #[error("no ports available in range {start}-{end}")]
    NoPortsAvailable { start: u16, end: u16 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{tool} failed: {detail}")]
    Upstream { tool: &'static str, detail: String },

    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    State(#[from] StateError),
}

impl LifecycleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::StageNotFound(_)
            | Self::ReleaseNotFound(_)
            | Self::TestNotFound(_)
            | Self::DeploymentNotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_)
            | Self::MissingEnv(_)
            | Self::TestNotPassed(_)
            | Self::DeploymentExists(_)
            | Self::CannotDeleteMain(_)
            | Self::NotReady(_)
            | Self::NotProvisioned(_)
            | Self::ProvisioningInProgress(_)
            | Self::TestNotRunning(_)
            | Self::NoPortsAvailable { .. } => ErrorKind::Conflict,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Upstream { .. } => ErrorKind::UpstreamFailure,
            Self::Io { .. } | Self::State(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }

    pub(crate) fn upstream(tool: &'static str, detail: impl ToString) -> Self {
        Self::Upstream {
            tool,
            detail: detail.to_string(),
        }
    }
}
