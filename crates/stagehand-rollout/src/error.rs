use std::path::PathBuf;

use thiserror::Error;

use stagehand_health::HealthError;

use crate::controller::RolloutPhase;

pub type RolloutResult<T> = Result<T, RolloutError>;

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("instance {instance} is unhealthy: {source}")]
    Unhealthy {
        instance: String,
        source: HealthError,
    },

    #[error("drain request to {instance} failed: {source}")]
    Drain {
        instance: String,
        source: HealthError,
    },

    #[error("{action} of {unit} failed: {detail}")]
    Supervisor {
        unit: String,
        action: &'static str,
        detail: String,
    },

    #[error("unit {unit} is {state} after restart")]
    NotActive { unit: String, state: String },

    #[error("unit file {} has no ExecStart= line", path.display())]
    NoExecStart { path: PathBuf },

    #[error("no built binaries in {}", dir.display())]
    NoBinary { dir: PathBuf },

    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("rollout of {instance} stopped at {phase}: {source}")]
    Step {
        instance: String,
        phase: RolloutPhase,
        source: Box<RolloutError>,
    },
}

impl RolloutError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}
