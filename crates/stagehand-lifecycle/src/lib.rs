//! stagehand-lifecycle — drives releases through stages, tests, and
//! deployments.
//!
//! # Architecture
//!
//! ```text
//!   API handlers
//!        │
//!        ▼
//!   StageOrchestrator ──────────► DeploymentOrchestrator
//!   (prepare, env, tests)         (promote, provision, start/stop, main)
//!        │   │                         │   │   │
//!        │   └── TaskSlots ◄───────────┘   │   └──► RoutingTable
//!        ▼                                 ▼
//!   ScriptRunner / SourceControl      Supervisor
//!        │                                 │
//!        └──────────► StateStore ◄─────────┘
//! ```
//!
//! Long-running work (test scripts, build + supervisor install) runs on
//! background tasks tracked in [`TaskSlots`]; the triggering call returns the
//! record right away and the caller follows progress through the job's log
//! file. The external tools sit behind the [`ScriptRunner`],
//! [`SourceControl`], and [`Supervisor`] traits. Every transition is
//! reported to an [`EventEmitter`], which persists it to the event log.

pub mod deployments;
pub mod error;
pub mod events;
mod fsutil;
pub mod joblog;
pub mod releases;
pub mod runner;
pub mod scm;
pub mod stages;
pub mod supervisor;
pub mod tasks;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::sync::Arc;

use stagehand_core::StagehandConfig;

pub use deployments::DeploymentOrchestrator;
pub use error::{ErrorKind, LifecycleError, LifecycleResult};
pub use events::{EventEmitter, EventSettings};
pub use joblog::JobLog;
pub use releases::ReleaseSync;
pub use runner::{Invocation, ProcessRunner, ScriptOutcome, ScriptRunner};
pub use scm::{GitCli, RemoteTag, SourceControl};
pub use stages::StageOrchestrator;
pub use supervisor::{Supervisor, Systemd, UnitSpec};
pub use tasks::TaskSlots;

/// The external tools the orchestrators shell out to.
#[derive(Clone)]
pub struct Collaborators {
    pub runner: Arc<dyn ScriptRunner>,
    pub scm: Arc<dyn SourceControl>,
    pub supervisor: Arc<dyn Supervisor>,
}

impl Collaborators {
    /// Subprocess-backed collaborators configured from `config`.
    pub fn system(config: &StagehandConfig) -> Self {
        Self {
            runner: Arc::new(ProcessRunner),
            scm: Arc::new(GitCli::new(config.repository.url.clone())),
            supervisor: Arc::new(Systemd::new(config.supervisor.clone())),
        }
    }
}
