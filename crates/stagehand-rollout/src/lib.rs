//! stagehand-rollout — blue-green update of the orchestrator's own
//! instances.
//!
//! Two instances run side by side. An external proxy sends traffic to the
//! primary and fails over to the standby when the primary's ping reports
//! 503 (drain mode) or stops answering. Updating one instance at a time,
//! drained first, keeps one of them serving throughout.
//!
//! # Per-instance sequence
//!
//! ```text
//! PreCheck → Draining → Settling → Stopping → Retargeting → Starting
//!     → [Stabilizing, primary only] → PostCheck → Undraining → Verifying
//!     → Completed
//! ```
//!
//! A failed step leaves the instance where it stopped and aborts the
//! rollout; instances after it are not touched and nothing is rolled back.

pub mod binary;
pub mod controller;
pub mod error;
pub mod ops;

pub use binary::{exec_start_line, newest_binary, retarget_exec_start};
pub use controller::{BlueGreenRollout, InstanceReport, RolloutPhase, RolloutReport, RolloutTimings};
pub use error::{RolloutError, RolloutResult};
pub use ops::{InstanceOps, SystemdInstances};
