//! Blue-green rollout controller.
//!
//! Instances are updated strictly one after another, primary first. Each
//! instance walks the [`RolloutPhase`] sequence; the first failing step ends
//! the whole rollout with a [`RolloutError::Step`] naming the instance and
//! phase.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info};

use stagehand_core::{InstanceConfig, RolloutConfig};

use crate::error::{RolloutError, RolloutResult};
use crate::ops::InstanceOps;

/// Where an instance is in its update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutPhase {
    Pending,
    /// Refuse to drain an instance that is already down.
    PreCheck,
    Draining,
    /// In-flight requests move to the other instance.
    Settling,
    Stopping,
    Retargeting,
    Starting,
    /// Extra wait after restarting the primary.
    Stabilizing,
    PostCheck,
    Undraining,
    Verifying,
    /// Both instances are checked once more after every update.
    FinalCheck,
    Completed,
}

impl fmt::Display for RolloutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::PreCheck => "pre_check",
            Self::Draining => "draining",
            Self::Settling => "settling",
            Self::Stopping => "stopping",
            Self::Retargeting => "retargeting",
            Self::Starting => "starting",
            Self::Stabilizing => "stabilizing",
            Self::PostCheck => "post_check",
            Self::Undraining => "undraining",
            Self::Verifying => "verifying",
            Self::FinalCheck => "final_check",
            Self::Completed => "completed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RolloutTimings {
    pub settle: Duration,
    pub stabilize: Duration,
    pub verify_delay: Duration,
}

impl From<&RolloutConfig> for RolloutTimings {
    fn from(config: &RolloutConfig) -> Self {
        Self {
            settle: Duration::from_secs(config.settle_secs),
            stabilize: Duration::from_secs(config.stabilize_secs),
            verify_delay: Duration::from_secs(config.verify_delay_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceReport {
    pub name: String,
    pub phase: RolloutPhase,
}

#[derive(Debug, Clone, Serialize)]
pub struct RolloutReport {
    pub binary: PathBuf,
    pub instances: Vec<InstanceReport>,
}

type StepError = (RolloutPhase, RolloutError);

pub struct BlueGreenRollout {
    ops: Arc<dyn InstanceOps>,
    instances: Vec<InstanceConfig>,
    timings: RolloutTimings,
}

impl BlueGreenRollout {
    /// Instances are reordered so the primary goes first.
    pub fn new(
        ops: Arc<dyn InstanceOps>,
        mut instances: Vec<InstanceConfig>,
        timings: RolloutTimings,
    ) -> Self {
        instances.sort_by_key(|i| !i.primary);
        Self {
            ops,
            instances,
            timings,
        }
    }

    /// Update every instance to `binary`, then confirm all are healthy.
    pub async fn run(&self, binary: &Path) -> RolloutResult<RolloutReport> {
        info!(binary = %binary.display(), instances = self.instances.len(), "rollout starting");
        let mut report = RolloutReport {
            binary: binary.to_path_buf(),
            instances: Vec::new(),
        };

        for instance in &self.instances {
            self.update_instance(instance, binary)
                .await
                .map_err(|(phase, source)| abort(instance, phase, source))?;
            report.instances.push(InstanceReport {
                name: instance.name.clone(),
                phase: RolloutPhase::Completed,
            });
            info!(instance = %instance.name, "instance updated");
        }

        for instance in &self.instances {
            self.step(instance, RolloutPhase::FinalCheck, self.ops.check_health(instance))
                .await
                .map_err(|(phase, source)| abort(instance, phase, source))?;
        }
        info!(binary = %binary.display(), "rollout completed");
        Ok(report)
    }

    async fn update_instance(&self, inst: &InstanceConfig, binary: &Path) -> Result<(), StepError> {
        use RolloutPhase::*;
        let ops = &self.ops;

        self.step(inst, PreCheck, ops.check_health(inst)).await?;
        self.step(inst, Draining, ops.set_drain(inst, true)).await?;
        self.step(inst, Settling, pause(self.timings.settle)).await?;
        self.step(inst, Stopping, ops.stop(inst)).await?;
        self.step(inst, Retargeting, ops.retarget(inst, binary)).await?;
        self.step(inst, Starting, ops.start(inst)).await?;
        if inst.primary {
            self.step(inst, Stabilizing, pause(self.timings.stabilize)).await?;
        }
        self.step(inst, PostCheck, ops.check_health(inst)).await?;
        self.step(inst, Undraining, ops.set_drain(inst, false)).await?;
        self.step(inst, Verifying, async {
            tokio::time::sleep(self.timings.verify_delay).await;
            let state = ops.active_state(inst).await?;
            if state != "active" {
                return Err(RolloutError::NotActive {
                    unit: inst.unit.clone(),
                    state,
                });
            }
            Ok(())
        })
        .await
    }

    async fn step<F>(&self, inst: &InstanceConfig, phase: RolloutPhase, action: F) -> Result<(), StepError>
    where
        F: Future<Output = RolloutResult<()>>,
    {
        info!(instance = %inst.name, %phase, "rollout step");
        action.await.map_err(|e| (phase, e))
    }
}

async fn pause(duration: Duration) -> RolloutResult<()> {
    tokio::time::sleep(duration).await;
    Ok(())
}

fn abort(instance: &InstanceConfig, phase: RolloutPhase, source: RolloutError) -> RolloutError {
    error!(instance = %instance.name, %phase, error = %source, "rollout aborted");
    RolloutError::Step {
        instance: instance.name.clone(),
        phase,
        source: Box::new(source),
    }
}
