//! Operations the rollout performs on one instance.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use stagehand_core::{InstanceConfig, RolloutConfig, SupervisorConfig};
use stagehand_health::{HealthPolicy, check_host, set_drain};

use crate::binary::{exec_start_line, retarget_exec_start};
use crate::error::{RolloutError, RolloutResult};

/// `systemctl stop` exit code for a unit that is not loaded.
const EXIT_UNIT_NOT_LOADED: i32 = 5;

/// Abstraction over an orchestrator instance for testability.
///
/// Real implementation: [`SystemdInstances`] (HTTP meta endpoints plus
/// `systemctl`).
/// Test double: the recording fake in `controller` tests.
#[async_trait]
pub trait InstanceOps: Send + Sync {
    /// Succeeds once the instance's ping answers 2xx, within a retry budget.
    async fn check_health(&self, instance: &InstanceConfig) -> RolloutResult<()>;
    async fn set_drain(&self, instance: &InstanceConfig, enabled: bool) -> RolloutResult<()>;
    async fn stop(&self, instance: &InstanceConfig) -> RolloutResult<()>;
    /// Point the instance's unit at `binary` and reload the supervisor.
    async fn retarget(&self, instance: &InstanceConfig, binary: &Path) -> RolloutResult<()>;
    async fn start(&self, instance: &InstanceConfig) -> RolloutResult<()>;
    /// The supervisor's view of the unit (`active`, `failed`, ...).
    async fn active_state(&self, instance: &InstanceConfig) -> RolloutResult<String>;
}

pub struct SystemdInstances {
    rollout: RolloutConfig,
    supervisor: SupervisorConfig,
    ping_path: String,
    drain_path: String,
}

impl SystemdInstances {
    pub fn new(rollout: RolloutConfig, supervisor: SupervisorConfig, api_prefix: &str) -> Self {
        Self {
            rollout,
            supervisor,
            ping_path: format!("/{api_prefix}/meta/ping"),
            drain_path: format!("/{api_prefix}/meta/drain"),
        }
    }

    fn policy(&self) -> HealthPolicy {
        HealthPolicy {
            attempts: self.rollout.health_attempts,
            interval: Duration::from_millis(self.rollout.health_interval_ms),
            timeout: Duration::from_millis(self.rollout.health_timeout_ms),
        }
    }

    fn unit_path(&self, instance: &InstanceConfig) -> PathBuf {
        self.rollout.unit_dir.join(&instance.unit)
    }

    fn privileged(&self, program: &str) -> Command {
        if self.supervisor.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg(program);
            cmd
        } else {
            Command::new(program)
        }
    }

    async fn systemctl(&self, action: &'static str, unit: &str) -> RolloutResult<Output> {
        let mut cmd = self.privileged(&self.supervisor.systemctl);
        cmd.arg(action);
        if !unit.is_empty() {
            cmd.arg(unit);
        }
        debug!(action, unit, "running systemctl");
        cmd.output().await.map_err(|e| RolloutError::Supervisor {
            unit: unit.to_string(),
            action,
            detail: e.to_string(),
        })
    }

    async fn systemctl_ok(&self, action: &'static str, unit: &str) -> RolloutResult<()> {
        let output = self.systemctl(action, unit).await?;
        if output.status.success() {
            return Ok(());
        }
        Err(failed(action, unit, &output))
    }

    async fn write_unit(&self, path: &Path, text: &str) -> RolloutResult<()> {
        if !self.supervisor.use_sudo {
            return tokio::fs::write(path, text).await.map_err(RolloutError::io(path));
        }
        let mut child = self
            .privileged("tee")
            .arg(path)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(RolloutError::io(path))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(text.as_bytes())
                .await
                .map_err(RolloutError::io(path))?;
        }
        let output = child.wait_with_output().await.map_err(RolloutError::io(path))?;
        if !output.status.success() {
            return Err(failed("write", &path.to_string_lossy(), &output));
        }
        Ok(())
    }
}

fn failed(action: &'static str, unit: &str, output: &Output) -> RolloutError {
    RolloutError::Supervisor {
        unit: unit.to_string(),
        action,
        detail: format!(
            "{}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
    }
}

#[async_trait]
impl InstanceOps for SystemdInstances {
    async fn check_health(&self, instance: &InstanceConfig) -> RolloutResult<()> {
        check_host(&instance.host(), &self.ping_path, self.policy())
            .await
            .map_err(|source| RolloutError::Unhealthy {
                instance: instance.name.clone(),
                source,
            })
    }

    async fn set_drain(&self, instance: &InstanceConfig, enabled: bool) -> RolloutResult<()> {
        let timeout = Duration::from_millis(self.rollout.health_timeout_ms);
        set_drain(&instance.host(), &self.drain_path, enabled, timeout)
            .await
            .map_err(|source| RolloutError::Drain {
                instance: instance.name.clone(),
                source,
            })
    }

    async fn stop(&self, instance: &InstanceConfig) -> RolloutResult<()> {
        let output = self.systemctl("stop", &instance.unit).await?;
        if output.status.success() || output.status.code() == Some(EXIT_UNIT_NOT_LOADED) {
            return Ok(());
        }
        Err(failed("stop", &instance.unit, &output))
    }

    async fn retarget(&self, instance: &InstanceConfig, binary: &Path) -> RolloutResult<()> {
        let path = self.unit_path(instance);
        let current = tokio::fs::read_to_string(&path)
            .await
            .map_err(RolloutError::io(&path))?;
        let line = exec_start_line(binary, instance, &self.rollout.config_path);
        let updated = retarget_exec_start(&current, &line)
            .ok_or_else(|| RolloutError::NoExecStart { path: path.clone() })?;
        self.write_unit(&path, &updated).await?;
        self.systemctl_ok("daemon-reload", "").await?;
        info!(unit = %instance.unit, binary = %binary.display(), "unit retargeted");
        Ok(())
    }

    async fn start(&self, instance: &InstanceConfig) -> RolloutResult<()> {
        self.systemctl_ok("start", &instance.unit).await
    }

    async fn active_state(&self, instance: &InstanceConfig) -> RolloutResult<String> {
        let output = Command::new(&self.supervisor.systemctl)
            .args(["is-active", &instance.unit])
            .output()
            .await
            .map_err(|e| RolloutError::Supervisor {
                unit: instance.unit.clone(),
                action: "is-active",
                detail: e.to_string(),
            })?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn stub_systemctl(dir: &Path) -> PathBuf {
        let path = dir.join("systemctl");
        let calls = dir.join("calls");
        let script = format!(
            "#!/bin/sh\necho \"$@\" >> {}\ncase \"$1\" in\n  is-active) echo active ;;\n  stop) exit 5 ;;\nesac\n",
            calls.display()
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn instances(dir: &Path) -> (SystemdInstances, InstanceConfig) {
        let rollout = RolloutConfig {
            unit_dir: dir.to_path_buf(),
            config_path: PathBuf::from("/etc/sh.toml"),
            ..RolloutConfig::default()
        };
        let supervisor = SupervisorConfig {
            use_sudo: false,
            systemctl: stub_systemctl(dir).to_string_lossy().into_owned(),
            ..SupervisorConfig::default()
        };
        let blue = InstanceConfig::new("blue", 8080, true);
        (SystemdInstances::new(rollout, supervisor, "stagehand"), blue)
    }

    #[tokio::test]
    async fn retarget_rewrites_unit_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let (ops, blue) = instances(dir.path());
        let unit = dir.path().join(&blue.unit);
        std::fs::write(&unit, "[Service]\nExecStart=/old/0.1.0 serve\n").unwrap();

        ops.retarget(&blue, Path::new("/builds/0.2.0")).await.unwrap();

        let text = std::fs::read_to_string(&unit).unwrap();
        assert_eq!(
            text,
            "[Service]\nExecStart=/builds/0.2.0 serve --config /etc/sh.toml \
             --instance blue --port 8080 --app-version 0.2.0\n"
        );
        let calls = std::fs::read_to_string(dir.path().join("calls")).unwrap();
        assert_eq!(calls, "daemon-reload\n");
    }

    #[tokio::test]
    async fn stop_tolerates_unloaded_unit_and_reads_state() {
        let dir = tempfile::tempdir().unwrap();
        let (ops, blue) = instances(dir.path());
        ops.stop(&blue).await.unwrap();
        assert_eq!(ops.active_state(&blue).await.unwrap(), "active");
    }

    #[tokio::test]
    async fn retarget_without_exec_start_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (ops, blue) = instances(dir.path());
        std::fs::write(dir.path().join(&blue.unit), "[Service]\n").unwrap();
        let err = ops.retarget(&blue, Path::new("/b/1")).await.unwrap_err();
        assert!(matches!(err, RolloutError::NoExecStart { .. }));
    }
}
