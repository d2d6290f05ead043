//! Process supervision for provisioned deployments.
//!
//! Each deployment runs as its own systemd unit named
//! `<unit_prefix>-<deployment_id>.service`. Installing a unit writes the
//! rendered file, reloads the manager, enables the unit, and restarts it.

use std::path::PathBuf;
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use stagehand_core::SupervisorConfig;

use crate::error::{LifecycleError, LifecycleResult};
use crate::joblog::JobLog;

/// `systemctl stop` exit code for a unit that is not loaded.
const EXIT_UNIT_NOT_LOADED: i32 = 5;

const UNIT_TEMPLATE: &str = "\
[Unit]
Description=Stagehand backend {deployment_id}
After=network.target

[Service]
Type=simple
Environment=ENV_TAG={env_tag}
Environment=PORT={port}
ExecStart={binary_path} --port {port} --env-root {env_root} --app-version {version}
Restart=on-failure
RestartSec=2

[Install]
WantedBy=multi-user.target
";

/// Values rendered into a deployment's unit file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSpec {
    pub deployment_id: String,
    pub binary_path: PathBuf,
    pub env_tag: String,
    pub port: u16,
    pub env_root: PathBuf,
    pub version: String,
}

impl UnitSpec {
    pub fn render(&self) -> String {
        UNIT_TEMPLATE
            .replace("{deployment_id}", &self.deployment_id)
            .replace("{env_tag}", &self.env_tag)
            .replace("{port}", &self.port.to_string())
            .replace("{binary_path}", &self.binary_path.to_string_lossy())
            .replace("{env_root}", &self.env_root.to_string_lossy())
            .replace("{version}", &self.version)
    }
}

/// Abstraction over the host's service manager for testability.
///
/// Real implementation: [`Systemd`].
/// Test double: `testing::FakeSupervisor`.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Write the unit and (re)start it. Progress goes to `log`.
    async fn install(&self, spec: &UnitSpec, log: &JobLog) -> LifecycleResult<()>;
    async fn start(&self, deployment_id: &str) -> LifecycleResult<()>;
    /// Stopping a unit that is not loaded succeeds.
    async fn stop(&self, deployment_id: &str) -> LifecycleResult<()>;
    /// Disable the unit and delete its file.
    async fn remove(&self, deployment_id: &str) -> LifecycleResult<()>;
    async fn is_active(&self, deployment_id: &str) -> bool;
}

#[derive(Debug, Clone)]
pub struct Systemd {
    config: SupervisorConfig,
}

impl Systemd {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    pub fn unit_name(&self, deployment_id: &str) -> String {
        format!("{}-{deployment_id}.service", self.config.unit_prefix)
    }

    fn unit_path(&self, deployment_id: &str) -> PathBuf {
        self.config.unit_dir.join(self.unit_name(deployment_id))
    }

    /// Build a privileged command, prefixed with `sudo` when configured.
    fn command(&self, program: &str) -> Command {
        if self.config.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg(program);
            cmd
        } else {
            Command::new(program)
        }
    }

    async fn systemctl(&self, args: &[&str]) -> LifecycleResult<Output> {
        debug!(?args, "running systemctl");
        self.command(&self.config.systemctl)
            .args(args)
            .output()
            .await
            .map_err(|e| LifecycleError::upstream("systemctl", e))
    }

    async fn systemctl_logged(&self, log: &JobLog, args: &[&str]) -> LifecycleResult<()> {
        log.line(format!("Running systemctl {}...", args.join(" "))).await;
        let output = self.systemctl(args).await?;
        for line in String::from_utf8_lossy(&output.stdout)
            .lines()
            .chain(String::from_utf8_lossy(&output.stderr).lines())
        {
            log.line(line).await;
        }
        if !output.status.success() {
            log.line(format!("systemctl {} failed: {}", args[0], output.status))
                .await;
            return Err(failure("systemctl", &output));
        }
        log.line(format!("systemctl {} completed", args[0])).await;
        Ok(())
    }

    async fn write_unit(&self, spec: &UnitSpec) -> LifecycleResult<()> {
        let path = self.unit_path(&spec.deployment_id);
        let rendered = spec.render();
        if !self.config.use_sudo {
            return tokio::fs::write(&path, rendered)
                .await
                .map_err(LifecycleError::io(&path));
        }

        use tokio::io::AsyncWriteExt;
        let mut child = self
            .command("tee")
            .arg(&path)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| LifecycleError::upstream("tee", e))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(rendered.as_bytes())
                .await
                .map_err(LifecycleError::io(&path))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| LifecycleError::upstream("tee", e))?;
        if !output.status.success() {
            return Err(failure("tee", &output));
        }
        Ok(())
    }
}

fn failure(tool: &'static str, output: &Output) -> LifecycleError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    LifecycleError::upstream(tool, format!("{}: {}", output.status, stderr.trim()))
}

#[async_trait]
impl Supervisor for Systemd {
    async fn install(&self, spec: &UnitSpec, log: &JobLog) -> LifecycleResult<()> {
        let unit = self.unit_name(&spec.deployment_id);
        log.line(format!("Service will run on port {}", spec.port)).await;
        log.line("Writing systemd unit file...").await;
        if let Err(e) = self.write_unit(spec).await {
            log.line(format!("Failed to write unit file: {e}")).await;
            return Err(e);
        }
        log.line("Unit file written successfully").await;

        self.systemctl_logged(log, &["daemon-reload"]).await?;
        self.systemctl_logged(log, &["enable", &unit]).await?;
        self.systemctl_logged(log, &["restart", &unit]).await?;
        info!(%unit, port = spec.port, "unit installed");
        Ok(())
    }

    async fn start(&self, deployment_id: &str) -> LifecycleResult<()> {
        let output = self.systemctl(&["start", &self.unit_name(deployment_id)]).await?;
        if !output.status.success() {
            return Err(failure("systemctl start", &output));
        }
        Ok(())
    }

    async fn stop(&self, deployment_id: &str) -> LifecycleResult<()> {
        let output = self.systemctl(&["stop", &self.unit_name(deployment_id)]).await?;
        if output.status.success() || output.status.code() == Some(EXIT_UNIT_NOT_LOADED) {
            return Ok(());
        }
        Err(failure("systemctl stop", &output))
    }

    async fn remove(&self, deployment_id: &str) -> LifecycleResult<()> {
        let unit = self.unit_name(deployment_id);
        match self.systemctl(&["disable", &unit]).await {
            Ok(output) if !output.status.success() => {
                warn!(%unit, status = %output.status, "systemctl disable failed");
            }
            Err(e) => warn!(%unit, error = %e, "systemctl disable failed"),
            Ok(_) => {}
        }
        let path = self.unit_path(deployment_id);
        let output = self
            .command("rm")
            .arg("-f")
            .arg(&path)
            .output()
            .await
            .map_err(|e| LifecycleError::upstream("rm", e))?;
        if !output.status.success() {
            return Err(failure("rm", &output));
        }
        Ok(())
    }

    async fn is_active(&self, deployment_id: &str) -> bool {
        // Querying state does not need privileges.
        let output = Command::new(&self.config.systemctl)
            .args(["is-active", &self.unit_name(deployment_id)])
            .output()
            .await;
        match output {
            Ok(out) => String::from_utf8_lossy(&out.stdout).trim() == "active",
            Err(e) => {
                warn!(%deployment_id, error = %e, "systemctl is-active failed");
                false
            }
        }
    }
}
