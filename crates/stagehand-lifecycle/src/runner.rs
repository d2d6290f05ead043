//! Running the managed application's BUILD and TEST scripts.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{LifecycleError, LifecycleResult};
use crate::tasks::cancelled;

/// One script invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Program, usually relative to `cwd` (e.g. `./TEST`).
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl Invocation {
    pub fn new(program: &str, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            cwd: cwd.into(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Value following `flag`, if present.
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        let idx = self.args.iter().position(|a| a == flag)?;
        self.args.get(idx + 1).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptOutcome {
    Succeeded,
    /// Non-zero exit; `None` when killed by a signal.
    Failed { code: Option<i32> },
    Canceled,
}

/// Runs opaque scripts with combined output appended to a log file.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Run to completion or until `cancel` flips, appending output to the
    /// existing file at `log`. `Err` means the script could not be started.
    async fn run(
        &self,
        invocation: &Invocation,
        log: &Path,
        cancel: watch::Receiver<bool>,
    ) -> LifecycleResult<ScriptOutcome>;
}

/// Real subprocess runner.
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

#[async_trait]
impl ScriptRunner for ProcessRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        log: &Path,
        mut cancel: watch::Receiver<bool>,
    ) -> LifecycleResult<ScriptOutcome> {
        if *cancel.borrow() {
            return Ok(ScriptOutcome::Canceled);
        }
        let stdout = std::fs::OpenOptions::new()
            .append(true)
            .open(log)
            .map_err(LifecycleError::io(log))?;
        let stderr = stdout.try_clone().map_err(LifecycleError::io(log))?;

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(&invocation.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                LifecycleError::upstream("script", format!("{}: {e}", invocation.program))
            })?;
        info!(program = %invocation.program, cwd = %invocation.cwd.display(), "script started");

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| LifecycleError::upstream("script", e))?;
                debug!(program = %invocation.program, ?status, "script exited");
                if status.success() {
                    Ok(ScriptOutcome::Succeeded)
                } else {
                    Ok(ScriptOutcome::Failed { code: status.code() })
                }
            }
            _ = cancelled(&mut cancel) => {
                warn!(program = %invocation.program, "script canceled, killing");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill canceled script");
                }
                Ok(ScriptOutcome::Canceled)
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    fn script(dir: &Path, name: &str, body: &str) {
        std::fs::write(dir.join("l"), "").unwrap();
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[tokio::test]
    async fn success_and_output_captured() {
        let dir = tempfile::tempdir().unwrap();
        script(dir.path(), "TEST", "echo out; echo err 1>&2; echo \"$1 $2\"");
        let log = dir.path().join("l");
        let (_tx, rx) = watch::channel(false);

        let inv = Invocation::new("./TEST", dir.path()).arg("--env-root").arg("/x");
        let outcome = ProcessRunner.run(&inv, &log, rx).await.unwrap();

        assert_eq!(outcome, ScriptOutcome::Succeeded);
        let text = std::fs::read_to_string(&log).unwrap();
        assert!(text.contains("out"));
        assert!(text.contains("err"));
        assert!(text.contains("--env-root /x"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        script(dir.path(), "TEST", "exit 3");
        let (_tx, rx) = watch::channel(false);
        let outcome = ProcessRunner
            .run(&Invocation::new("./TEST", dir.path()), &dir.path().join("l"), rx)
            .await
            .unwrap();
        assert_eq!(outcome, ScriptOutcome::Failed { code: Some(3) });
    }

    #[tokio::test]
    async fn missing_script_is_upstream_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("l"), "").unwrap();
        let (_tx, rx) = watch::channel(false);
        let err = ProcessRunner
            .run(&Invocation::new("./NOPE", dir.path()), &dir.path().join("l"), rx)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Upstream { .. }));
    }

    #[tokio::test]
    async fn cancel_kills_the_process() {
        let dir = tempfile::tempdir().unwrap();
        script(dir.path(), "TEST", "sleep 30");
        let (tx, rx) = watch::channel(false);
        let log = dir.path().join("l");
        let cwd = dir.path().to_path_buf();

        let task = tokio::spawn(async move {
            ProcessRunner.run(&Invocation::new("./TEST", cwd), &log, rx).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome, ScriptOutcome::Canceled);
    }

    #[tokio::test]
    async fn already_canceled_never_spawns() {
        let dir = tempfile::tempdir().unwrap();
        script(dir.path(), "TEST", "touch ran");
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let outcome = ProcessRunner
            .run(&Invocation::new("./TEST", dir.path()), &dir.path().join("l"), rx)
            .await
            .unwrap();
        assert_eq!(outcome, ScriptOutcome::Canceled);
        assert!(!dir.path().join("ran").exists());
    }

    #[test]
    fn flag_value_lookup() {
        let inv = Invocation::new("./BUILD", "/repo").arg("--output").arg("/builds");
        assert_eq!(inv.flag_value("--output"), Some("/builds"));
        assert_eq!(inv.flag_value("--missing"), None);
    }
}
