//! In-memory collaborator doubles for orchestration tests.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

use crate::error::{LifecycleError, LifecycleResult};
use crate::joblog::JobLog;
use crate::runner::{Invocation, ScriptOutcome, ScriptRunner};
use crate::scm::{RemoteTag, SourceControl};
use crate::supervisor::{Supervisor, UnitSpec};
use crate::tasks::cancelled;

/// How [`FakeRunner`] treats a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Succeed,
    Fail(i32),
    /// Runs until canceled.
    Hang,
    /// Cannot be started.
    Missing,
}

/// Scripted [`ScriptRunner`]. Programs default to [`Script::Succeed`].
///
/// A successful `./BUILD` writes every registered artifact into the
/// directory passed via `--output`.
#[derive(Default)]
pub struct FakeRunner {
    scripts: Mutex<HashMap<String, Script>>,
    artifacts: Mutex<Vec<String>>,
    invocations: Mutex<Vec<Invocation>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, program: &str, script: Script) {
        lock(&self.scripts).insert(program.to_string(), script);
    }

    pub fn build_produces(&self, artifact: &str) {
        lock(&self.artifacts).push(artifact.to_string());
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        lock(&self.invocations).clone()
    }

    pub fn count(&self, program: &str) -> usize {
        lock(&self.invocations)
            .iter()
            .filter(|i| i.program == program)
            .count()
    }
}

#[async_trait]
impl ScriptRunner for FakeRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        log: &Path,
        mut cancel: watch::Receiver<bool>,
    ) -> LifecycleResult<ScriptOutcome> {
        lock(&self.invocations).push(invocation.clone());
        let script = lock(&self.scripts)
            .get(&invocation.program)
            .copied()
            .unwrap_or(Script::Succeed);

        if script == Script::Missing {
            return Err(LifecycleError::upstream("script", "not found"));
        }
        if *cancel.borrow() {
            return Ok(ScriptOutcome::Canceled);
        }
        append(log, &format!("{} {}", invocation.program, invocation.args.join(" "))).await;

        match script {
            Script::Succeed => {
                if invocation.program == "./BUILD" {
                    if let Some(out) = invocation.flag_value("--output") {
                        let artifacts = lock(&self.artifacts).clone();
                        for name in artifacts {
                            let path = Path::new(out).join(name);
                            tokio::fs::write(&path, b"#!/bin/true\n")
                                .await
                                .map_err(LifecycleError::io(&path))?;
                        }
                    }
                }
                Ok(ScriptOutcome::Succeeded)
            }
            Script::Fail(code) => Ok(ScriptOutcome::Failed { code: Some(code) }),
            Script::Hang => {
                cancelled(&mut cancel).await;
                Ok(ScriptOutcome::Canceled)
            }
            Script::Missing => unreachable!(),
        }
    }
}

async fn append(path: &Path, line: &str) {
    if let Ok(mut file) = tokio::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .await
    {
        let _ = file.write_all(format!("{line}\n").as_bytes()).await;
    }
}

/// [`SourceControl`] over a fixed tag list. Checkout creates `dest` with a
/// `COMMIT` file holding the sha.
#[derive(Default)]
pub struct FakeScm {
    tags: Mutex<Vec<RemoteTag>>,
    fail_checkout: Mutex<bool>,
}

impl FakeScm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tag(&self, name: &str, sha: &str) {
        lock(&self.tags).push(RemoteTag {
            name: name.to_string(),
            sha: sha.to_string(),
        });
    }

    pub fn fail_checkout(&self, fail: bool) {
        *lock(&self.fail_checkout) = fail;
    }
}

#[async_trait]
impl SourceControl for FakeScm {
    async fn list_tags(&self) -> LifecycleResult<Vec<RemoteTag>> {
        Ok(lock(&self.tags).clone())
    }

    async fn checkout(&self, sha: &str, dest: &Path) -> LifecycleResult<()> {
        if *lock(&self.fail_checkout) {
            return Err(LifecycleError::upstream("git clone", "exit status: 128"));
        }
        tokio::fs::create_dir_all(dest)
            .await
            .map_err(LifecycleError::io(dest))?;
        let commit = dest.join("COMMIT");
        tokio::fs::write(&commit, sha)
            .await
            .map_err(LifecycleError::io(&commit))
    }
}

/// Records supervisor calls and tracks which units are active.
#[derive(Default)]
pub struct FakeSupervisor {
    calls: Mutex<Vec<String>>,
    installed: Mutex<HashMap<String, UnitSpec>>,
    active: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<&'static str>>,
    install_delay: Mutex<Option<std::time::Duration>>,
}

impl FakeSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `op` (`install`, `start`, `stop`, `remove`) fail.
    pub fn fail(&self, op: &'static str) {
        lock(&self.failing).insert(op);
    }

    /// Start operations succeed but the unit never reports active.
    pub fn never_active(&self) {
        lock(&self.failing).insert("active");
    }

    /// Make `install` take `delay` after it has been recorded.
    pub fn slow_install(&self, delay: std::time::Duration) {
        *lock(&self.install_delay) = Some(delay);
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn unit(&self, deployment_id: &str) -> Option<UnitSpec> {
        lock(&self.installed).get(deployment_id).cloned()
    }

    pub fn is_installed(&self, deployment_id: &str) -> bool {
        lock(&self.installed).contains_key(deployment_id)
    }

    fn record(&self, op: &'static str, id: &str) -> LifecycleResult<()> {
        lock(&self.calls).push(format!("{op} {id}"));
        if lock(&self.failing).contains(op) {
            return Err(LifecycleError::upstream("systemctl", format!("{op} failed")));
        }
        Ok(())
    }

    fn activate(&self, id: &str) {
        if !lock(&self.failing).contains("active") {
            lock(&self.active).insert(id.to_string());
        }
    }
}

#[async_trait]
impl Supervisor for FakeSupervisor {
    async fn install(&self, spec: &UnitSpec, log: &JobLog) -> LifecycleResult<()> {
        self.record("install", &spec.deployment_id)?;
        let delay = *lock(&self.install_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        log.line(format!("Service will run on port {}", spec.port)).await;
        lock(&self.installed).insert(spec.deployment_id.clone(), spec.clone());
        self.activate(&spec.deployment_id);
        Ok(())
    }

    async fn start(&self, deployment_id: &str) -> LifecycleResult<()> {
        self.record("start", deployment_id)?;
        self.activate(deployment_id);
        Ok(())
    }

    async fn stop(&self, deployment_id: &str) -> LifecycleResult<()> {
        self.record("stop", deployment_id)?;
        lock(&self.active).remove(deployment_id);
        Ok(())
    }

    async fn remove(&self, deployment_id: &str) -> LifecycleResult<()> {
        self.record("remove", deployment_id)?;
        lock(&self.installed).remove(deployment_id);
        Ok(())
    }

    async fn is_active(&self, deployment_id: &str) -> bool {
        lock(&self.active).contains(deployment_id)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Store, layout, and fakes wired together under `root`.
pub struct Fixture {
    pub layout: stagehand_core::Layout,
    pub store: stagehand_state::StateStore,
    pub runner: std::sync::Arc<FakeRunner>,
    pub scm: std::sync::Arc<FakeScm>,
    pub supervisor: std::sync::Arc<FakeSupervisor>,
}

impl Fixture {
    pub fn new(root: &Path) -> Self {
        let layout = stagehand_core::Layout::new(root);
        let _ = layout.ensure();
        Self {
            layout,
            store: stagehand_state::StateStore::open_in_memory()
                .unwrap_or_else(|e| panic!("in-memory store: {e}")),
            runner: std::sync::Arc::new(FakeRunner::new()),
            scm: std::sync::Arc::new(FakeScm::new()),
            supervisor: std::sync::Arc::new(FakeSupervisor::new()),
        }
    }

    pub fn collaborators(&self) -> crate::Collaborators {
        crate::Collaborators {
            runner: self.runner.clone(),
            scm: self.scm.clone(),
            supervisor: self.supervisor.clone(),
        }
    }

    /// Record a release and make the remote advertise it.
    pub fn release(&self, id: &str) {
        let sha = format!("sha-{id}");
        self.scm.add_tag(id, &sha);
        let _ = self.store.put_release(&stagehand_state::Release {
            id: id.to_string(),
            sha,
            created_at: stagehand_core::epoch_secs(),
        });
    }

    /// Insert a stage that has already passed a test.
    pub fn ready_stage(&self, release_id: &str, env_tag: &str) -> stagehand_state::Stage {
        use stagehand_state::{Stage, StageStatus, TestStatus, TestSummary};
        let id = Stage::key(release_id, env_tag);
        let stage = Stage {
            id: id.clone(),
            release_id: release_id.to_string(),
            env_tag: env_tag.to_string(),
            status: StageStatus::Ready,
            test_sequence: 1,
            last_test: Some(TestSummary {
                test_id: stagehand_state::Test::key(&id, 1),
                status: TestStatus::Passed,
            }),
            created_at: stagehand_core::epoch_secs(),
            updated_at: stagehand_core::epoch_secs(),
        };
        let _ = std::fs::create_dir_all(self.layout.stage_repo(&id));
        let _ = self.store.put_stage(&stage);
        stage
    }
}

/// Poll `check` every 10ms for up to five seconds.
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    false
}
