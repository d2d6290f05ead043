//! Stage & Test orchestration.
//!
//! A stage pairs a release with an environment tag. It moves
//! `pre → active → ready → promoted`: the checkout exists in `pre`, a
//! written configuration makes it `active`, and a passing test makes it
//! `ready`. Starting a new test on a `ready` stage drops it back to `pre`
//! until that test passes.

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use stagehand_core::{Layout, epoch_secs};
use stagehand_state::{
    Stage, StageStatus, StateError, StateStore, Test, TestStatus, TestSummary,
};

use crate::Collaborators;
use crate::error::{LifecycleError, LifecycleResult};
use crate::events::EventEmitter;
use crate::fsutil;
use crate::joblog::JobLog;
use crate::runner::{Invocation, ScriptOutcome};
use crate::tasks::TaskSlots;

#[derive(Clone)]
pub struct StageOrchestrator {
    store: StateStore,
    layout: Layout,
    collaborators: Collaborators,
    tests: TaskSlots,
    events: EventEmitter,
}

impl StageOrchestrator {
    pub fn new(store: StateStore, layout: Layout, collaborators: Collaborators) -> Self {
        Self {
            store,
            layout,
            collaborators,
            tests: TaskSlots::new(),
            events: EventEmitter::disabled(),
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    // ── Stages ─────────────────────────────────────────────────────

    /// Check out `release_id` for `env_tag` and record the stage in `pre`.
    pub async fn prepare_stage(&self, release_id: &str, env_tag: &str) -> LifecycleResult<Stage> {
        let release_id = release_id.trim();
        let env_tag = env_tag.trim();
        if release_id.is_empty() || env_tag.is_empty() {
            return Err(LifecycleError::InvalidRequest(
                "release id and env tag are required".to_string(),
            ));
        }
        if !is_path_safe(release_id) || !is_path_safe(env_tag) {
            return Err(LifecycleError::InvalidRequest(format!(
                "invalid stage key {release_id}-{env_tag}"
            )));
        }

        let id = Stage::key(release_id, env_tag);
        if self.store.get_stage(&id)?.is_some() {
            return Err(LifecycleError::AlreadyExists(id));
        }
        let release = self
            .store
            .get_release(release_id)?
            .ok_or_else(|| LifecycleError::ReleaseNotFound(release_id.to_string()))?;

        let repo = self.layout.stage_repo(&id);
        self.collaborators.scm.checkout(&release.sha, &repo).await?;
        self.seed_env(&id).await?;

        let now = epoch_secs();
        let stage = Stage {
            id: id.clone(),
            release_id: release_id.to_string(),
            env_tag: env_tag.to_string(),
            status: StageStatus::Pre,
            test_sequence: 0,
            last_test: None,
            created_at: now,
            updated_at: now,
        };
        self.store.put_stage(&stage)?;
        info!(stage_id = %id, sha = %release.sha, "stage prepared");
        self.events.stage_prepared(&stage);
        Ok(stage)
    }

    /// Copy the env template into the stage's env directory.
    async fn seed_env(&self, stage_id: &str) -> LifecycleResult<()> {
        let template = self.layout.template_env_file();
        let text = match fsutil::read_optional(&template).await? {
            Some(text) => text,
            None => {
                warn!(path = %template.display(), "env template missing, creating an empty one");
                fsutil::write_file(&template, "").await?;
                String::new()
            }
        };
        fsutil::write_file(&self.layout.stage_env_file(stage_id), &text).await
    }

    /// Replace the stage's configuration. Any recorded test result is
    /// cleared; a `pre` stage becomes `active`.
    pub async fn update_stage_env(&self, stage_id: &str, text: &str) -> LifecycleResult<Stage> {
        if text.trim().is_empty() {
            return Err(LifecycleError::InvalidRequest(
                "env text must not be empty".to_string(),
            ));
        }
        self.require_stage(stage_id)?;
        fsutil::write_file(&self.layout.stage_env_file(stage_id), text).await?;

        let now = epoch_secs();
        let stage = self
            .store
            .update_stage(stage_id, |stage| {
                stage.last_test = None;
                if stage.status == StageStatus::Pre {
                    stage.status = StageStatus::Active;
                }
                stage.updated_at = now;
            })?
            .ok_or_else(|| LifecycleError::StageNotFound(stage_id.to_string()))?;
        info!(%stage_id, status = %stage.status, "stage env updated");
        self.events.stage_env_updated(&stage);
        Ok(stage)
    }

    pub async fn get_stage_env(&self, stage_id: &str) -> LifecycleResult<String> {
        self.require_stage(stage_id)?;
        let text = fsutil::read_optional(&self.layout.stage_env_file(stage_id)).await?;
        Ok(text.unwrap_or_default())
    }

    pub async fn get_env_template(&self) -> LifecycleResult<String> {
        let text = fsutil::read_optional(&self.layout.template_env_file()).await?;
        Ok(text.unwrap_or_default())
    }

    pub async fn update_env_template(&self, text: &str) -> LifecycleResult<()> {
        if text.trim().is_empty() {
            return Err(LifecycleError::InvalidRequest(
                "env template must not be empty".to_string(),
            ));
        }
        fsutil::write_file(&self.layout.template_env_file(), text).await?;
        info!("env template updated");
        Ok(())
    }

    pub fn get_stage(&self, stage_id: &str) -> LifecycleResult<Stage> {
        self.require_stage(stage_id)
    }

    /// Newest first.
    pub fn list_stages(&self) -> LifecycleResult<Vec<Stage>> {
        Ok(self.store.list_stages()?)
    }

    /// Remove the stage, its tests, their logs, and its on-disk checkout
    /// and configuration. Running tests are canceled first.
    pub async fn delete_stage(&self, stage_id: &str) -> LifecycleResult<()> {
        self.require_stage(stage_id)?;
        if self.store.get_deployment(stage_id)?.is_some() {
            return Err(LifecycleError::DeploymentExists(stage_id.to_string()));
        }

        for test in self.store.list_tests_for_stage(stage_id)? {
            if test.status == TestStatus::Running {
                self.tests.cancel(&test.id).await;
            }
        }

        fsutil::remove_dir(&self.layout.stage_repo(stage_id)).await?;
        fsutil::remove_dir(&self.layout.stage_env_dir(stage_id)).await?;

        let removed = self.store.delete_tests_for_stage(stage_id)?;
        for test in &removed {
            fsutil::remove_file_quiet(std::path::Path::new(&test.log_path)).await;
        }
        self.store.delete_stage(stage_id)?;
        info!(%stage_id, tests = removed.len(), "stage deleted");
        self.events.stage_deleted(stage_id);
        Ok(())
    }

    fn require_stage(&self, stage_id: &str) -> LifecycleResult<Stage> {
        self.store
            .get_stage(stage_id)?
            .ok_or_else(|| LifecycleError::StageNotFound(stage_id.to_string()))
    }

    // ── Tests ──────────────────────────────────────────────────────

    /// Start a test run in the background and return its `running` record.
    pub async fn start_test(&self, stage_id: &str) -> LifecycleResult<Test> {
        self.require_stage(stage_id)?;
        let now = epoch_secs();
        let sequence = match self.store.next_test_sequence(stage_id, now) {
            Ok(seq) => seq,
            Err(StateError::NotFound { .. }) => {
                return Err(LifecycleError::StageNotFound(stage_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let id = Test::key(stage_id, sequence);
        let log_path = self.layout.test_log(&id);
        let log = JobLog::new(&log_path);
        log.create().await?;
        log.line(format!("Starting test {id} for stage {stage_id}")).await;

        let test = Test {
            id: id.clone(),
            stage_id: stage_id.to_string(),
            sequence,
            status: TestStatus::Running,
            ws_token: uuid::Uuid::new_v4().to_string(),
            log_path: log_path.to_string_lossy().into_owned(),
            started_at: now,
            finished_at: None,
            error: None,
        };
        self.store.put_test(&test)?;

        let summary = TestSummary {
            test_id: id.clone(),
            status: TestStatus::Running,
        };
        let stage = self
            .store
            .update_stage(stage_id, |stage| {
                if stage.status == StageStatus::Ready {
                    stage.status = StageStatus::Pre;
                }
                stage.last_test = Some(summary);
                stage.updated_at = now;
            })?
            .ok_or_else(|| LifecycleError::StageNotFound(stage_id.to_string()))?;

        let job = self.clone();
        let job_test = test.clone();
        let on_panic = self.clone();
        let panic_test = test.clone();
        self.tests
            .spawn(
                &id,
                move |cancel| async move { job.run_test(job_test, cancel).await },
                move |message| async move {
                    on_panic
                        .complete_test(&panic_test, TestStatus::Error, Some(message))
                        .await;
                },
            )
            .await;

        info!(test_id = %id, %stage_id, stage_status = %stage.status, "test started");
        self.events.test_started(&test);
        Ok(test)
    }

    async fn run_test(&self, test: Test, cancel: watch::Receiver<bool>) {
        let env_root = self.layout.stage_env_dir(&test.stage_id);
        let invocation = Invocation::new("./TEST", self.layout.stage_repo(&test.stage_id))
            .arg("--env-root")
            .arg(env_root.to_string_lossy())
            .arg("--app-version")
            .arg(format!("{}_test", test.stage_id));

        let log = JobLog::new(&test.log_path);
        let outcome = self
            .collaborators
            .runner
            .run(&invocation, log.path(), cancel)
            .await;
        let (status, error) = match outcome {
            Ok(ScriptOutcome::Succeeded) => (TestStatus::Passed, None),
            Ok(ScriptOutcome::Failed { code }) => {
                let code = code.map_or_else(|| "a signal".to_string(), |c| format!("code {c}"));
                (TestStatus::Failed, Some(format!("test script exited with {code}")))
            }
            Ok(ScriptOutcome::Canceled) => (TestStatus::Canceled, None),
            Err(e) => (TestStatus::Error, Some(e.to_string())),
        };
        log.line(format!("Test finished: {status}")).await;
        self.complete_test(&test, status, error).await;
    }

    /// Persist a terminal status once and reflect it on the stage. A test
    /// or stage deleted in the meantime is ignored.
    async fn complete_test(&self, test: &Test, status: TestStatus, error: Option<String>) {
        let finished = match self.store.finish_test(&test.id, status, error, epoch_secs()) {
            Ok(Some(t)) => t,
            Ok(None) => {
                debug!(test_id = %test.id, "test already finished or deleted");
                return;
            }
            Err(e) => {
                error!(test_id = %test.id, error = %e, "failed to persist test result");
                return;
            }
        };
        self.events.test_finished(&finished);

        let result = self.store.update_stage(&test.stage_id, |stage| {
            let Some(last) = stage.last_test.as_mut() else {
                return;
            };
            if last.test_id != finished.id {
                return;
            }
            last.status = status;
            if status == TestStatus::Passed
                && matches!(stage.status, StageStatus::Pre | StageStatus::Active)
            {
                stage.status = StageStatus::Ready;
            }
            stage.updated_at = epoch_secs();
        });
        match result {
            Ok(Some(stage)) => {
                info!(test_id = %test.id, %status, stage_status = %stage.status, "test finished")
            }
            Ok(None) => debug!(test_id = %test.id, "stage deleted before test finished"),
            Err(e) => error!(test_id = %test.id, error = %e, "failed to update stage"),
        }
    }

    /// Ask a running test to stop. The terminal `canceled` status is written
    /// once the script exits.
    pub async fn cancel_test(&self, stage_id: &str, test_id: &str) -> LifecycleResult<Test> {
        let test = self
            .store
            .get_test(test_id)?
            .filter(|t| t.stage_id == stage_id)
            .ok_or_else(|| LifecycleError::TestNotFound(test_id.to_string()))?;
        if test.status != TestStatus::Running {
            return Err(LifecycleError::TestNotRunning(test_id.to_string()));
        }

        if !self.tests.cancel(test_id).await {
            // Nothing is executing it; close the record directly.
            warn!(%test_id, "canceling a test with no active runner");
            self.complete_test(&test, TestStatus::Canceled, None).await;
        }
        info!(%test_id, "test cancel requested");
        Ok(test)
    }

    /// Highest sequence first.
    pub fn list_tests(&self, stage_id: &str) -> LifecycleResult<Vec<Test>> {
        self.require_stage(stage_id)?;
        Ok(self.store.list_tests_for_stage(stage_id)?)
    }

    pub fn get_test(&self, test_id: &str) -> LifecycleResult<Test> {
        self.store
            .get_test(test_id)?
            .ok_or_else(|| LifecycleError::TestNotFound(test_id.to_string()))
    }

    /// Whether a log stream for `test_id` should end. Unknown tests count
    /// as finished.
    pub fn test_finished(&self, test_id: &str) -> bool {
        match self.store.get_test(test_id) {
            Ok(Some(test)) => test.status.is_terminal(),
            Ok(None) => true,
            Err(e) => {
                warn!(%test_id, error = %e, "test status lookup failed");
                false
            }
        }
    }

    /// Close out tests left `running` by a previous process.
    pub fn recover_interrupted(&self) -> LifecycleResult<usize> {
        let mut recovered = 0;
        for stage in self.store.list_stages()? {
            for test in self.store.list_tests_for_stage(&stage.id)? {
                if test.status != TestStatus::Running {
                    continue;
                }
                let finished = self.store.finish_test(
                    &test.id,
                    TestStatus::Error,
                    Some("interrupted by restart".to_string()),
                    epoch_secs(),
                )?;
                if finished.is_some() {
                    self.store.update_stage(&stage.id, |s| {
                        if let Some(last) = s.last_test.as_mut().filter(|l| l.test_id == test.id) {
                            last.status = TestStatus::Error;
                        }
                    })?;
                    recovered += 1;
                }
            }
        }
        if recovered > 0 {
            warn!(recovered, "interrupted tests marked as error");
        }
        Ok(recovered)
    }

    /// Cancel every running test and wait briefly for them to finish.
    pub async fn shutdown(&self) {
        self.tests.cancel_all(std::time::Duration::from_secs(5)).await;
    }
}

/// Stage ids become directory names and URL prefixes.
fn is_path_safe(part: &str) -> bool {
    part.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::{Fixture, Script, eventually};

    fn orchestrator(fx: &Fixture) -> StageOrchestrator {
        StageOrchestrator::new(fx.store.clone(), fx.layout.clone(), fx.collaborators())
    }

    fn test_status(fx: &Fixture, id: &str) -> Option<TestStatus> {
        fx.store.get_test(id).unwrap().map(|t| t.status)
    }

    #[tokio::test]
    async fn prepare_requires_known_release() {
        let dir = tempfile::tempdir().unwrap();
        let fx = Fixture::new(dir.path());
        let stages = orchestrator(&fx);

        let err = stages.prepare_stage("v1.0.0", "staging").await.unwrap_err();
        assert!(matches!(err, LifecycleError::ReleaseNotFound(_)));

        fx.release("v1.0.0");
        let stage = stages.prepare_stage("v1.0.0", "staging").await.unwrap();
        assert_eq!(stage.id, "v1.0.0-staging");
        assert_eq!(stage.status, StageStatus::Pre);
        let commit = fx.layout.stage_repo(&stage.id).join("COMMIT");
        assert_eq!(std::fs::read_to_string(commit).unwrap(), "sha-v1.0.0");

        let err = stages.prepare_stage("v1.0.0", "staging").await.unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn prepare_validates_input() {
        let dir = tempfile::tempdir().unwrap();
        let fx = Fixture::new(dir.path());
        let stages = orchestrator(&fx);
        for (rel, env) in [("", "prod"), ("v1", " "), ("v1", "a/b"), ("../x", "prod")] {
            let err = stages.prepare_stage(rel, env).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidRequest, "{rel:?} {env:?}");
        }
    }

    #[tokio::test]
    async fn prepare_seeds_env_from_template() {
        let dir = tempfile::tempdir().unwrap();
        let fx = Fixture::new(dir.path());
        let stages = orchestrator(&fx);
        fx.release("v1.0.0");
        stages.update_env_template("PORT=1\n").await.unwrap();

        let stage = stages.prepare_stage("v1.0.0", "prod").await.unwrap();
        assert_eq!(stages.get_stage_env(&stage.id).await.unwrap(), "PORT=1\n");
    }

    #[tokio::test]
    async fn prepare_creates_missing_template() {
        let dir = tempfile::tempdir().unwrap();
        let fx = Fixture::new(dir.path());
        let stages = orchestrator(&fx);
        fx.release("v1.0.0");
        std::fs::remove_dir_all(fx.layout.template_env_file().parent().unwrap()).unwrap();

        let stage = stages.prepare_stage("v1.0.0", "prod").await.unwrap();
        assert!(fx.layout.template_env_file().exists());
        assert_eq!(stages.get_stage_env(&stage.id).await.unwrap(), "");
    }

    #[tokio::test]
    async fn failed_checkout_is_upstream_and_records_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let fx = Fixture::new(dir.path());
        let stages = orchestrator(&fx);
        fx.release("v1.0.0");
        fx.scm.fail_checkout(true);

        let err = stages.prepare_stage("v1.0.0", "prod").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamFailure);
        assert!(fx.store.get_stage("v1.0.0-prod").unwrap().is_none());
    }

    #[tokio::test]
    async fn env_update_activates_stage() {
        let dir = tempfile::tempdir().unwrap();
        let fx = Fixture::new(dir.path());
        let stages = orchestrator(&fx);
        fx.release("v1.0.0");
        let stage = stages.prepare_stage("v1.0.0", "staging").await.unwrap();

        let err = stages.update_stage_env(&stage.id, "").await.unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidRequest(_)));
        let err = stages.update_stage_env("nope", "KEY=VAL").await.unwrap_err();
        assert!(matches!(err, LifecycleError::StageNotFound(_)));

        let updated = stages.update_stage_env(&stage.id, "KEY=VAL").await.unwrap();
        assert_eq!(updated.status, StageStatus::Active);
        assert_eq!(stages.get_stage_env(&stage.id).await.unwrap(), "KEY=VAL");
    }

    #[tokio::test]
    async fn env_update_on_ready_stage_clears_result_only() {
        let dir = tempfile::tempdir().unwrap();
        let fx = Fixture::new(dir.path());
        let stages = orchestrator(&fx);
        let stage = fx.ready_stage("v1.0.0", "prod");

        let updated = stages.update_stage_env(&stage.id, "A=2").await.unwrap();
        assert_eq!(updated.status, StageStatus::Ready);
        assert!(updated.last_test.is_none());
        assert!(!updated.has_passed_test());
    }

    #[tokio::test]
    async fn stage_transitions_are_recorded_as_events() {
        let dir = tempfile::tempdir().unwrap();
        let fx = Fixture::new(dir.path());
        let events = crate::EventEmitter::spawn(fx.store.clone(), crate::EventSettings::default());
        let stages = orchestrator(&fx).with_events(events.clone());
        fx.release("v1.0.0");

        let stage = stages.prepare_stage("v1.0.0", "staging").await.unwrap();
        stages.update_stage_env(&stage.id, "KEY=VAL").await.unwrap();
        let test = stages.start_test(&stage.id).await.unwrap();
        assert!(eventually(|| test_status(&fx, &test.id) == Some(TestStatus::Passed)).await);
        stages.delete_stage(&stage.id).await.unwrap();
        events.close().await;

        let stage_actions: Vec<String> = fx
            .store
            .events_for(&stage.id)
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(stage_actions, vec!["stage.prepared", "stage.env_updated", "stage.deleted"]);

        let test_events = fx.store.events_for(&test.id).unwrap();
        let test_actions: Vec<&str> = test_events.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(test_actions, vec!["test.started", "test.finished"]);
        assert_eq!(test_events[1].props["status"], "passed");
        assert_eq!(test_events[0].props["stage_id"], stage.id);
    }

    #[tokio::test]
    async fn passing_test_makes_stage_ready() {
        let dir = tempfile::tempdir().unwrap();
        let fx = Fixture::new(dir.path());
        let stages = orchestrator(&fx);
        fx.release("v1.0.0");
        let stage = stages.prepare_stage("v1.0.0", "staging").await.unwrap();
        stages.update_stage_env(&stage.id, "KEY=VAL").await.unwrap();

        let test = stages.start_test(&stage.id).await.unwrap();
        assert_eq!(test.id, "v1.0.0-staging-test-1");
        assert_eq!(test.status, TestStatus::Running);
        assert!(!test.ws_token.is_empty());

        assert!(eventually(|| test_status(&fx, &test.id) == Some(TestStatus::Passed)).await);
        assert!(
            eventually(|| {
                fx.store.get_stage(&stage.id).unwrap().unwrap().status == StageStatus::Ready
            })
            .await
        );

        let inv = &fx.runner.invocations()[0];
        assert_eq!(inv.program, "./TEST");
        assert_eq!(inv.cwd, fx.layout.stage_repo(&stage.id));
        let env_root = fx.layout.stage_env_dir(&stage.id);
        assert_eq!(inv.flag_value("--env-root"), Some(env_root.to_str().unwrap()));
        assert_eq!(inv.flag_value("--app-version"), Some("v1.0.0-staging_test"));

        let log = std::fs::read_to_string(&test.log_path).unwrap();
        assert!(log.contains("Starting test v1.0.0-staging-test-1"));
        assert!(log.contains("Test finished: passed"));
    }

    #[tokio::test]
    async fn retest_demotes_ready_stage_first() {
        let dir = tempfile::tempdir().unwrap();
        let fx = Fixture::new(dir.path());
        let stages = orchestrator(&fx);
        let stage = fx.ready_stage("v1.0.0", "prod");
        fx.runner.set("./TEST", Script::Hang);

        let test = stages.start_test(&stage.id).await.unwrap();
        assert_eq!(test.sequence, 2);
        let current = stages.get_stage(&stage.id).unwrap();
        assert_eq!(current.status, StageStatus::Pre);
        assert_eq!(current.last_test.unwrap().status, TestStatus::Running);

        stages.cancel_test(&stage.id, &test.id).await.unwrap();
        assert!(eventually(|| test_status(&fx, &test.id) == Some(TestStatus::Canceled)).await);
        assert_eq!(stages.get_stage(&stage.id).unwrap().status, StageStatus::Pre);
    }

    #[tokio::test]
    async fn failing_and_unstartable_scripts() {
        let dir = tempfile::tempdir().unwrap();
        let fx = Fixture::new(dir.path());
        let stages = orchestrator(&fx);
        let stage = fx.ready_stage("v1.0.0", "prod");

        fx.runner.set("./TEST", Script::Fail(2));
        let failed = stages.start_test(&stage.id).await.unwrap();
        assert!(eventually(|| test_status(&fx, &failed.id) == Some(TestStatus::Failed)).await);
        let record = stages.get_test(&failed.id).unwrap();
        assert_eq!(record.error.as_deref(), Some("test script exited with code 2"));
        assert!(record.finished_at.is_some());

        fx.runner.set("./TEST", Script::Missing);
        let errored = stages.start_test(&stage.id).await.unwrap();
        assert!(eventually(|| test_status(&fx, &errored.id) == Some(TestStatus::Error)).await);

        let current = stages.get_stage(&stage.id).unwrap();
        assert_eq!(current.status, StageStatus::Pre);
        assert_eq!(current.last_test.unwrap().status, TestStatus::Error);
    }

    #[tokio::test]
    async fn concurrent_tests_get_distinct_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let fx = Fixture::new(dir.path());
        let stages = orchestrator(&fx);
        let stage = fx.ready_stage("v1.0.0", "prod");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let stages = stages.clone();
            let id = stage.id.clone();
            handles.push(tokio::spawn(async move { stages.start_test(&id).await }));
        }
        let mut seqs = Vec::new();
        for h in handles {
            seqs.push(h.await.unwrap().unwrap().sequence);
        }
        seqs.sort();
        assert_eq!(seqs, (2..=9).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn cancel_validation() {
        let dir = tempfile::tempdir().unwrap();
        let fx = Fixture::new(dir.path());
        let stages = orchestrator(&fx);
        let stage = fx.ready_stage("v1.0.0", "prod");
        let other = fx.ready_stage("v1.0.0", "dev");

        let test = stages.start_test(&stage.id).await.unwrap();
        assert!(eventually(|| test_status(&fx, &test.id) == Some(TestStatus::Passed)).await);

        let err = stages.cancel_test(&stage.id, &test.id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::TestNotRunning(_)));
        let err = stages.cancel_test(&other.id, &test.id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::TestNotFound(_)));
    }

    #[tokio::test]
    async fn cancel_orphaned_test_closes_record() {
        let dir = tempfile::tempdir().unwrap();
        let fx = Fixture::new(dir.path());
        let stages = orchestrator(&fx);
        let stage = fx.ready_stage("v1.0.0", "prod");
        let orphan = Test {
            id: Test::key(&stage.id, 7),
            stage_id: stage.id.clone(),
            sequence: 7,
            status: TestStatus::Running,
            ws_token: "t".into(),
            log_path: fx.layout.test_log("x").to_string_lossy().into_owned(),
            started_at: 1,
            finished_at: None,
            error: None,
        };
        fx.store.put_test(&orphan).unwrap();

        stages.cancel_test(&stage.id, &orphan.id).await.unwrap();
        assert_eq!(test_status(&fx, &orphan.id), Some(TestStatus::Canceled));
    }

    #[tokio::test]
    async fn delete_stage_cleans_up_everything() {
        let dir = tempfile::tempdir().unwrap();
        let fx = Fixture::new(dir.path());
        let stages = orchestrator(&fx);
        fx.release("v1.0.0");
        let stage = stages.prepare_stage("v1.0.0", "prod").await.unwrap();
        stages.update_stage_env(&stage.id, "A=1").await.unwrap();
        fx.runner.set("./TEST", Script::Hang);
        let test = stages.start_test(&stage.id).await.unwrap();

        stages.delete_stage(&stage.id).await.unwrap();

        assert!(fx.store.get_stage(&stage.id).unwrap().is_none());
        assert!(fx.store.get_test(&test.id).unwrap().is_none());
        assert!(!fx.layout.stage_repo(&stage.id).exists());
        assert!(!fx.layout.stage_env_dir(&stage.id).exists());
        assert!(!std::path::Path::new(&test.log_path).exists());

        let err = stages.delete_stage(&stage.id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::StageNotFound(_)));
    }

    #[tokio::test]
    async fn delete_stage_refused_while_deployed() {
        let dir = tempfile::tempdir().unwrap();
        let fx = Fixture::new(dir.path());
        let stages = orchestrator(&fx);
        let stage = fx.ready_stage("v1.0.0", "prod");
        fx.store
            .put_deployment(&stagehand_state::Deployment {
                id: stage.id.clone(),
                stage_id: stage.id.clone(),
                version: "v1.0.0".into(),
                env_tag: "prod".into(),
                port: None,
                status: stagehand_state::DeploymentStatus::Staged,
                log_path: String::new(),
                created_at: 1,
                promoted_at: None,
            })
            .unwrap();

        let err = stages.delete_stage(&stage.id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::DeploymentExists(_)));
    }

    #[tokio::test]
    async fn list_tests_requires_stage_and_orders_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let fx = Fixture::new(dir.path());
        let stages = orchestrator(&fx);
        let stage = fx.ready_stage("v1.0.0", "prod");
        assert!(matches!(
            stages.list_tests("nope").unwrap_err(),
            LifecycleError::StageNotFound(_)
        ));

        stages.start_test(&stage.id).await.unwrap();
        stages.start_test(&stage.id).await.unwrap();
        let seqs: Vec<u32> = stages
            .list_tests(&stage.id)
            .unwrap()
            .iter()
            .map(|t| t.sequence)
            .collect();
        assert_eq!(seqs, vec![3, 2]);
    }

    #[tokio::test]
    async fn recovery_marks_running_tests_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let fx = Fixture::new(dir.path());
        let stages = orchestrator(&fx);
        let stage = fx.ready_stage("v1.0.0", "prod");
        let test = Test {
            id: Test::key(&stage.id, 1),
            stage_id: stage.id.clone(),
            sequence: 1,
            status: TestStatus::Running,
            ws_token: "t".into(),
            log_path: String::new(),
            started_at: 1,
            finished_at: None,
            error: None,
        };
        fx.store.put_test(&test).unwrap();

        assert_eq!(stages.recover_interrupted().unwrap(), 1);
        assert_eq!(test_status(&fx, &test.id), Some(TestStatus::Error));
        assert!(stages.test_finished(&test.id));
        assert!(stages.test_finished("unknown"));
        assert_eq!(stages.recover_interrupted().unwrap(), 0);
    }
}
