//! Deployment orchestration.
//!
//! A deployment is created by promoting a stage that passed its tests, then
//! provisioned in the background: a port is claimed, the release binary is
//! built (unless it already exists), and a supervisor unit is installed and
//! started. Every status change is pushed into the [`RoutingTable`] right
//! after it is persisted, so the table never routes to a deployment the
//! store does not consider ready.

use std::path::Path;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use stagehand_core::{Layout, PortRange, epoch_secs};
use stagehand_proxy::RoutingTable;
use stagehand_state::{Deployment, DeploymentStatus, StageStatus, StateError, StateStore};

use crate::Collaborators;
use crate::error::{LifecycleError, LifecycleResult};
use crate::events::EventEmitter;
use crate::fsutil;
use crate::joblog::JobLog;
use crate::runner::{Invocation, ScriptOutcome};
use crate::supervisor::UnitSpec;
use crate::tasks::TaskSlots;

/// How long `delete` waits for an in-flight provisioning job to wind down.
const PROVISION_STOP_GRACE: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct DeploymentOrchestrator {
    store: StateStore,
    layout: Layout,
    ports: PortRange,
    collaborators: Collaborators,
    routes: RoutingTable,
    provisioning: TaskSlots,
    events: EventEmitter,
}

impl DeploymentOrchestrator {
    pub fn new(
        store: StateStore,
        layout: Layout,
        ports: PortRange,
        collaborators: Collaborators,
        routes: RoutingTable,
    ) -> Self {
        Self {
            store,
            layout,
            ports,
            collaborators,
            routes,
            provisioning: TaskSlots::new(),
            events: EventEmitter::disabled(),
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    // ── Promotion ──────────────────────────────────────────────────

    /// Create a `staged` deployment from a stage whose latest test passed.
    ///
    /// This never makes the deployment main; see [`set_main`].
    ///
    /// [`set_main`]: DeploymentOrchestrator::set_main
    pub fn promote_stage(&self, stage_id: &str) -> LifecycleResult<Deployment> {
        let stage = self
            .store
            .get_stage(stage_id)?
            .ok_or_else(|| LifecycleError::StageNotFound(stage_id.to_string()))?;
        if stage.status == StageStatus::Promoted || self.store.get_deployment(stage_id)?.is_some() {
            return Err(LifecycleError::DeploymentExists(stage_id.to_string()));
        }
        match stage.status {
            StageStatus::Pre => return Err(LifecycleError::MissingEnv(stage_id.to_string())),
            StageStatus::Active => {
                return Err(LifecycleError::TestNotPassed(stage_id.to_string()));
            }
            _ if !stage.has_passed_test() => {
                return Err(LifecycleError::TestNotPassed(stage_id.to_string()));
            }
            _ => {}
        }

        let now = epoch_secs();
        let dep = Deployment {
            id: stage.id.clone(),
            stage_id: stage.id.clone(),
            version: stage.release_id.clone(),
            env_tag: stage.env_tag.clone(),
            port: None,
            status: DeploymentStatus::Staged,
            log_path: self.layout.deployment_log(&stage.id).to_string_lossy().into_owned(),
            created_at: now,
            promoted_at: None,
        };
        self.store.put_deployment(&dep)?;
        self.store.update_stage(stage_id, |s| {
            s.status = StageStatus::Promoted;
            s.updated_at = now;
        })?;
        self.routes.upsert(&dep);
        info!(deployment_id = %dep.id, version = %dep.version, "stage promoted to deployment");
        self.events.deployment_created(&dep);
        Ok(dep)
    }

    /// Promote the stage (or reuse its existing deployment) and provision it
    /// in the background. The flag is `true` when a new deployment was
    /// created.
    pub async fn create_deployment(&self, stage_id: &str) -> LifecycleResult<(Deployment, bool)> {
        if let Some(existing) = self.store.get_deployment(stage_id)? {
            self.provision(&existing).await?;
            info!(deployment_id = %existing.id, "re-provisioning existing deployment");
            return Ok((existing, false));
        }
        let dep = self.promote_stage(stage_id)?;
        self.provision(&dep).await?;
        Ok((dep, true))
    }

    // ── Provisioning ───────────────────────────────────────────────

    /// Launch provisioning for `dep`. Progress is written to its log file;
    /// the outcome lands on the record as `ready`, `build_failed`, or
    /// `provision_failed`.
    pub async fn provision(&self, dep: &Deployment) -> LifecycleResult<()> {
        let job = self.clone();
        let job_dep = dep.clone();
        let on_panic = self.clone();
        let panic_id = dep.id.clone();
        let started = self
            .provisioning
            .spawn(
                &dep.id,
                move |cancel| async move { job.run_provision(job_dep, cancel).await },
                move |message| async move {
                    warn!(deployment_id = %panic_id, %message, "provisioning panicked");
                    on_panic.transition(&panic_id, DeploymentStatus::ProvisionFailed);
                },
            )
            .await;
        if !started {
            return Err(LifecycleError::ProvisioningInProgress(dep.id.clone()));
        }
        Ok(())
    }

    async fn run_provision(&self, dep: Deployment, cancel: watch::Receiver<bool>) {
        let id = dep.id.clone();
        let log = JobLog::new(&dep.log_path);
        if let Err(e) = log.create().await {
            error!(deployment_id = %id, error = %e, "cannot create provisioning log");
            self.transition(&id, DeploymentStatus::ProvisionFailed);
            return;
        }
        log.line(format!("Starting deployment provisioning for {id}")).await;
        if self.transition(&id, DeploymentStatus::Provisioning).is_none() {
            return;
        }

        let port = match self.allocate_port(&id) {
            Ok(port) => port,
            Err(LifecycleError::DeploymentNotFound(_)) => {
                debug!(deployment_id = %id, "deployment deleted during provisioning");
                return;
            }
            Err(e) => {
                let message = format!("Port allocation failed: {e}");
                self.fail(&log, &id, DeploymentStatus::ProvisionFailed, message)
                    .await;
                return;
            }
        };
        log.line(format!("Allocated port {port}")).await;

        let binary = self.layout.binary_path(&dep.version);
        if let Err(message) = self.build(&dep, &binary, &log, cancel.clone()).await {
            self.fail(&log, &id, DeploymentStatus::BuildFailed, message).await;
            return;
        }
        if *cancel.borrow() {
            let message = "Provisioning canceled".to_string();
            self.fail(&log, &id, DeploymentStatus::ProvisionFailed, message)
                .await;
            return;
        }

        log.line("Installing systemd service...").await;
        let spec = UnitSpec {
            deployment_id: id.clone(),
            binary_path: binary,
            env_tag: dep.env_tag.clone(),
            port,
            env_root: self.layout.stage_env_dir(&dep.stage_id),
            version: dep.stage_id.clone(),
        };
        if let Err(e) = self.collaborators.supervisor.install(&spec, &log).await {
            let message = format!("Systemd install failed: {e}");
            self.fail(&log, &id, DeploymentStatus::ProvisionFailed, message)
                .await;
            return;
        }
        log.line("Systemd service installed and started").await;
        if *cancel.borrow() {
            let message = "Provisioning canceled after install".to_string();
            self.fail(&log, &id, DeploymentStatus::ProvisionFailed, message)
                .await;
            return;
        }

        if self.transition(&id, DeploymentStatus::Ready).is_some() {
            log.line("Deployment is now ready and routable under its stage (not main)")
                .await;
            info!(deployment_id = %id, port, "deployment ready");
        }
    }

    /// Build the release binary unless it already exists. The error is the
    /// line to record in the job log.
    async fn build(
        &self,
        dep: &Deployment,
        binary: &Path,
        log: &JobLog,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), String> {
        if tokio::fs::try_exists(binary).await.unwrap_or(false) {
            log.line(format!("Binary already exists at {}, skipping build", binary.display()))
                .await;
            return Ok(());
        }

        let builds = self.layout.builds_dir();
        tokio::fs::create_dir_all(&builds)
            .await
            .map_err(|e| format!("Failed to create build directory: {e}"))?;
        let repo = self.layout.stage_repo(&dep.stage_id);
        log.line(format!(
            "Running ./BUILD in {} with output {}",
            repo.display(),
            builds.display()
        ))
        .await;

        let invocation = Invocation::new("./BUILD", repo)
            .arg("--output")
            .arg(builds.to_string_lossy());
        match self
            .collaborators
            .runner
            .run(&invocation, log.path(), cancel)
            .await
        {
            Ok(ScriptOutcome::Succeeded) => {}
            Ok(ScriptOutcome::Failed { code }) => {
                return Err(format!("Build failed: exit code {code:?}"));
            }
            Ok(ScriptOutcome::Canceled) => return Err("Build canceled".to_string()),
            Err(e) => return Err(format!("Build failed: {e}")),
        }
        if !tokio::fs::try_exists(binary).await.unwrap_or(false) {
            return Err(format!("Build produced no binary at {}", binary.display()));
        }
        log.line("Build completed successfully").await;
        Ok(())
    }

    async fn fail(&self, log: &JobLog, id: &str, status: DeploymentStatus, message: String) {
        log.line(&message).await;
        warn!(deployment_id = %id, %status, %message, "provisioning failed");
        self.transition(id, status);
    }

    /// Persist a status and mirror it into the routing table. Returns `None`
    /// if the deployment no longer exists or the write failed.
    fn transition(&self, id: &str, status: DeploymentStatus) -> Option<Deployment> {
        match self.store.update_deployment(id, |d| d.status = status) {
            Ok(Some(dep)) => {
                self.routes.upsert(&dep);
                Some(dep)
            }
            Ok(None) => {
                debug!(deployment_id = %id, %status, "deployment gone, status dropped");
                None
            }
            Err(e) => {
                error!(deployment_id = %id, %status, error = %e, "failed to persist deployment status");
                None
            }
        }
    }

    /// Claim the lowest free port in the configured range for `id`. A
    /// deployment that already has a port keeps it.
    pub fn allocate_port(&self, id: &str) -> LifecycleResult<u16> {
        match self.store.claim_port(id, self.ports) {
            Ok(Some(port)) => Ok(port),
            Ok(None) => Err(LifecycleError::NoPortsAvailable {
                start: self.ports.start,
                end: self.ports.end,
            }),
            Err(StateError::NotFound { .. }) => Err(LifecycleError::DeploymentNotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    // ── Running state ──────────────────────────────────────────────

    /// Stop the process. A stopped deployment is never main and is removed
    /// from routing.
    pub async fn shutdown(&self, id: &str) -> LifecycleResult<Deployment> {
        self.require(id)?;
        if self.provisioning.is_running(id).await {
            return Err(LifecycleError::ProvisioningInProgress(id.to_string()));
        }
        self.collaborators.supervisor.stop(id).await?;
        let dep = self
            .store
            .update_deployment(id, |d| {
                d.status = DeploymentStatus::Stopped;
                d.promoted_at = None;
            })?
            .ok_or_else(|| LifecycleError::DeploymentNotFound(id.to_string()))?;
        self.routes.upsert(&dep);
        info!(deployment_id = %id, "deployment shut down");
        self.events.deployment_stopped(&dep);
        Ok(dep)
    }

    /// Start a previously provisioned deployment and route to it once the
    /// supervisor reports it active.
    pub async fn start(&self, id: &str) -> LifecycleResult<Deployment> {
        let dep = self.require(id)?;
        if dep.port.is_none() {
            return Err(LifecycleError::NotProvisioned(id.to_string()));
        }
        if self.provisioning.is_running(id).await {
            return Err(LifecycleError::ProvisioningInProgress(id.to_string()));
        }
        self.collaborators.supervisor.start(id).await?;
        if !self.collaborators.supervisor.is_active(id).await {
            return Err(LifecycleError::upstream(
                "systemctl",
                format!("unit for {id} is not active after start"),
            ));
        }
        let dep = self
            .store
            .update_deployment(id, |d| d.status = DeploymentStatus::Ready)?
            .ok_or_else(|| LifecycleError::DeploymentNotFound(id.to_string()))?;
        self.routes.upsert(&dep);
        info!(deployment_id = %id, "deployment started");
        Ok(dep)
    }

    /// Tear down a deployment. The main deployment is only deleted with
    /// `force`. The owning stage goes back to `ready` so it can be deployed
    /// again.
    pub async fn delete(&self, id: &str, force: bool) -> LifecycleResult<()> {
        let dep = self.require(id)?;
        if dep.is_main() && !force {
            return Err(LifecycleError::CannotDeleteMain(id.to_string()));
        }

        // The job may be mid-install; teardown must come after it.
        if !self
            .provisioning
            .cancel_and_wait(id, PROVISION_STOP_GRACE)
            .await
        {
            return Err(LifecycleError::ProvisioningInProgress(id.to_string()));
        }
        self.collaborators.supervisor.stop(id).await?;
        self.collaborators.supervisor.remove(id).await?;

        // Record first, then route: a late status write finds no record and
        // cannot put the route back.
        self.store.delete_deployment(id)?;
        self.routes.remove(id);

        let shared = self
            .store
            .list_deployments()?
            .iter()
            .any(|d| d.version == dep.version);
        if shared {
            debug!(deployment_id = %id, version = %dep.version, "binary shared, keeping it");
        } else {
            fsutil::remove_file_quiet(&self.layout.binary_path(&dep.version)).await;
        }

        fsutil::remove_file_quiet(Path::new(&dep.log_path)).await;

        let now = epoch_secs();
        match self.store.update_stage(&dep.stage_id, |s| {
            s.status = StageStatus::Ready;
            s.updated_at = now;
        }) {
            Ok(Some(_)) => {}
            Ok(None) => debug!(stage_id = %dep.stage_id, "owning stage already gone"),
            Err(e) => warn!(stage_id = %dep.stage_id, error = %e, "failed to reset stage"),
        }
        info!(deployment_id = %id, force, "deployment deleted");
        self.events.deployment_deleted(&dep, force);
        Ok(())
    }

    // ── Main deployment ────────────────────────────────────────────

    /// Make `id` the main deployment, clearing the previous holder.
    pub fn set_main(&self, id: &str) -> LifecycleResult<Deployment> {
        let dep = self.require(id)?;
        if !dep.is_ready() {
            return Err(LifecycleError::NotReady(id.to_string()));
        }
        let changed = self.store.set_main_deployment(id, epoch_secs())?;
        for d in &changed {
            self.routes.upsert(d);
        }
        info!(deployment_id = %id, "main deployment set");
        let main = changed
            .into_iter()
            .last()
            .ok_or_else(|| LifecycleError::DeploymentNotFound(id.to_string()))?;
        self.events.deployment_promoted(&main);
        Ok(main)
    }

    pub fn get_main(&self) -> LifecycleResult<Option<Deployment>> {
        Ok(self
            .store
            .list_deployments()?
            .into_iter()
            .find(Deployment::is_main))
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> LifecycleResult<Deployment> {
        self.require(id)
    }

    /// Newest first.
    pub fn list(&self) -> LifecycleResult<Vec<Deployment>> {
        Ok(self.store.list_deployments()?)
    }

    /// Whether a provisioning log stream for `id` should end. Unknown
    /// deployments count as settled.
    pub fn deployment_settled(&self, id: &str) -> bool {
        match self.store.get_deployment(id) {
            Ok(Some(dep)) => dep.status.is_settled(),
            Ok(None) => true,
            Err(e) => {
                warn!(deployment_id = %id, error = %e, "deployment status lookup failed");
                false
            }
        }
    }

    /// Whether a provisioning job for `id` is still running.
    pub async fn is_provisioning(&self, id: &str) -> bool {
        self.provisioning.is_running(id).await
    }

    /// Fail deployments left `provisioning` by a previous process.
    pub fn recover_interrupted(&self) -> LifecycleResult<usize> {
        let mut recovered = 0;
        for dep in self.store.list_deployments()? {
            if dep.status == DeploymentStatus::Provisioning {
                self.store
                    .update_deployment(&dep.id, |d| d.status = DeploymentStatus::ProvisionFailed)?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            warn!(recovered, "interrupted provisioning marked as failed");
        }
        Ok(recovered)
    }

    /// Cancel in-flight provisioning jobs.
    pub async fn shutdown_jobs(&self) {
        self.provisioning
            .cancel_all(std::time::Duration::from_secs(5))
            .await;
    }

    fn require(&self, id: &str) -> LifecycleResult<Deployment> {
        self.store
            .get_deployment(id)?
            .ok_or_else(|| LifecycleError::DeploymentNotFound(id.to_string()))
    }
}
