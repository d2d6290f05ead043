//! stagehandd — the Stagehand daemon.
//!
//! One binary, two jobs:
//! - `serve` runs a single orchestrator instance (blue or green): the
//!   lifecycle store, the stage/test and deployment orchestrators, the
//!   routing table with its reconcile loop, and the HTTP API in front of
//!   the deployment forwarder.
//! - `rollout` moves both instances onto a newly built binary, one at a
//!   time, draining each before it restarts.
//!
//! # Usage
//!
//! ```text
//! stagehandd serve --config /etc/stagehand/stagehand.toml --instance green --port 8081
//! stagehandd rollout --config /etc/stagehand/stagehand.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

use stagehand_api::{ApiState, build_router};
use stagehand_core::StagehandConfig;
use stagehand_lifecycle::{
    Collaborators, DeploymentOrchestrator, EventEmitter, EventSettings, ReleaseSync,
    StageOrchestrator,
};
use stagehand_proxy::{ProxySync, RoutingTable};
use stagehand_rollout::{BlueGreenRollout, RolloutTimings, SystemdInstances, newest_binary};
use stagehand_state::StateStore;

const DEFAULT_FILTER: &str = "info,stagehandd=debug,stagehand=debug";

#[derive(Parser)]
#[command(name = "stagehandd", about = "Stagehand deployment orchestrator")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "STAGEHAND_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one orchestrator instance.
    Serve(ServeArgs),
    /// Update both instances to a new build, one at a time.
    Rollout {
        #[arg(long, env = "STAGEHAND_CONFIG", default_value = "/etc/stagehand/stagehand.toml")]
        config: PathBuf,

        /// Binary to roll out; defaults to the newest build in `rollout.builds_dir`.
        #[arg(long)]
        binary: Option<PathBuf>,
    },
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, env = "STAGEHAND_CONFIG", default_value = "/etc/stagehand/stagehand.toml")]
    config: PathBuf,

    #[arg(long, env = "STAGEHAND_PORT")]
    port: Option<u16>,

    /// Instance name, e.g. blue or green.
    #[arg(long, env = "STAGEHAND_INSTANCE")]
    instance: Option<String>,

    /// Root of the on-disk layout.
    #[arg(long, env = "STAGEHAND_ROOT")]
    root: Option<PathBuf>,

    /// Version reported by the meta endpoint.
    #[arg(long, env = "STAGEHAND_APP_VERSION")]
    app_version: Option<String>,
}

impl ServeArgs {
    fn apply(&self, config: &mut StagehandConfig) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(instance) = &self.instance {
            config.server.instance = instance.clone();
        }
        if let Some(root) = &self.root {
            config.layout.root = root.clone();
        }
        if let Some(version) = &self.app_version {
            config.server.version = Some(version.clone());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Serve(args) => {
            let mut config = load_config(&args.config)?;
            args.apply(&mut config);
            config.validate()?;
            serve(config).await
        }
        Command::Rollout { config, binary } => rollout(load_config(&config)?, binary).await,
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// A missing file means "all defaults"; a malformed one is fatal.
fn load_config(path: &Path) -> anyhow::Result<StagehandConfig> {
    if !path.exists() {
        warn!(path = %path.display(), "config file not found, using defaults");
        return Ok(StagehandConfig::default());
    }
    let config = StagehandConfig::from_file(path)
        .with_context(|| format!("loading {}", path.display()))?;
    info!(path = %path.display(), "config loaded");
    Ok(config)
}

async fn serve(config: StagehandConfig) -> anyhow::Result<()> {
    let instance = config.server.instance.clone();
    let version = config.version();
    info!(%instance, %version, "stagehand starting");

    let layout = config.layout();
    layout
        .ensure()
        .with_context(|| format!("creating layout under {}", layout.root().display()))?;

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&layout.state_path())?;
    info!(path = %layout.state_path().display(), "state store opened");

    let routes = RoutingTable::new([config.server.api_prefix.clone()]);
    let collaborators = Collaborators::system(&config);
    let events = EventEmitter::spawn(store.clone(), EventSettings::from(&config.events));
    let stages = StageOrchestrator::new(store.clone(), layout.clone(), collaborators.clone())
        .with_events(events.clone());
    let deployments = DeploymentOrchestrator::new(
        store.clone(),
        layout.clone(),
        config.ports,
        collaborators.clone(),
        routes.clone(),
    )
    .with_events(events.clone());
    let releases = ReleaseSync::new(store.clone(), collaborators.scm.clone());

    let tests = stages.recover_interrupted()?;
    let provisions = deployments.recover_interrupted()?;
    info!(tests, provisions, "interrupted jobs recovered");

    // Routes must be in place before the first request is accepted.
    let sync = ProxySync::new(routes, store);
    let stats = sync.sync()?;
    info!(
        deployments = stats.deployments_seen,
        live = stats.routes_live,
        has_main = stats.has_main,
        "routing table loaded"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let interval = config.routing.reconcile_interval_secs;
    let reconcile = if interval > 0 {
        let shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            sync.run_reconcile(Duration::from_secs(interval), shutdown).await;
        }))
    } else {
        info!("routing reconciliation disabled");
        None
    };

    // ── Start API server ───────────────────────────────────────

    let state = ApiState::new(stages.clone(), deployments.clone(), releases, version);
    let router = build_router(state, &config.server.api_prefix);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, %instance, "API server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    stages.shutdown().await;
    deployments.shutdown_jobs().await;
    if let Some(handle) = reconcile {
        let _ = handle.await;
    }
    events.close().await;

    info!(%instance, "stagehand stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn rollout(config: StagehandConfig, binary: Option<PathBuf>) -> anyhow::Result<()> {
    let binary = match binary {
        Some(binary) => binary,
        None => newest_binary(&config.rollout.builds_dir)?,
    };
    info!(binary = %binary.display(), "rolling out");

    let ops = Arc::new(SystemdInstances::new(
        config.rollout.clone(),
        config.supervisor.clone(),
        &config.server.api_prefix,
    ));
    let controller = BlueGreenRollout::new(
        ops,
        config.rollout.instances.clone(),
        RolloutTimings::from(&config.rollout),
    );

    let report = controller.run(&binary).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
