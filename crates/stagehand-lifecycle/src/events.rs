//! Lifecycle event emission.
//!
//! Orchestrators report every transition (stage prepared, test finished,
//! deployment promoted, ...) to an [`EventEmitter`]. Each event is logged
//! through tracing right away and queued for a background writer that
//! appends to the store in batches, flushing when a batch fills or the
//! flush interval elapses. When the queue is full or the writer is gone the
//! event is written through directly.
//!
//! A disabled emitter only logs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use stagehand_core::{EventsConfig, epoch_secs};
use stagehand_state::{Deployment, LifecycleEvent, Stage, StateStore, Test};

#[derive(Debug, Clone, Copy)]
pub struct EventSettings {
    pub buffer: usize,
    pub batch_size: usize,
    pub flush_every: Duration,
}

impl From<&EventsConfig> for EventSettings {
    fn from(config: &EventsConfig) -> Self {
        Self {
            buffer: config.buffer.max(1),
            batch_size: config.batch_size.max(1),
            flush_every: Duration::from_millis(config.flush_interval_ms.max(1)),
        }
    }
}

impl Default for EventSettings {
    fn default() -> Self {
        Self::from(&EventsConfig::default())
    }
}

struct Writer {
    store: StateStore,
    tx: mpsc::Sender<LifecycleEvent>,
    close_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle; clones share one background writer.
#[derive(Clone, Default)]
pub struct EventEmitter {
    writer: Option<Arc<Writer>>,
}

impl EventEmitter {
    /// Log-only emitter.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Start a background writer appending to `store`. Must be called
    /// inside a tokio runtime.
    pub fn spawn(store: StateStore, settings: EventSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.buffer);
        let (close_tx, close_rx) = watch::channel(false);
        let handle = tokio::spawn(run_writer(store.clone(), rx, close_rx, settings));
        Self {
            writer: Some(Arc::new(Writer {
                store,
                tx,
                close_tx,
                handle: Mutex::new(Some(handle)),
            })),
        }
    }

    pub fn emit(&self, event: LifecycleEvent) {
        info!(
            target: "stagehand::events",
            action = %event.action,
            target_type = %event.target_type,
            target_id = %event.target_id,
            props = ?event.props,
            "lifecycle event"
        );
        let Some(writer) = &self.writer else {
            return;
        };
        match writer.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event) | mpsc::error::TrySendError::Closed(event)) => {
                if let Err(e) = writer.store.append_events(std::slice::from_ref(&event)) {
                    warn!(action = %event.action, error = %e, "failed to record event");
                }
            }
        }
    }

    /// Flush queued events and stop the writer. Later emits write through.
    pub async fn close(&self) {
        let Some(writer) = &self.writer else {
            return;
        };
        let _ = writer.close_tx.send(true);
        if let Some(handle) = writer.handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "event writer ended abnormally");
            }
        }
    }

    // ── Stage events ───────────────────────────────────────────────

    pub fn stage_prepared(&self, stage: &Stage) {
        self.emit(
            event("stage.prepared", "stage", &stage.id)
                .prop("release_id", &stage.release_id)
                .prop("env_tag", &stage.env_tag),
        );
    }

    pub fn stage_env_updated(&self, stage: &Stage) {
        self.emit(event("stage.env_updated", "stage", &stage.id).prop("status", stage.status));
    }

    pub fn stage_deleted(&self, stage_id: &str) {
        self.emit(event("stage.deleted", "stage", stage_id));
    }

    pub fn test_started(&self, test: &Test) {
        self.emit(
            event("test.started", "test", &test.id)
                .prop("stage_id", &test.stage_id)
                .prop("sequence", test.sequence),
        );
    }

    pub fn test_finished(&self, test: &Test) {
        let mut evt = event("test.finished", "test", &test.id)
            .prop("stage_id", &test.stage_id)
            .prop("status", test.status);
        if let Some(error) = &test.error {
            evt = evt.prop("error", error);
        }
        self.emit(evt);
    }

    // ── Deployment events ──────────────────────────────────────────

    pub fn deployment_created(&self, dep: &Deployment) {
        self.emit(
            event("deployment.created", "deployment", &dep.id)
                .prop("stage_id", &dep.stage_id)
                .prop("status", dep.status),
        );
    }

    pub fn deployment_promoted(&self, dep: &Deployment) {
        self.emit(event("deployment.promoted", "deployment", &dep.id).prop("version", &dep.version));
    }

    pub fn deployment_stopped(&self, dep: &Deployment) {
        self.emit(event("deployment.stopped", "deployment", &dep.id));
    }

    pub fn deployment_deleted(&self, dep: &Deployment, force: bool) {
        self.emit(
            event("deployment.deleted", "deployment", &dep.id)
                .prop("stage_id", &dep.stage_id)
                .prop("force", force),
        );
    }
}

fn event(action: &str, target_type: &str, target_id: &str) -> LifecycleEvent {
    LifecycleEvent::new(action, target_type, target_id, epoch_secs())
}

async fn run_writer(
    store: StateStore,
    mut rx: mpsc::Receiver<LifecycleEvent>,
    mut close_rx: watch::Receiver<bool>,
    settings: EventSettings,
) {
    let mut batch: Vec<LifecycleEvent> = Vec::with_capacity(settings.batch_size);
    let mut ticker = tokio::time::interval(settings.flush_every);
    ticker.tick().await;

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(event) => {
                    batch.push(event);
                    if batch.len() >= settings.batch_size {
                        flush(&store, &mut batch);
                    }
                }
                None => break,
            },
            _ = ticker.tick() => flush(&store, &mut batch),
            _ = async { let _ = close_rx.wait_for(|closed| *closed).await; } => {
                rx.close();
                while let Some(event) = rx.recv().await {
                    batch.push(event);
                }
                break;
            }
        }
    }
    flush(&store, &mut batch);
    debug!("event writer stopped");
}

fn flush(store: &StateStore, batch: &mut Vec<LifecycleEvent>) {
    if batch.is_empty() {
        return;
    }
    if let Err(e) = store.append_events(batch) {
        warn!(count = batch.len(), error = %e, "failed to flush events");
    }
    batch.clear();
}
