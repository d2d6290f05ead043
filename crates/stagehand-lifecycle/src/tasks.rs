//! Background job tracking.
//!
//! Every test run and provisioning job gets a slot keyed by its record id,
//! holding the job's cancel signal. The job runs under a supervising task
//! that converts a panic into a callback (so the owning record can be moved
//! to a terminal status) and frees the slot when the job ends.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, warn};

struct TaskSlot {
    handle: JoinHandle<()>,
    cancel_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    generation: u64,
}

#[derive(Clone, Default)]
pub struct TaskSlots {
    slots: Arc<RwLock<HashMap<String, TaskSlot>>>,
    generation: Arc<AtomicU64>,
}

impl TaskSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch `job` under `id`. Returns `false` without spawning if a job
    /// with the same id is still running.
    pub async fn spawn<J, Fut, P, PFut>(&self, id: &str, job: J, on_panic: P) -> bool
    where
        J: FnOnce(watch::Receiver<bool>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        P: FnOnce(String) -> PFut + Send + 'static,
        PFut: Future<Output = ()> + Send + 'static,
    {
        let mut slots = self.slots.write().await;
        if slots.contains_key(id) {
            return false;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        let inner = tokio::spawn(job(cancel_rx));

        let registry = self.slots.clone();
        let key = id.to_string();
        let handle = tokio::spawn(async move {
            if let Err(e) = inner.await {
                if e.is_panic() {
                    let message = panic_message(e);
                    error!(job = %key, %message, "background job panicked");
                    on_panic(message).await;
                } else {
                    debug!(job = %key, "background job aborted");
                }
            }
            let mut slots = registry.write().await;
            if slots.get(&key).is_some_and(|s| s.generation == generation) {
                slots.remove(&key);
            }
            drop(slots);
            let _ = done_tx.send(true);
        });

        slots.insert(
            id.to_string(),
            TaskSlot {
                handle,
                cancel_tx,
                done_rx,
                generation,
            },
        );
        debug!(job = %id, "background job started");
        true
    }

    /// Signal the job to stop. Returns `false` if no job is running.
    pub async fn cancel(&self, id: &str) -> bool {
        let slots = self.slots.read().await;
        match slots.get(id) {
            Some(slot) => {
                let _ = slot.cancel_tx.send(true);
                debug!(job = %id, "cancel requested");
                true
            }
            None => false,
        }
    }

    /// Signal the job to stop and wait up to `grace` for it to end. Returns
    /// `false` if the job is still running when `grace` runs out; a missing
    /// job counts as stopped.
    pub async fn cancel_and_wait(&self, id: &str, grace: Duration) -> bool {
        let mut done_rx = {
            let slots = self.slots.read().await;
            let Some(slot) = slots.get(id) else {
                return true;
            };
            let _ = slot.cancel_tx.send(true);
            slot.done_rx.clone()
        };
        debug!(job = %id, "cancel requested, waiting for job to end");
        match tokio::time::timeout(grace, done_rx.wait_for(|done| *done)).await {
            Ok(_) => true,
            Err(_) => {
                warn!(job = %id, "job did not stop within grace period");
                false
            }
        }
    }

    pub async fn is_running(&self, id: &str) -> bool {
        self.slots.read().await.contains_key(id)
    }

    pub async fn running(&self) -> Vec<String> {
        self.slots.read().await.keys().cloned().collect()
    }

    /// Cancel every job and wait up to `grace` for each to wind down.
    pub async fn cancel_all(&self, grace: Duration) {
        let drained: Vec<(String, TaskSlot)> = self.slots.write().await.drain().collect();
        for (_, slot) in &drained {
            let _ = slot.cancel_tx.send(true);
        }
        for (id, slot) in drained {
            if tokio::time::timeout(grace, slot.handle).await.is_err() {
                warn!(job = %id, "job did not stop within grace period");
            }
        }
    }
}

/// Resolves once `rx` has been set to `true`. A dropped sender never
/// resolves.
pub async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn panic_message(err: JoinError) -> String {
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "job panicked".to_string()
    }
}
