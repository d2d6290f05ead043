//! Routing state synchronization — bridges the lifecycle store to the
//! routing table.
//!
//! The table is a cache of persisted deployment state. `ProxySync`
//! rebuilds it wholesale from the store, once before the listener accepts
//! traffic and then on a fixed interval to repair drift left by a missed
//! incremental update. A rebuild that raced an incremental update is
//! retried against a fresh read rather than applied.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use stagehand_state::{StateError, StateStore};

use crate::router::RoutingTable;

/// Fresh reads attempted before a contended sync gives up until next tick.
const REBUILD_ATTEMPTS: usize = 3;

/// Sync statistics.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub deployments_seen: u32,
    pub routes_live: u32,
    pub has_main: bool,
    /// `false` when every attempt raced an incremental update.
    pub rebuilt: bool,
}

#[derive(Clone)]
pub struct ProxySync {
    table: RoutingTable,
    store: StateStore,
}

impl ProxySync {
    pub fn new(table: RoutingTable, store: StateStore) -> Self {
        Self { table, store }
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// Full rebuild from every persisted deployment.
    pub fn sync(&self) -> Result<SyncStats, StateError> {
        let mut seen = 0;
        let mut rebuilt = false;
        for _ in 0..REBUILD_ATTEMPTS {
            let observed = self.table.generation();
            let deployments = self.store.list_deployments()?;
            seen = deployments.len() as u32;
            if self.table.rebuild(&deployments, observed) {
                rebuilt = true;
                break;
            }
        }

        let snapshot = self.table.snapshot();
        let stats = SyncStats {
            deployments_seen: seen,
            routes_live: snapshot.stages.len() as u32,
            has_main: snapshot.main.is_some(),
            rebuilt,
        };
        if !rebuilt {
            warn!(attempts = REBUILD_ATTEMPTS, "routing sync kept racing live updates, skipped");
        }
        debug!(
            deployments = stats.deployments_seen,
            live = stats.routes_live,
            main = stats.has_main,
            rebuilt,
            "routing sync complete"
        );
        Ok(stats)
    }

    /// Rebuild every `interval` until `shutdown` flips.
    pub async fn run_reconcile(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "routing reconciliation started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sync() {
                        warn!(error = %e, "routing reconciliation failed");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("routing reconciliation shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_state::{Deployment, DeploymentStatus};

    fn dep(id: &str, port: u16, status: DeploymentStatus, main: bool) -> Deployment {
        Deployment {
            id: id.to_string(),
            stage_id: id.to_string(),
            version: "v1".to_string(),
            env_tag: "prod".to_string(),
            port: Some(port),
            status,
            log_path: String::new(),
            created_at: 1,
            promoted_at: main.then_some(1),
        }
    }

    fn setup() -> (ProxySync, StateStore) {
        let store = StateStore::open_in_memory().unwrap();
        let sync = ProxySync::new(RoutingTable::new(["stagehand"]), store.clone());
        (sync, store)
    }

    #[test]
    fn sync_loads_ready_deployments_and_main() {
        let (sync, store) = setup();
        store.put_deployment(&dep("a", 20000, DeploymentStatus::Ready, true)).unwrap();
        store.put_deployment(&dep("b", 20001, DeploymentStatus::Provisioning, false)).unwrap();

        let stats = sync.sync().unwrap();
        assert_eq!(
            stats,
            SyncStats { deployments_seen: 2, routes_live: 1, has_main: true, rebuilt: true }
        );
        assert_eq!(sync.table().resolve("/anything").unwrap().port, 20000);
        assert!(!sync.table().is_live("b"));
    }

    #[test]
    fn sync_repairs_drift() {
        let (sync, store) = setup();
        // Table believes a deployment is live that the store says is stopped.
        sync.table().upsert(&dep("a", 20000, DeploymentStatus::Ready, false));
        store.put_deployment(&dep("a", 20000, DeploymentStatus::Stopped, false)).unwrap();

        sync.sync().unwrap();
        assert!(!sync.table().is_live("a"));
    }

    #[test]
    fn sync_keeps_updates_that_follow_the_store() {
        let (sync, store) = setup();
        store.put_deployment(&dep("a", 20000, DeploymentStatus::Ready, false)).unwrap();
        sync.sync().unwrap();

        // Deleting persists first, then removes the route; a sync in
        // between may briefly restore it, the removal still wins.
        store.delete_deployment("a").unwrap();
        let observed = sync.table().generation();
        let listing = vec![dep("a", 20000, DeploymentStatus::Ready, false)];
        sync.table().remove("a");
        assert!(!sync.table().rebuild(&listing, observed));
        assert!(!sync.table().is_live("a"));

        let stats = sync.sync().unwrap();
        assert!(stats.rebuilt);
        assert_eq!(stats.routes_live, 0);
    }

    #[tokio::test]
    async fn reconcile_loop_runs_and_stops() {
        let (sync, store) = setup();
        let table = sync.table().clone();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(sync.run_reconcile(Duration::from_millis(10), rx));

        store.put_deployment(&dep("late", 20005, DeploymentStatus::Ready, false)).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(table.is_live("late"));

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
