//! The routing table.
//!
//! Maps the first path segment (a stage id) to that stage's live
//! deployment. Only `ready` deployments with a port are ever stored, so a
//! lookup hit is always routable. One deployment may additionally be the
//! main deployment, which receives every request no stage claims.
//!
//! All access goes through a single `RwLock`: mutations take the write
//! side, lookups the read side. Every incremental update bumps a
//! generation counter; a full rebuild built from an older store read is
//! discarded if the counter has moved since.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::debug;

use stagehand_state::Deployment;

/// Where a request should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub deployment_id: String,
    pub port: u16,
    /// Path to send upstream (stage prefix stripped for stage routes).
    pub path: String,
}

/// One live route, for operational visibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteEntry {
    pub stage_id: String,
    pub deployment_id: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutingSnapshot {
    pub main: Option<RouteEntry>,
    pub stages: Vec<RouteEntry>,
}

#[derive(Default)]
struct Routes {
    /// stage id → live deployment.
    by_stage: HashMap<String, Deployment>,
    /// deployment id → stage id, for removal by deployment id.
    stage_of: HashMap<String, String>,
    main_id: Option<String>,
    /// Bumped by every `upsert` and `remove`.
    generation: u64,
}

impl Routes {
    fn insert(&mut self, dep: &Deployment) {
        self.stage_of.insert(dep.id.clone(), dep.stage_id.clone());
        self.by_stage.insert(dep.stage_id.clone(), dep.clone());
    }

    fn remove_stage(&mut self, stage_id: &str) {
        if let Some(old) = self.by_stage.remove(stage_id) {
            self.stage_of.remove(&old.id);
        }
    }

    fn main(&self) -> Option<&Deployment> {
        let id = self.main_id.as_deref()?;
        let stage = self.stage_of.get(id)?;
        self.by_stage.get(stage)
    }

    fn entry(dep: &Deployment) -> Option<RouteEntry> {
        Some(RouteEntry {
            stage_id: dep.stage_id.clone(),
            deployment_id: dep.id.clone(),
            port: dep.port?,
        })
    }
}

impl fmt::Display for Routes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.main() {
            Some(dep) => write!(f, "main={}:{}", dep.id, dep.port.unwrap_or_default())?,
            None => write!(f, "main=none")?,
        }
        let mut stages: Vec<_> = self.by_stage.values().collect();
        stages.sort_by(|a, b| a.stage_id.cmp(&b.stage_id));
        for dep in stages {
            write!(f, " /{}->{}", dep.stage_id, dep.port.unwrap_or_default())?;
        }
        Ok(())
    }
}

/// Shared handle to the routing table. Cloning shares the same table.
#[derive(Clone)]
pub struct RoutingTable {
    routes: Arc<RwLock<Routes>>,
    /// First segments that always belong to the API layer.
    reserved: Arc<Vec<String>>,
}

impl RoutingTable {
    /// `reserved` lists first path segments that are never forwarded
    /// (the management API prefix, the websocket prefix).
    pub fn new<I, S>(reserved: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            routes: Arc::new(RwLock::new(Routes::default())),
            reserved: Arc::new(reserved.into_iter().map(Into::into).collect()),
        }
    }

    /// Apply a deployment's current state.
    ///
    /// A ready deployment with a port is (re)inserted under its stage,
    /// anything else removes the stage's entry. A set `promoted_at` makes it
    /// main; a cleared one stops it being main if it was.
    pub fn upsert(&self, dep: &Deployment) {
        let mut routes = self.routes.write().expect("routes lock");
        if dep.is_ready() && dep.port.is_some() {
            routes.insert(dep);
        } else {
            routes.remove_stage(&dep.stage_id);
        }

        if dep.promoted_at.is_some() {
            routes.main_id = Some(dep.id.clone());
        } else if routes.main_id.as_deref() == Some(dep.id.as_str()) {
            routes.main_id = None;
        }
        routes.generation += 1;
        debug!(deployment_id = %dep.id, status = %dep.status, routes = %routes, "routing table updated");
    }

    /// Drop a deployment by id, clearing main if it was main.
    pub fn remove(&self, deployment_id: &str) {
        let mut routes = self.routes.write().expect("routes lock");
        if let Some(stage) = routes.stage_of.get(deployment_id).cloned() {
            routes.remove_stage(&stage);
        }
        if routes.main_id.as_deref() == Some(deployment_id) {
            routes.main_id = None;
        }
        routes.generation += 1;
        debug!(%deployment_id, routes = %routes, "routing table entry removed");
    }

    /// Current update generation. Read it before listing deployments and
    /// hand it to [`rebuild`](RoutingTable::rebuild).
    pub fn generation(&self) -> u64 {
        self.routes.read().expect("routes lock").generation
    }

    /// Replace the whole table from a full list of persisted deployments
    /// read while the table was at `observed` generation.
    ///
    /// Returns `false` and leaves the table alone if an incremental update
    /// landed after `observed`: the list may predate it.
    pub fn rebuild(&self, deployments: &[Deployment], observed: u64) -> bool {
        let mut fresh = Routes::default();
        for dep in deployments {
            if dep.is_ready() && dep.port.is_some() {
                fresh.insert(dep);
            }
            if dep.promoted_at.is_some() {
                fresh.main_id = Some(dep.id.clone());
            }
        }
        let mut routes = self.routes.write().expect("routes lock");
        if routes.generation != observed {
            debug!(observed, current = routes.generation, "stale rebuild discarded");
            return false;
        }
        fresh.generation = routes.generation;
        *routes = fresh;
        debug!(routes = %routes, "routing table rebuilt");
        true
    }

    /// Resolve a request path.
    ///
    /// `/stage/rest` hits a live stage entry and goes to `/rest` on its
    /// port (`/stage` and `/stage/` both map to `/`). Otherwise the main
    /// deployment, if live, receives the full path. Reserved segments and
    /// unmatched paths resolve to `None`.
    pub fn resolve(&self, path: &str) -> Option<RouteTarget> {
        let trimmed = path.trim_start_matches('/');
        let segment = trimmed.split('/').next().unwrap_or_default();
        if self.reserved.iter().any(|r| r == segment) {
            return None;
        }

        let routes = self.routes.read().expect("routes lock");
        if !segment.is_empty() {
            if let Some(dep) = routes.by_stage.get(segment) {
                let rest = &trimmed[segment.len()..];
                let path = if rest.is_empty() { "/" } else { rest };
                return Some(RouteTarget {
                    deployment_id: dep.id.clone(),
                    port: dep.port?,
                    path: path.to_string(),
                });
            }
        }

        let main = routes.main()?;
        Some(RouteTarget {
            deployment_id: main.id.clone(),
            port: main.port?,
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
        })
    }

    /// The main deployment id, if it is live.
    pub fn main(&self) -> Option<String> {
        let routes = self.routes.read().expect("routes lock");
        routes.main().map(|d| d.id.clone())
    }

    pub fn is_live(&self, stage_id: &str) -> bool {
        let routes = self.routes.read().expect("routes lock");
        routes.by_stage.contains_key(stage_id)
    }

    pub fn snapshot(&self) -> RoutingSnapshot {
        let routes = self.routes.read().expect("routes lock");
        let mut stages: Vec<RouteEntry> =
            routes.by_stage.values().filter_map(Routes::entry).collect();
        stages.sort_by(|a, b| a.stage_id.cmp(&b.stage_id));
        RoutingSnapshot {
            main: routes.main().and_then(Routes::entry),
            stages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_state::DeploymentStatus;

    fn dep(id: &str, port: u16, status: DeploymentStatus, main: bool) -> Deployment {
        Deployment {
            id: id.to_string(),
            stage_id: id.to_string(),
            version: "v1.0.0".to_string(),
            env_tag: "prod".to_string(),
            port: Some(port),
            status,
            log_path: String::new(),
            created_at: 1,
            promoted_at: main.then_some(5),
        }
    }

    fn table() -> RoutingTable {
        RoutingTable::new(["stagehand", "ws"])
    }

    #[test]
    fn stage_prefix_is_stripped() {
        let t = table();
        t.upsert(&dep("v1-prod", 20000, DeploymentStatus::Ready, false));

        let hit = t.resolve("/v1-prod/api/users").unwrap();
        assert_eq!(hit.port, 20000);
        assert_eq!(hit.path, "/api/users");
        assert_eq!(t.resolve("/v1-prod").unwrap().path, "/");
        assert_eq!(t.resolve("/v1-prod/").unwrap().path, "/");
    }

    #[test]
    fn non_ready_is_never_routable() {
        let t = table();
        for status in [
            DeploymentStatus::Staged,
            DeploymentStatus::Provisioning,
            DeploymentStatus::BuildFailed,
            DeploymentStatus::ProvisionFailed,
            DeploymentStatus::Stopped,
        ] {
            t.upsert(&dep("s", 20000, status, false));
            assert!(t.resolve("/s/x").is_none(), "{status} should not route");
        }
        t.upsert(&dep("s", 20000, DeploymentStatus::Ready, false));
        assert!(t.resolve("/s/x").is_some());
        t.upsert(&dep("s", 20000, DeploymentStatus::Stopped, false));
        assert!(t.resolve("/s/x").is_none());
    }

    #[test]
    fn main_receives_unmatched_paths_unchanged() {
        let t = table();
        t.upsert(&dep("a", 20000, DeploymentStatus::Ready, true));
        t.upsert(&dep("b", 20001, DeploymentStatus::Ready, false));

        let hit = t.resolve("/login").unwrap();
        assert_eq!((hit.port, hit.path.as_str()), (20000, "/login"));
        assert_eq!(t.resolve("/").unwrap().path, "/");
        assert_eq!(t.resolve("/b/login").unwrap().port, 20001);
    }

    #[test]
    fn reserved_segments_fall_through() {
        let t = table();
        t.upsert(&dep("a", 20000, DeploymentStatus::Ready, true));
        assert!(t.resolve("/stagehand/meta/ping").is_none());
        assert!(t.resolve("/ws/tests/x").is_none());
    }

    #[test]
    fn nothing_routes_on_empty_table() {
        assert!(table().resolve("/anything").is_none());
    }

    #[test]
    fn clearing_promoted_at_clears_main() {
        let t = table();
        t.upsert(&dep("a", 20000, DeploymentStatus::Ready, true));
        assert_eq!(t.main().as_deref(), Some("a"));
        t.upsert(&dep("a", 20000, DeploymentStatus::Ready, false));
        assert!(t.main().is_none());
        assert!(t.resolve("/x").is_none());
    }

    #[test]
    fn other_deployment_losing_promotion_keeps_current_main() {
        let t = table();
        t.upsert(&dep("a", 20000, DeploymentStatus::Ready, true));
        t.upsert(&dep("b", 20001, DeploymentStatus::Ready, false));
        assert_eq!(t.main().as_deref(), Some("a"));
    }

    #[test]
    fn remove_by_id_clears_main() {
        let t = table();
        t.upsert(&dep("a", 20000, DeploymentStatus::Ready, true));
        t.remove("a");
        assert!(t.resolve("/a/x").is_none());
        assert!(t.main().is_none());
        // Unknown id is a no-op.
        t.remove("zzz");
    }

    #[test]
    fn main_that_is_not_ready_does_not_route() {
        let t = table();
        t.upsert(&dep("a", 20000, DeploymentStatus::Stopped, true));
        assert!(t.main().is_none());
        assert!(t.resolve("/x").is_none());
        // Becoming ready again while still promoted restores it.
        t.upsert(&dep("a", 20000, DeploymentStatus::Ready, true));
        assert_eq!(t.resolve("/x").unwrap().port, 20000);
    }

    #[test]
    fn rebuild_replaces_everything() {
        let t = table();
        t.upsert(&dep("stale", 20009, DeploymentStatus::Ready, false));
        let observed = t.generation();
        assert!(t.rebuild(
            &[
                dep("a", 20000, DeploymentStatus::Ready, false),
                dep("b", 20001, DeploymentStatus::Ready, true),
                dep("c", 20002, DeploymentStatus::Stopped, false),
            ],
            observed,
        ));

        let snap = t.snapshot();
        assert_eq!(snap.main.unwrap().deployment_id, "b");
        let ids: Vec<_> = snap.stages.iter().map(|e| e.stage_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(!t.is_live("stale"));
    }

    #[test]
    fn rebuild_from_older_read_loses_to_incremental_updates() {
        let t = table();
        t.upsert(&dep("gone", 20001, DeploymentStatus::Ready, false));

        // A full listing taken before "fresh" became ready and "gone" was
        // deleted must not undo either change.
        let observed = t.generation();
        let listing = vec![dep("gone", 20001, DeploymentStatus::Ready, false)];
        t.upsert(&dep("fresh", 20000, DeploymentStatus::Ready, false));
        t.remove("gone");

        assert!(!t.rebuild(&listing, observed));
        assert!(t.is_live("fresh"));
        assert!(!t.is_live("gone"));

        let current = t.generation();
        assert!(t.rebuild(&[dep("fresh", 20000, DeploymentStatus::Ready, false)], current));
        assert_eq!(t.generation(), current);
    }

    #[test]
    fn concurrent_readers_and_writers() {
        let t = table();
        let writers: Vec<_> = (0..4u16)
            .map(|i| {
                let t = t.clone();
                std::thread::spawn(move || {
                    for n in 0..100u16 {
                        let status = if n % 2 == 0 {
                            DeploymentStatus::Ready
                        } else {
                            DeploymentStatus::Stopped
                        };
                        t.upsert(&dep(&format!("s{i}"), 20000 + i, status, false));
                    }
                })
            })
            .collect();
        let reader = {
            let t = t.clone();
            std::thread::spawn(move || {
                for _ in 0..400 {
                    if let Some(hit) = t.resolve("/s1/x") {
                        assert_eq!(hit.port, 20001);
                    }
                }
            })
        };
        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();
        // Last write for every stage was Stopped.
        assert!(t.snapshot().stages.is_empty());
    }
}
