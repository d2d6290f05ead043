//! stagehand-api — the HTTP surface of one orchestrator instance.
//!
//! Everything lives under a single reserved path segment (`/stagehand` by
//! default). Any other path goes through the routing table first and is
//! forwarded to a deployment when a route matches.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/{prefix}/meta/ping` | `PONG`, or 503 while draining |
//! | GET | `/{prefix}/meta/version` | Running version, plain text `vX.Y.Z` |
//! | GET, POST | `/{prefix}/meta/drain` | Read or set the drain flag |
//! | GET | `/{prefix}/routing` | Routing table snapshot |
//! | GET | `/{prefix}/releases` | List releases |
//! | POST | `/{prefix}/releases/sync` | Import new remote tags |
//! | GET, PUT | `/{prefix}/env/template` | Env template for new stages |
//! | GET, POST | `/{prefix}/stages` | List or prepare stages |
//! | GET, DELETE | `/{prefix}/stages/{stage_id}` | Get or delete a stage |
//! | GET, PUT | `/{prefix}/stages/{stage_id}/env` | Stage env file |
//! | GET, POST | `/{prefix}/stages/{stage_id}/tests` | List or start tests |
//! | POST | `/{prefix}/stages/{stage_id}/tests/{sequence}/cancel` | Cancel a test |
//! | GET | `/{prefix}/deployments` | List deployments |
//! | POST | `/{prefix}/deployments/{id}` | Deploy the stage `id` |
//! | GET, DELETE | `/{prefix}/deployments/{id}` | Get or delete (`?force=true`) |
//! | POST | `/{prefix}/deployments/{id}/promote` | Make main |
//! | POST | `/{prefix}/deployments/{id}/shutdown` | Stop the backend |
//! | POST | `/{prefix}/deployments/{id}/start` | Restart a stopped backend |
//! | GET, PUT | `/{prefix}/routes/main` | Main deployment |
//! | GET | `/{prefix}/ws/stages/{stage_id}/tests/{sequence}` | Test log stream |
//! | GET | `/{prefix}/ws/deployments/{id}/logs` | Provisioning log stream |

pub mod handlers;
pub mod meta;
pub mod response;
pub mod ws;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};

use stagehand_lifecycle::{DeploymentOrchestrator, ReleaseSync, StageOrchestrator};
use stagehand_proxy::{Forwarder, forward};
use stagehand_tail::TailConfig;

pub use response::{ApiError, ApiResponse, ApiResult};

/// Process-wide drain flag. While set, the ping endpoint reports 503 and
/// new log streams are refused.
#[derive(Debug, Clone, Default)]
pub struct DrainFlag(Arc<AtomicBool>);

impl DrainFlag {
    pub fn is_draining(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns the previous value.
    pub fn set(&self, enabled: bool) -> bool {
        self.0.swap(enabled, Ordering::SeqCst)
    }
}

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub stages: StageOrchestrator,
    pub deployments: DeploymentOrchestrator,
    pub releases: ReleaseSync,
    pub drain: DrainFlag,
    pub version: String,
    pub tail: TailConfig,
}

impl ApiState {
    pub fn new(
        stages: StageOrchestrator,
        deployments: DeploymentOrchestrator,
        releases: ReleaseSync,
        version: impl Into<String>,
    ) -> Self {
        Self {
            stages,
            deployments,
            releases,
            drain: DrainFlag::default(),
            version: version.into(),
            tail: TailConfig::default(),
        }
    }
}

/// Build the complete router: management API under `/{api_prefix}`, with
/// deployment forwarding in front of it.
pub fn build_router(state: ApiState, api_prefix: &str) -> Router {
    let forwarder = Forwarder::new(state.deployments.routes().clone());

    let api_routes = Router::new()
        .route("/meta/ping", get(meta::ping))
        .route("/meta/version", get(meta::version))
        .route("/meta/drain", get(meta::drain_status).post(meta::set_drain))
        .route("/routing", get(meta::routing_snapshot))
        .route("/releases", get(handlers::list_releases))
        .route("/releases/sync", post(handlers::sync_releases))
        .route(
            "/env/template",
            get(handlers::get_env_template).put(handlers::update_env_template),
        )
        .route("/stages", get(handlers::list_stages).post(handlers::create_stage))
        .route(
            "/stages/{stage_id}",
            get(handlers::get_stage).delete(handlers::delete_stage),
        )
        .route(
            "/stages/{stage_id}/env",
            get(handlers::get_stage_env).put(handlers::update_stage_env),
        )
        .route(
            "/stages/{stage_id}/tests",
            get(handlers::list_tests).post(handlers::start_test),
        )
        .route(
            "/stages/{stage_id}/tests/{sequence}/cancel",
            post(handlers::cancel_test),
        )
        .route("/deployments", get(handlers::list_deployments))
        .route(
            "/deployments/{id}",
            post(handlers::create_deployment)
                .get(handlers::get_deployment)
                .delete(handlers::delete_deployment),
        )
        .route("/deployments/{id}/promote", post(handlers::promote_deployment))
        .route("/deployments/{id}/shutdown", post(handlers::shutdown_deployment))
        .route("/deployments/{id}/start", post(handlers::start_deployment))
        .route(
            "/routes/main",
            get(handlers::get_main_route).put(handlers::set_main_route),
        )
        .route("/ws/stages/{stage_id}/tests/{sequence}", get(ws::stream_test_log))
        .route("/ws/deployments/{id}/logs", get(ws::stream_deployment_log))
        .with_state(state);

    Router::new()
        .nest(&format!("/{api_prefix}"), api_routes)
        .fallback(handlers::not_found)
        .layer(from_fn_with_state(forwarder, forward))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_flag_swaps() {
        let flag = DrainFlag::default();
        assert!(!flag.is_draining());
        assert!(!flag.set(true));
        assert!(flag.clone().is_draining());
        assert!(flag.set(false));
        assert!(!flag.is_draining());
    }
}
