//! Instance metadata: liveness, version, drain control, routing view.
//!
//! These answer the fronting proxy and the rollout controller, so ping and
//! version stay plain text and drain replies with a bare object.

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ApiState;
use crate::response::{ApiError, ApiResult, ok};

/// GET /{prefix}/meta/ping
pub async fn ping(State(state): State<ApiState>) -> Response {
    if state.drain.is_draining() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "Service is draining - please route to active instance",
        )
            .into_response();
    }
    "PONG".into_response()
}

/// GET /{prefix}/meta/version
///
/// Plain text, always `v`-prefixed.
pub async fn version(State(state): State<ApiState>) -> Response {
    version_text(&state.version).into_response()
}

fn version_text(version: &str) -> String {
    if version.starts_with('v') {
        version.to_string()
    } else {
        format!("v{version}")
    }
}

#[derive(Debug, Deserialize)]
pub struct DrainRequest {
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct DrainStatus {
    pub drain_mode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// GET /{prefix}/meta/drain
pub async fn drain_status(State(state): State<ApiState>) -> Json<DrainStatus> {
    Json(DrainStatus {
        drain_mode: state.drain.is_draining(),
        message: None,
    })
}

/// POST /{prefix}/meta/drain
pub async fn set_drain(
    State(state): State<ApiState>,
    body: Result<Json<DrainRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = body.map_err(|e| ApiError::invalid(e.body_text()))?;
    let previous = state.drain.set(req.enabled);
    if previous != req.enabled {
        info!(enabled = req.enabled, "drain mode changed");
    }
    let word = if req.enabled { "enabled" } else { "disabled" };
    Ok(Json(DrainStatus {
        drain_mode: req.enabled,
        message: Some(format!("Drain mode {word}")),
    })
    .into_response())
}

/// GET /{prefix}/routing
pub async fn routing_snapshot(State(state): State<ApiState>) -> Response {
    ok(state.deployments.routes().snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_v_prefixed_once() {
        assert_eq!(version_text("0.4.1"), "v0.4.1");
        assert_eq!(version_text("v0.4.1"), "v0.4.1");
    }
}
