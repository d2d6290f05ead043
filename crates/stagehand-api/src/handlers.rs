//! REST API handlers.
//!
//! Each handler delegates to an orchestrator and wraps the result in
//! [`ApiResponse`](crate::ApiResponse). Lifecycle errors become status
//! codes through [`ApiError`].

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use stagehand_lifecycle::ErrorKind;
use stagehand_state::{Stage, Test};

use crate::ApiState;
use crate::response::{ApiError, ApiResult, created, ok};

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(req)| req)
        .map_err(|e| ApiError::invalid(e.body_text()))
}

fn no_content() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

/// Fallback for paths neither the API nor the routing table claims.
pub async fn not_found(uri: Uri) -> ApiError {
    ApiError {
        status: StatusCode::NOT_FOUND,
        kind: ErrorKind::NotFound,
        message: format!("no route for {}", uri.path()),
    }
}

// ── Releases ───────────────────────────────────────────────────

/// GET /{prefix}/releases
pub async fn list_releases(State(state): State<ApiState>) -> ApiResult {
    Ok(ok(state.releases.list_releases()?))
}

/// POST /{prefix}/releases/sync
pub async fn sync_releases(State(state): State<ApiState>) -> ApiResult {
    Ok(ok(state.releases.sync_releases().await?))
}

// ── Env ────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct EnvText {
    pub env_text: Option<String>,
}

/// GET /{prefix}/env/template
pub async fn get_env_template(State(state): State<ApiState>) -> ApiResult {
    let text = state.stages.get_env_template().await?;
    Ok(ok(EnvText { env_text: Some(text) }))
}

/// PUT /{prefix}/env/template
pub async fn update_env_template(
    State(state): State<ApiState>,
    payload: Result<Json<EnvText>, JsonRejection>,
) -> ApiResult {
    let text = body(payload)?
        .env_text
        .ok_or_else(|| ApiError::invalid("env_text is required"))?;
    state.stages.update_env_template(&text).await?;
    Ok(ok(EnvText { env_text: Some(text) }))
}

// ── Stages ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateStageRequest {
    pub release_id: String,
    pub env_tag: String,
    /// Written straight away when present, moving the stage to `active`.
    #[serde(default)]
    pub env_text: Option<String>,
}

/// A stage together with its current env file.
#[derive(Debug, Serialize)]
pub struct StageView {
    #[serde(flatten)]
    pub stage: Stage,
    pub env_text: String,
}

/// POST /{prefix}/stages
pub async fn create_stage(
    State(state): State<ApiState>,
    payload: Result<Json<CreateStageRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    let mut stage = state
        .stages
        .prepare_stage(&req.release_id, &req.env_tag)
        .await?;

    let env_text = match req.env_text.filter(|t| !t.trim().is_empty()) {
        Some(text) => {
            stage = state.stages.update_stage_env(&stage.id, &text).await?;
            text
        }
        None => state.stages.get_stage_env(&stage.id).await?,
    };
    Ok(created(StageView { stage, env_text }))
}

/// GET /{prefix}/stages
pub async fn list_stages(State(state): State<ApiState>) -> ApiResult {
    Ok(ok(state.stages.list_stages()?))
}

/// GET /{prefix}/stages/{stage_id}
pub async fn get_stage(State(state): State<ApiState>, Path(stage_id): Path<String>) -> ApiResult {
    let stage = state.stages.get_stage(&stage_id)?;
    let env_text = state.stages.get_stage_env(&stage_id).await?;
    Ok(ok(StageView { stage, env_text }))
}

/// DELETE /{prefix}/stages/{stage_id}
pub async fn delete_stage(
    State(state): State<ApiState>,
    Path(stage_id): Path<String>,
) -> ApiResult {
    state.stages.delete_stage(&stage_id).await?;
    Ok(no_content())
}

/// GET /{prefix}/stages/{stage_id}/env
pub async fn get_stage_env(
    State(state): State<ApiState>,
    Path(stage_id): Path<String>,
) -> ApiResult {
    let text = state.stages.get_stage_env(&stage_id).await?;
    Ok(ok(EnvText { env_text: Some(text) }))
}

/// PUT /{prefix}/stages/{stage_id}/env
pub async fn update_stage_env(
    State(state): State<ApiState>,
    Path(stage_id): Path<String>,
    payload: Result<Json<EnvText>, JsonRejection>,
) -> ApiResult {
    let env_text = body(payload)?
        .env_text
        .ok_or_else(|| ApiError::invalid("env_text is required"))?;
    let stage = state.stages.update_stage_env(&stage_id, &env_text).await?;
    Ok(ok(StageView { stage, env_text }))
}

// ── Tests ──────────────────────────────────────────────────────

/// GET /{prefix}/stages/{stage_id}/tests
pub async fn list_tests(State(state): State<ApiState>, Path(stage_id): Path<String>) -> ApiResult {
    Ok(ok(state.stages.list_tests(&stage_id)?))
}

/// POST /{prefix}/stages/{stage_id}/tests
pub async fn start_test(State(state): State<ApiState>, Path(stage_id): Path<String>) -> ApiResult {
    Ok(created(state.stages.start_test(&stage_id).await?))
}

/// Test ids are `<stage>-test-<sequence>`; sequences start at 1.
pub(crate) fn test_id(stage_id: &str, sequence: &str) -> Result<String, ApiError> {
    match sequence.parse::<u32>() {
        Ok(n) if n > 0 => Ok(Test::key(stage_id, n)),
        _ => Err(ApiError::invalid(format!("invalid test sequence {sequence:?}"))),
    }
}

/// POST /{prefix}/stages/{stage_id}/tests/{sequence}/cancel
pub async fn cancel_test(
    State(state): State<ApiState>,
    Path((stage_id, sequence)): Path<(String, String)>,
) -> ApiResult {
    let test_id = test_id(&stage_id, &sequence)?;
    Ok(ok(state.stages.cancel_test(&stage_id, &test_id).await?))
}

// ── Deployments ────────────────────────────────────────────────

/// GET /{prefix}/deployments
pub async fn list_deployments(State(state): State<ApiState>) -> ApiResult {
    Ok(ok(state.deployments.list()?))
}

/// POST /{prefix}/deployments/{id}
///
/// `id` names the stage. 201 when a deployment was created, 200 when an
/// existing one is being provisioned again.
pub async fn create_deployment(
    State(state): State<ApiState>,
    Path(stage_id): Path<String>,
) -> ApiResult {
    let (dep, was_created) = state.deployments.create_deployment(&stage_id).await?;
    if was_created {
        Ok(created(dep))
    } else {
        Ok(ok(dep))
    }
}

/// GET /{prefix}/deployments/{id}
pub async fn get_deployment(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult {
    Ok(ok(state.deployments.get(&id)?))
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteParams {
    #[serde(default)]
    pub force: bool,
}

/// DELETE /{prefix}/deployments/{id}?force=true
pub async fn delete_deployment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(params): Query<DeleteParams>,
) -> ApiResult {
    state.deployments.delete(&id, params.force).await?;
    Ok(no_content())
}

/// POST /{prefix}/deployments/{id}/promote
pub async fn promote_deployment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult {
    Ok(ok(state.deployments.set_main(&id)?))
}

/// POST /{prefix}/deployments/{id}/shutdown
pub async fn shutdown_deployment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult {
    Ok(ok(state.deployments.shutdown(&id).await?))
}

/// POST /{prefix}/deployments/{id}/start
pub async fn start_deployment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult {
    Ok(ok(state.deployments.start(&id).await?))
}

// ── Main route ─────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct MainRoute {
    pub deployment_id: String,
}

/// GET /{prefix}/routes/main
pub async fn get_main_route(State(state): State<ApiState>) -> Response {
    let deployment_id = state
        .deployments
        .routes()
        .main()
        .unwrap_or_else(|| "none".to_string());
    ok(MainRoute { deployment_id })
}

/// PUT /{prefix}/routes/main
pub async fn set_main_route(
    State(state): State<ApiState>,
    payload: Result<Json<MainRoute>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    let id = req.deployment_id.trim();
    if id.is_empty() {
        return Err(ApiError::invalid("deployment_id is required"));
    }
    let dep = state.deployments.set_main(id)?;
    Ok(ok(MainRoute {
        deployment_id: dep.id,
    }))
}
