//! Run control endpoints: status polling, stopping, and sandbox teardown.

use crate::api::response::{ApiError, ApiResponse};
use crate::api::state::AppState;
use axum::Json;
use axum::extract::{Query, State};
use flowgate_core::backend::RunState;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionQuery {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunQuery {
    pub run_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopRunRequest {
    pub run_id: String,
    #[serde(default)]
    pub sandbox_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteSandboxRequest {
    pub run_id: String,
    pub sandbox_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnsureActiveRequest {
    pub unit_id: String,
}

// GET /api/agent/runs - Status of the run driving the current phase
pub async fn current_run(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<ApiResponse<RunState>>, ApiError> {
    let run = state
        .core
        .sessions
        .current_run_status(&query.session_id)
        .await?;
    Ok(Json(ApiResponse::ok(run)))
}

// GET /api/agent/run-status - Status of one run by id
pub async fn run_status(
    State(state): State<AppState>,
    Query(query): Query<RunQuery>,
) -> Result<Json<ApiResponse<RunState>>, ApiError> {
    let run = state.core.sessions.run_status(&query.run_id).await?;
    Ok(Json(ApiResponse::ok(run)))
}

// POST /api/agent/stop - Stop a run, optionally with its sandbox
pub async fn stop_run(
    State(state): State<AppState>,
    Json(payload): Json<StopRunRequest>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    state
        .core
        .sessions
        .stop_run(&payload.run_id, payload.sandbox_id.as_deref())
        .await?;
    Ok(Json(ApiResponse::message("Run stopped")))
}

// DELETE /api/agent/sandbox - Tear the sandbox down for good
pub async fn delete_sandbox(
    State(state): State<AppState>,
    Json(payload): Json<DeleteSandboxRequest>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    state
        .core
        .sessions
        .stop_and_delete(&payload.run_id, &payload.sandbox_id)
        .await?;
    Ok(Json(ApiResponse::message("Sandbox deleted")))
}

// POST /api/agent/ensure-active - Wake the unit's sandbox before streaming
pub async fn ensure_active(
    State(state): State<AppState>,
    Json(payload): Json<EnsureActiveRequest>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    state.core.sessions.ensure_active(&payload.unit_id).await?;
    Ok(Json(ApiResponse::message("Sandbox active")))
}
