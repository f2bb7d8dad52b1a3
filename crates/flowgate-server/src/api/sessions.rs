//! Session lifecycle endpoints.

use crate::api::response::{ApiError, ApiResponse};
use crate::api::state::AppState;
use axum::Json;
use axum::extract::{Query, State};
use flowgate_core::backend::StoredMessage;
use flowgate_core::models::{Session, SessionOverview, SessionStatus};
use flowgate_core::session::CloseOutcome;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    pub prompt: String,
    #[serde(default)]
    pub expected_files: Vec<String>,
    #[serde(default)]
    pub model_name: Option<String>,
}

/// Client-facing view of a session, returned wherever the whole session is
/// the payload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEnvelope {
    pub session_id: String,
    pub unit_id: String,
    pub sandbox_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub status: SessionStatus,
    pub current_phase: u32,
    pub expected_files: Vec<String>,
}

impl From<Session> for SessionEnvelope {
    fn from(session: Session) -> Self {
        Self {
            session_id: session.id,
            unit_id: session.unit_id,
            sandbox_id: session.sandbox.id,
            run_id: session.run_id,
            status: session.status,
            current_phase: session.current_phase,
            expected_files: session.expected_files,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPhaseRequest {
    pub session_id: String,
    pub prompt: String,
    #[serde(default)]
    pub expected_files: Vec<String>,
    #[serde(default)]
    pub model_name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPhaseResponse {
    pub session_id: String,
    pub phase_number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub expected_files: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub session_id: String,
    pub message: String,
    #[serde(default)]
    pub model_name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatAck {
    pub run_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseRequest {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionQuery {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesQuery {
    pub session_id: String,
    #[serde(default)]
    pub offset: u32,
    #[serde(default = "default_message_limit")]
    pub limit: u32,
}

fn default_message_limit() -> u32 {
    100
}

// POST /api/agent/initiate - Start a session and its first run
pub async fn initiate_session(
    State(state): State<AppState>,
    Json(payload): Json<InitiateRequest>,
) -> Result<Json<ApiResponse<SessionEnvelope>>, ApiError> {
    let session = state
        .core
        .sessions
        .initiate(
            &payload.prompt,
            &payload.expected_files,
            payload.model_name.as_deref(),
        )
        .await?;
    Ok(Json(ApiResponse::ok(session.into())))
}

// POST /api/agent/new-phase - Begin the next phase of an existing session
pub async fn start_new_phase(
    State(state): State<AppState>,
    Json(payload): Json<NewPhaseRequest>,
) -> Result<Json<ApiResponse<NewPhaseResponse>>, ApiError> {
    let session = state
        .core
        .sessions
        .new_phase(
            &payload.session_id,
            &payload.prompt,
            &payload.expected_files,
            payload.model_name.as_deref(),
        )
        .await?;
    Ok(Json(ApiResponse::ok(NewPhaseResponse {
        session_id: session.id,
        phase_number: session.current_phase,
        run_id: session.run_id,
        expected_files: session.expected_files,
    })))
}

// POST /api/agent/chat - Relay a chat message, answering with the run id
pub async fn relay_chat(
    State(state): State<AppState>,
    Json(payload): Json<ChatRequest>,
) -> Result<Json<ApiResponse<ChatAck>>, ApiError> {
    let run_id = state
        .core
        .sessions
        .send_chat(
            &payload.session_id,
            &payload.message,
            payload.model_name.as_deref(),
        )
        .await?;
    Ok(Json(ApiResponse::ok(ChatAck { run_id })))
}

// POST /api/agent/close - Close the session and report the final files
pub async fn close_session(
    State(state): State<AppState>,
    Json(payload): Json<CloseRequest>,
) -> Result<Json<ApiResponse<CloseOutcome>>, ApiError> {
    let outcome = state.core.sessions.close(&payload.session_id).await?;
    let message = outcome.description.clone();
    Ok(Json(ApiResponse::ok_with_message(outcome, message)))
}

// GET /api/agent/status - Session overview with the files summary
pub async fn session_status(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<ApiResponse<SessionOverview>>, ApiError> {
    let overview = state.core.sessions.status(&query.session_id).await?;
    Ok(Json(ApiResponse::ok(overview)))
}

// GET /api/agent/messages - Page through the session transcript
pub async fn list_messages(
    State(state): State<AppState>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<ApiResponse<Vec<StoredMessage>>>, ApiError> {
    let messages = state
        .core
        .sessions
        .messages(&query.session_id, query.offset, query.limit)
        .await?;
    Ok(Json(ApiResponse::ok(messages)))
}
