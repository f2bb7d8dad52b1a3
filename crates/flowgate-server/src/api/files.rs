//! File transfer endpoints: on-demand polling and raw downloads.

use crate::api::response::{ApiError, ApiResponse};
use crate::api::state::AppState;
use axum::Json;
use axum::extract::{Query, State};
use axum::http::{HeaderValue, header};
use axum::response::{IntoResponse, Response};
use flowgate_core::models::FileReport;
use flowgate_core::{FlowError, mime};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadQuery {
    pub session_id: String,
    pub file_name: String,
    /// "true" forces an attachment disposition; anything else serves inline.
    #[serde(default)]
    pub download: Option<String>,
}

// GET /api/agent/files - One poll pass over the sandbox output directory
pub async fn poll_files(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<ApiResponse<FileReport>>, ApiError> {
    let (session_id, expected) = parse_files_query(&params)?;
    let hint = if expected.is_empty() {
        None
    } else {
        Some(expected.as_slice())
    };
    let report = state.core.sessions.get_files(&session_id, hint).await?;
    Ok(Json(ApiResponse::ok(report)))
}

/// `expectedFiles` arrives either repeated or comma-separated; both forms
/// collapse into one list.
fn parse_files_query(params: &[(String, String)]) -> Result<(String, Vec<String>), FlowError> {
    let mut session_id = None;
    let mut expected = Vec::new();
    for (key, value) in params {
        match key.as_str() {
            "sessionId" => session_id = Some(value.clone()),
            "expectedFiles" => expected.extend(
                value
                    .split(',')
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty()),
            ),
            _ => {}
        }
    }
    let session_id =
        session_id.ok_or_else(|| FlowError::Validation("sessionId is required".into()))?;
    Ok((session_id, expected))
}

// GET /api/agent/download - Raw file bytes with browser-friendly headers
pub async fn download_file(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let record = state
        .core
        .sessions
        .download(&query.session_id, &query.file_name)
        .await?;

    let kind = if query.download.as_deref() == Some("true") {
        "attachment"
    } else {
        "inline"
    };
    let disposition = format!("{}; filename=\"{}\"", kind, record.name);
    let content_type = mime::content_type(&record.name);

    let mut response = record.content.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("private, max-age=3600"),
    );
    Ok(response)
}
