use crate::api::response::{ApiError, ApiResponse};
use crate::api::state::AppState;
use axum::{
    Json,
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use flowgate_core::FlowError;
use tracing::debug;

/// Lifetime of the stream cookie; long enough to cover one full stream
/// connection including the watchdog window.
const COOKIE_MAX_AGE_SECS: u64 = 900;

pub async fn auth_middleware(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let path = req.uri().path();
    if !path.starts_with("/api") {
        return next.run(req).await;
    }
    if state.gate.is_open() {
        return next.run(req).await;
    }

    let Some(token) = extract_token(req.headers(), &state.config.auth.cookie_name) else {
        return ApiError(FlowError::Authentication("no credential presented".into()))
            .into_response();
    };

    match state.gate.authenticate(&token) {
        Ok(principal) => {
            req.extensions_mut().insert(principal);
            next.run(req).await
        }
        Err(err) => ApiError(err).into_response(),
    }
}

/// Bearer header first; cookie fallback for EventSource connections, which
/// cannot set headers.
fn extract_token(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    if let Some(token) = extract_bearer(headers.get(header::AUTHORIZATION)) {
        return Some(token);
    }
    extract_cookie(headers, cookie_name)
}

fn extract_bearer(header: Option<&HeaderValue>) -> Option<String> {
    let value = header?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    for value in headers.get_all(header::COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for pair in raw.split(';') {
            let Some((key, token)) = pair.trim().split_once('=') else {
                continue;
            };
            if key == name && !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    None
}

// POST /api/auth/cookie
pub async fn issue_cookie(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(token) = extract_bearer(headers.get(header::AUTHORIZATION)) else {
        return ApiError(FlowError::Authentication("bearer token required".into()))
            .into_response();
    };
    if !state.gate.is_open() {
        if let Err(err) = state.gate.authenticate(&token) {
            return ApiError(err).into_response();
        }
    }

    let cookie = format!(
        "{}={}; Path=/; HttpOnly; Secure; SameSite=Strict; Max-Age={}",
        state.config.auth.cookie_name, token, COOKIE_MAX_AGE_SECS
    );
    let Ok(value) = HeaderValue::from_str(&cookie) else {
        return ApiError(FlowError::Validation("token is not cookie-safe".into()))
            .into_response();
    };

    let mut response = Json(ApiResponse::message("Stream cookie issued")).into_response();
    response.headers_mut().insert(header::SET_COOKIE, value);
    debug!("stream cookie issued");
    response
}
