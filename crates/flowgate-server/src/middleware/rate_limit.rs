//! Per-principal request throttling.
//!
//! Sliding fixed-size window per key: a key's window restarts once it ages
//! out, and stale windows are swept on every pass so the map only holds
//! recently active callers. The limiter is best-effort and fail-open; a
//! clock running backwards admits rather than locks out.

use crate::api::response::ApiError;
use crate::api::state::AppState;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use flowgate_core::{FlowError, Principal};
use std::sync::Arc;
use tracing::warn;

const WINDOW_MS: i64 = 60_000;

#[derive(Clone, Copy)]
struct RateWindow {
    count: u64,
    started_at: i64,
}

/// Outcome of one admission check, also the source of the rate headers.
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Epoch millis when the caller's window restarts.
    pub reset_at: i64,
    pub retry_after_secs: i64,
}

#[derive(Clone)]
pub struct RateLimiter {
    limit: u64,
    windows: Arc<DashMap<String, RateWindow>>,
}

impl RateLimiter {
    pub fn new(limit_per_minute: Option<u64>) -> Option<Self> {
        limit_per_minute.map(|limit| Self {
            limit,
            windows: Arc::new(DashMap::new()),
        })
    }

    pub fn admit(&self, key: &str) -> RateDecision {
        self.admit_at(key, chrono::Utc::now().timestamp_millis())
    }

    fn admit_at(&self, key: &str, now: i64) -> RateDecision {
        // Stale windows cost memory, not correctness; sweep them every pass.
        self.windows
            .retain(|_, window| now - window.started_at < WINDOW_MS * 2);

        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert(RateWindow {
                count: 0,
                started_at: now,
            });

        let elapsed = now - entry.started_at;
        if elapsed >= WINDOW_MS || elapsed < 0 {
            entry.count = 0;
            entry.started_at = now;
        }

        let reset_at = entry.started_at + WINDOW_MS;
        if entry.count >= self.limit {
            let retry_after_secs = ((reset_at - now) / 1000).max(1);
            return RateDecision {
                allowed: false,
                limit: self.limit,
                remaining: 0,
                reset_at,
                retry_after_secs,
            };
        }

        entry.count += 1;
        RateDecision {
            allowed: true,
            limit: self.limit,
            remaining: self.limit - entry.count,
            reset_at,
            retry_after_secs: 0,
        }
    }
}

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let Some(limiter) = &state.limiter else {
        return next.run(req).await;
    };
    if !req.uri().path().starts_with("/api") {
        return next.run(req).await;
    }

    let key = req
        .extensions()
        .get::<Principal>()
        .map(|principal| principal.rate_key().to_string())
        .unwrap_or_else(|| "anonymous".to_string());

    let decision = limiter.admit(&key);
    if !decision.allowed {
        warn!(key = %key, retry_after = decision.retry_after_secs, "rate limit exceeded");
        let mut response = ApiError(FlowError::RateLimited {
            retry_after_secs: decision.retry_after_secs as u64,
        })
        .into_response();
        apply_rate_headers(response.headers_mut(), &decision);
        return response;
    }

    let mut response = next.run(req).await;
    apply_rate_headers(response.headers_mut(), &decision);
    response
}

fn apply_rate_headers(headers: &mut HeaderMap, decision: &RateDecision) {
    let pairs = [
        ("x-ratelimit-limit", decision.limit.to_string()),
        ("x-ratelimit-remaining", decision.remaining.to_string()),
        ("x-ratelimit-reset", decision.reset_at.to_string()),
    ];
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
}
