//! Error types for the session engine.
//!
//! Every failure is classified into a small taxonomy so the HTTP boundary can
//! map it to a status code and a tenant-safe message without inspecting the
//! internal detail. The full detail stays in the logs, keyed by a correlation
//! id that is also returned to the caller.

use thiserror::Error;

/// Engine error taxonomy
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("access denied: {0}")]
    Authorization(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Session linkage could not be rebuilt from the record store. Same
    /// status class as `NotFound` but rendered with its own client message.
    #[error("session expired: {0}")]
    SessionExpired(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("backend request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// HTTP status code for this error class.
    pub fn status_code(&self) -> u16 {
        match self {
            FlowError::Validation(_) => 400,
            FlowError::Authentication(_) => 401,
            FlowError::Authorization(_) => 403,
            FlowError::NotFound(_) | FlowError::SessionExpired(_) => 404,
            FlowError::Timeout(_) => 408,
            FlowError::RateLimited { .. } => 429,
            FlowError::Unavailable(_) | FlowError::Http(_) => 503,
            FlowError::Internal(_) | FlowError::Json(_) => 500,
        }
    }

    /// Short machine-readable code carried in the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            FlowError::Validation(_) => "validation_error",
            FlowError::Authentication(_) => "authentication_error",
            FlowError::Authorization(_) => "authorization_error",
            FlowError::NotFound(_) => "not_found",
            FlowError::SessionExpired(_) => "session_expired",
            FlowError::Timeout(_) => "timeout",
            FlowError::RateLimited { .. } => "rate_limited",
            FlowError::Unavailable(_) | FlowError::Http(_) => "service_unavailable",
            FlowError::Internal(_) | FlowError::Json(_) => "internal_error",
        }
    }

    /// Stable message safe to show to any tenant. Internal detail never
    /// crosses the boundary through this path.
    pub fn public_message(&self) -> &'static str {
        match self {
            FlowError::Validation(_) => "Invalid request data",
            FlowError::Authentication(_) => "Authentication failed",
            FlowError::Authorization(_) => "Access denied",
            FlowError::NotFound(_) => "Resource not found",
            FlowError::SessionExpired(_) => "Session expired, start a new one",
            FlowError::Timeout(_) => "Request timeout",
            FlowError::RateLimited { .. } => "Too many requests",
            FlowError::Unavailable(_) | FlowError::Http(_) => "Service temporarily unavailable",
            FlowError::Internal(_) | FlowError::Json(_) => "Internal server error",
        }
    }

    /// Seconds the caller should wait before retrying, when known.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            FlowError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

/// Correlation id linking a client-visible error to its log entry.
pub fn correlation_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("err_{}_{}", millis, &suffix[..8])
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(FlowError::Validation("x".into()).status_code(), 400);
        assert_eq!(FlowError::Authentication("x".into()).status_code(), 401);
        assert_eq!(FlowError::Authorization("x".into()).status_code(), 403);
        assert_eq!(FlowError::NotFound("x".into()).status_code(), 404);
        assert_eq!(FlowError::SessionExpired("x".into()).status_code(), 404);
        assert_eq!(FlowError::Timeout("x".into()).status_code(), 408);
        assert_eq!(
            FlowError::RateLimited {
                retry_after_secs: 5
            }
            .status_code(),
            429
        );
        assert_eq!(FlowError::Unavailable("x".into()).status_code(), 503);
        assert_eq!(FlowError::Internal("x".into()).status_code(), 500);
    }

    #[test]
    fn public_messages_never_leak_detail() {
        let err = FlowError::NotFound("sandbox handle for unit abc-123".into());
        assert_eq!(err.public_message(), "Resource not found");
        assert!(!err.public_message().contains("abc-123"));

        let err = FlowError::Internal("credential refresh: connection refused".into());
        assert_eq!(err.public_message(), "Internal server error");
    }

    #[test]
    fn expired_sessions_render_their_own_message() {
        let err = FlowError::SessionExpired("no unit recorded for session s1".into());
        assert_eq!(err.status_code(), 404);
        assert_eq!(err.code(), "session_expired");
        assert_eq!(err.public_message(), "Session expired, start a new one");
    }

    #[test]
    fn retry_after_only_on_rate_limit() {
        assert_eq!(
            FlowError::RateLimited {
                retry_after_secs: 42
            }
            .retry_after_secs(),
            Some(42)
        );
        assert_eq!(FlowError::Validation("x".into()).retry_after_secs(), None);
    }

    #[test]
    fn correlation_ids_are_unique_and_prefixed() {
        let a = correlation_id();
        let b = correlation_id();
        assert!(a.starts_with("err_"));
        assert!(b.starts_with("err_"));
        assert_ne!(a, b);
        // err_<millis>_<8 hex chars>
        let suffix = a.rsplit('_').next().unwrap();
        assert_eq!(suffix.len(), 8);
    }
}
