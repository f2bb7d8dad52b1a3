pub mod files;
pub mod response;
pub mod runs;
pub mod sessions;
pub mod state;
pub mod stream;

pub use response::{ApiError, ApiResponse};
pub use state::{AppContext, AppState};

use crate::auth::{auth_middleware, issue_cookie};
use crate::middleware::rate_limit_middleware;
use axum::{
    Router, middleware,
    routing::{delete, get, post},
};

#[derive(serde::Serialize)]
struct Health {
    status: String,
}

// GET /health - Liveness probe, outside the authenticated surface
async fn health() -> axum::Json<Health> {
    axum::Json(Health {
        status: "flowgate is working!".to_string(),
    })
}

/// Assemble the full HTTP surface. The identity gate must run before the
/// rate limiter because rate windows key on the authenticated principal,
/// so auth is layered outermost.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Session lifecycle
        .route("/api/agent/initiate", post(sessions::initiate_session))
        .route("/api/agent/new-phase", post(sessions::start_new_phase))
        .route("/api/agent/chat", post(sessions::relay_chat))
        .route("/api/agent/close", post(sessions::close_session))
        .route("/api/agent/status", get(sessions::session_status))
        .route("/api/agent/messages", get(sessions::list_messages))
        // File transfer
        .route("/api/agent/files", get(files::poll_files))
        .route("/api/agent/download", get(files::download_file))
        // Realtime stream
        .route("/api/agent/stream", get(stream::stream_session))
        // Run control
        .route("/api/agent/runs", get(runs::current_run))
        .route("/api/agent/run-status", get(runs::run_status))
        .route("/api/agent/stop", post(runs::stop_run))
        .route("/api/agent/sandbox", delete(runs::delete_sandbox))
        .route("/api/agent/ensure-active", post(runs::ensure_active))
        // Credential exchange for cookie-carried streams
        .route("/api/auth/cookie", post(issue_cookie))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}

#[cfg(test)]
pub mod test_support {
    use super::state::{AppContext, AppState};
    use crate::auth::IdentityGate;
    use crate::config::{AuthConfig, ServerConfig, StreamConfig, TenantConfig};
    use crate::middleware::RateLimiter;
    use flowgate_core::testing::{ScriptedBackend, ScriptedRecords};
    use flowgate_core::{CoreConfig, FlowCore};
    use std::sync::Arc;

    pub fn server_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            debug_errors: false,
            auth: AuthConfig {
                tenants: Vec::new(),
                org_domain: None,
                enforce_domain: false,
                cookie_name: "flowgate_auth".to_string(),
            },
            rate_limit_per_minute: None,
            stream: StreamConfig {
                file_poll_secs: 10,
                heartbeat_secs: 30,
                timeout_secs: 600,
            },
            core: CoreConfig::default(),
        }
    }

    pub fn config_with_tenant(secret: &str) -> ServerConfig {
        let mut config = server_config();
        config.auth.tenants.push(TenantConfig {
            id: "acme".to_string(),
            secret: secret.to_string(),
            issuer: None,
            audience: None,
        });
        config
    }

    pub fn state_with(
        config: ServerConfig,
        backend: ScriptedBackend,
        records: ScriptedRecords,
    ) -> (AppState, Arc<ScriptedBackend>, Arc<ScriptedRecords>) {
        let backend = Arc::new(backend);
        let records = Arc::new(records);
        let core = Arc::new(FlowCore::with_components(
            CoreConfig::default(),
            backend.clone(),
            records.clone(),
        ));
        let state = Arc::new(AppContext {
            core,
            gate: IdentityGate::new(&config.auth),
            limiter: RateLimiter::new(config.rate_limit_per_minute),
            config,
        });
        (state, backend, records)
    }

    pub fn scripted_state(
        backend: ScriptedBackend,
        records: ScriptedRecords,
    ) -> (AppState, Arc<ScriptedBackend>, Arc<ScriptedRecords>) {
        state_with(server_config(), backend, records)
    }

    pub fn default_state() -> (AppState, Arc<ScriptedBackend>, Arc<ScriptedRecords>) {
        scripted_state(
            ScriptedBackend::new().with_sandbox_file("out.txt", b"hello"),
            ScriptedRecords::new().with_default_linkage(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{config_with_tenant, default_state, state_with};
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use flowgate_core::testing::{ScriptedBackend, ScriptedRecords};
    use jsonwebtoken::{Algorithm, EncodingKey, Header};
    use tower::ServiceExt;

    const SECRET: &str = "router-test-secret";

    fn sign(sub: &str) -> String {
        let claims = serde_json::json!({
            "sub": sub,
            "email": format!("{}@example.com", sub),
            "exp": chrono::Utc::now().timestamp() + 600,
        });
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn authed_get(uri: &str, token: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn health_needs_no_credentials() {
        let mut config = config_with_tenant(SECRET);
        config.rate_limit_per_minute = Some(60);
        let (state, _backend, _records) = state_with(
            config,
            ScriptedBackend::new(),
            ScriptedRecords::new().with_default_linkage(),
        );

        let response = router(state).oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn api_routes_reject_missing_credentials() {
        let (state, _backend, _records) = state_with(
            config_with_tenant(SECRET),
            ScriptedBackend::new(),
            ScriptedRecords::new().with_default_linkage(),
        );
        let (_, run_id) = ScriptedBackend::ids();

        let response = router(state)
            .oneshot(get(&format!("/api/agent/run-status?runId={}", run_id)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["code"], "authentication_error");
    }

    #[tokio::test]
    async fn bearer_token_admits_and_rate_headers_follow() {
        let mut config = config_with_tenant(SECRET);
        config.rate_limit_per_minute = Some(2);
        let (state, _backend, _records) = state_with(
            config,
            ScriptedBackend::new(),
            ScriptedRecords::new().with_default_linkage(),
        );
        let (_, run_id) = ScriptedBackend::ids();
        let app = router(state);
        let token = sign("user-1");
        let uri = format!("/api/agent/run-status?runId={}", run_id);

        let response = app
            .clone()
            .oneshot(authed_get(&uri, &token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "2");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "1");

        let _ = app.clone().oneshot(authed_get(&uri, &token)).await.unwrap();
        let limited = app.oneshot(authed_get(&uri, &token)).await.unwrap();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(limited.headers().contains_key(header::RETRY_AFTER));
    }

    #[tokio::test]
    async fn open_gate_admits_without_credentials() {
        let (state, _backend, _records) = default_state();
        let (_, run_id) = ScriptedBackend::ids();

        let response = router(state)
            .oneshot(get(&format!("/api/agent/run-status?runId={}", run_id)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cookie_round_trip_authenticates_the_stream_surface() {
        let (state, _backend, _records) = state_with(
            config_with_tenant(SECRET),
            ScriptedBackend::new(),
            ScriptedRecords::new().with_default_linkage(),
        );
        let (_, run_id) = ScriptedBackend::ids();
        let app = router(state);
        let token = sign("user-1");

        let issued = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/auth/cookie")
                    .header(header::AUTHORIZATION, format!("Bearer {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(issued.status(), StatusCode::OK);
        let cookie = issued.headers()[header::SET_COOKIE]
            .to_str()
            .unwrap()
            .to_string();
        assert!(cookie.starts_with("flowgate_auth="));
        let pair = cookie.split(';').next().unwrap().to_string();

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/agent/run-status?runId={}", run_id))
                    .header(header::COOKIE, pair)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_sessions_surface_the_expired_code() {
        let (state, _backend, _records) = default_state();

        let response = router(state)
            .oneshot(get(
                "/api/agent/status?sessionId=550e8400-e29b-41d4-a716-446655440999",
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["code"], "session_expired");
        assert_eq!(
            value["error"]["message"],
            "Session expired, start a new one"
        );
    }
}
