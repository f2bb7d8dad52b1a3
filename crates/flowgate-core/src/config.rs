use std::env;

/// Engine configuration: remote endpoints, service credentials, and the
/// timing knobs for caches. The server crate assembles this from its own
/// config file; `from_env` covers bare deployments and tools.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Base URL of the work backend (runs, sandboxes, token streams).
    pub backend_url: String,
    /// Base URL of the durable record store.
    pub records_url: String,
    /// API key sent with every record-store request.
    pub records_api_key: String,
    /// Service account used for the credential exchange.
    pub service_email: String,
    pub service_password: String,
    /// Root directory inside a sandbox where output files land.
    pub workspace_root: String,
    /// How long an exchanged service credential is trusted.
    pub credential_ttl_minutes: i64,
    /// Idle lifetime of a cached session before eviction.
    pub session_ttl_minutes: i64,
    /// Per-request timeout for backend and record-store calls.
    pub request_timeout_secs: u64,
    /// Model used when a request does not name one.
    pub default_model: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            records_url: default_records_url(),
            records_api_key: String::new(),
            service_email: String::new(),
            service_password: String::new(),
            workspace_root: default_workspace_root(),
            credential_ttl_minutes: default_credential_ttl_minutes(),
            session_ttl_minutes: default_session_ttl_minutes(),
            request_timeout_secs: default_request_timeout_secs(),
            default_model: default_model(),
        }
    }
}

pub(crate) fn default_backend_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

pub(crate) fn default_records_url() -> String {
    "http://127.0.0.1:9000".to_string()
}

pub(crate) fn default_workspace_root() -> String {
    "/workspace".to_string()
}

pub(crate) fn default_credential_ttl_minutes() -> i64 {
    55
}

pub(crate) fn default_session_ttl_minutes() -> i64 {
    120
}

pub(crate) fn default_request_timeout_secs() -> u64 {
    30
}

pub(crate) fn default_model() -> String {
    crate::validate::DEFAULT_MODEL.to_string()
}

impl CoreConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            backend_url: env::var("FLOWGATE_BACKEND_URL").unwrap_or(defaults.backend_url),
            records_url: env::var("FLOWGATE_RECORDS_URL").unwrap_or(defaults.records_url),
            records_api_key: env::var("FLOWGATE_RECORDS_API_KEY")
                .unwrap_or(defaults.records_api_key),
            service_email: env::var("FLOWGATE_SERVICE_EMAIL").unwrap_or(defaults.service_email),
            service_password: env::var("FLOWGATE_SERVICE_PASSWORD")
                .unwrap_or(defaults.service_password),
            workspace_root: env::var("FLOWGATE_WORKSPACE_ROOT").unwrap_or(defaults.workspace_root),
            credential_ttl_minutes: env::var("FLOWGATE_CREDENTIAL_TTL_MINUTES")
                .ok()
                .and_then(|value| value.parse::<i64>().ok())
                .unwrap_or(defaults.credential_ttl_minutes),
            session_ttl_minutes: env::var("FLOWGATE_SESSION_TTL_MINUTES")
                .ok()
                .and_then(|value| value.parse::<i64>().ok())
                .unwrap_or(defaults.session_ttl_minutes),
            request_timeout_secs: env::var("FLOWGATE_REQUEST_TIMEOUT_SECS")
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(defaults.request_timeout_secs),
            default_model: env::var("FLOWGATE_DEFAULT_MODEL").unwrap_or(defaults.default_model),
        }
    }
}
