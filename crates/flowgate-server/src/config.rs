use flowgate_core::CoreConfig;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Include error detail in responses alongside the correlation id.
    pub debug_errors: bool,
    pub auth: AuthConfig,
    pub rate_limit_per_minute: Option<u64>,
    pub stream: StreamConfig,
    pub core: CoreConfig,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Verifier configs, tried in declaration order.
    pub tenants: Vec<TenantConfig>,
    /// Email domain principals are expected to belong to.
    pub org_domain: Option<String>,
    /// Reject principals outside `org_domain` instead of only logging them.
    pub enforce_domain: bool,
    /// Cookie consulted when no Authorization header is present.
    pub cookie_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TenantConfig {
    pub id: String,
    pub secret: String,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub file_poll_secs: u64,
    pub heartbeat_secs: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    auth: AuthSection,
    #[serde(default)]
    rate_limit: RateLimitSection,
    #[serde(default)]
    stream: StreamSection,
    #[serde(default)]
    backend: BackendSection,
    #[serde(default)]
    records: RecordsSection,
    #[serde(default)]
    session: SessionSection,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    debug_errors: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            debug_errors: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthSection {
    #[serde(default)]
    tenants: Vec<TenantConfig>,
    #[serde(default)]
    org_domain: Option<String>,
    #[serde(default)]
    enforce_domain: bool,
    #[serde(default = "default_cookie_name")]
    cookie_name: String,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            tenants: Vec::new(),
            org_domain: None,
            enforce_domain: false,
            cookie_name: default_cookie_name(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RateLimitSection {
    #[serde(default)]
    requests_per_minute: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct StreamSection {
    #[serde(default = "default_file_poll_secs")]
    file_poll_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    heartbeat_secs: u64,
    #[serde(default = "default_stream_timeout_secs")]
    timeout_secs: u64,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            file_poll_secs: default_file_poll_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            timeout_secs: default_stream_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct BackendSection {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RecordsSection {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    service_email: Option<String>,
    #[serde(default)]
    service_password: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SessionSection {
    #[serde(default)]
    workspace_root: Option<String>,
    #[serde(default)]
    ttl_minutes: Option<i64>,
    #[serde(default)]
    credential_ttl_minutes: Option<i64>,
    #[serde(default)]
    request_timeout_secs: Option<u64>,
    #[serde(default)]
    default_model: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_cookie_name() -> String {
    "flowgate_auth".to_string()
}

fn default_file_poll_secs() -> u64 {
    10
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_stream_timeout_secs() -> u64 {
    600
}

impl ServerConfig {
    pub fn load() -> anyhow::Result<Self> {
        let mut config = if let Some(file_config) = load_from_file()? {
            Self::from_file(file_config)
        } else {
            Self::from_env()
        };

        // Secrets are deployable through the environment regardless of how
        // the rest of the config arrived.
        config.auth.tenants.extend(tenants_from_env());
        Ok(config)
    }

    fn from_file(file: FileConfig) -> Self {
        let env_core = CoreConfig::from_env();
        Self {
            host: file.server.host,
            port: file.server.port,
            debug_errors: file.server.debug_errors,
            auth: AuthConfig {
                tenants: file.auth.tenants,
                org_domain: file.auth.org_domain,
                enforce_domain: file.auth.enforce_domain,
                cookie_name: file.auth.cookie_name,
            },
            rate_limit_per_minute: file.rate_limit.requests_per_minute,
            stream: StreamConfig {
                file_poll_secs: file.stream.file_poll_secs,
                heartbeat_secs: file.stream.heartbeat_secs,
                timeout_secs: file.stream.timeout_secs,
            },
            core: CoreConfig {
                backend_url: file.backend.url.unwrap_or(env_core.backend_url),
                records_url: file.records.url.unwrap_or(env_core.records_url),
                records_api_key: file.records.api_key.unwrap_or(env_core.records_api_key),
                service_email: file.records.service_email.unwrap_or(env_core.service_email),
                service_password: file
                    .records
                    .service_password
                    .unwrap_or(env_core.service_password),
                workspace_root: file.session.workspace_root.unwrap_or(env_core.workspace_root),
                credential_ttl_minutes: file
                    .session
                    .credential_ttl_minutes
                    .unwrap_or(env_core.credential_ttl_minutes),
                session_ttl_minutes: file
                    .session
                    .ttl_minutes
                    .unwrap_or(env_core.session_ttl_minutes),
                request_timeout_secs: file
                    .session
                    .request_timeout_secs
                    .unwrap_or(env_core.request_timeout_secs),
                default_model: file.session.default_model.unwrap_or(env_core.default_model),
            },
        }
    }

    fn from_env() -> Self {
        let host = env::var("FLOWGATE_SERVER_HOST").unwrap_or_else(|_| default_host());
        let port = env::var("FLOWGATE_SERVER_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or_else(default_port);
        let debug_errors = env::var("FLOWGATE_DEBUG_ERRORS")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let rate_limit_per_minute = env::var("FLOWGATE_RATE_LIMIT_RPM")
            .ok()
            .and_then(|value| value.parse::<u64>().ok());

        Self {
            host,
            port,
            debug_errors,
            auth: AuthConfig {
                tenants: Vec::new(),
                org_domain: env::var("FLOWGATE_ORG_DOMAIN").ok().filter(|d| !d.is_empty()),
                enforce_domain: env::var("FLOWGATE_ENFORCE_DOMAIN")
                    .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                    .unwrap_or(false),
                cookie_name: env::var("FLOWGATE_AUTH_COOKIE")
                    .unwrap_or_else(|_| default_cookie_name()),
            },
            rate_limit_per_minute,
            stream: StreamConfig {
                file_poll_secs: env_u64("FLOWGATE_STREAM_FILE_POLL_SECS", default_file_poll_secs()),
                heartbeat_secs: env_u64("FLOWGATE_STREAM_HEARTBEAT_SECS", default_heartbeat_secs()),
                timeout_secs: env_u64(
                    "FLOWGATE_STREAM_TIMEOUT_SECS",
                    default_stream_timeout_secs(),
                ),
            },
            core: CoreConfig::from_env(),
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

/// `FLOWGATE_TENANT_SECRETS` holds `tenant-id:secret` pairs separated by
/// commas, for deployments that never touch a config file.
fn tenants_from_env() -> Vec<TenantConfig> {
    let Ok(raw) = env::var("FLOWGATE_TENANT_SECRETS") else {
        return Vec::new();
    };
    parse_tenant_pairs(&raw)
}

fn parse_tenant_pairs(raw: &str) -> Vec<TenantConfig> {
    raw.split(',')
        .filter_map(|pair| {
            let (id, secret) = pair.split_once(':')?;
            let id = id.trim();
            let secret = secret.trim();
            if id.is_empty() || secret.is_empty() {
                return None;
            }
            Some(TenantConfig {
                id: id.to_string(),
                secret: secret.to_string(),
                issuer: None,
                audience: None,
            })
        })
        .collect()
}

fn load_from_file() -> anyhow::Result<Option<FileConfig>> {
    let config_path = env::var("FLOWGATE_SERVER_CONFIG").ok();
    let path = if let Some(path) = config_path {
        Some(path)
    } else if Path::new("flowgate.toml").exists() {
        Some("flowgate.toml".to_string())
    } else {
        None
    };

    let Some(path) = path else {
        return Ok(None);
    };

    let contents = fs::read_to_string(&path)
        .map_err(|err| anyhow::anyhow!("Failed to read config {}: {}", path, err))?;
    let parsed: FileConfig = toml::from_str(&contents)
        .map_err(|err| anyhow::anyhow!("Failed to parse config {}: {}", path, err))?;
    Ok(Some(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_config_maps_every_section() {
        let parsed: FileConfig = toml::from_str(
            r#"
            [server]
            host = "127.0.0.1"
            port = 9100
            debug_errors = true

            [auth]
            org_domain = "example.com"
            enforce_domain = true

            [[auth.tenants]]
            id = "acme"
            secret = "s3cret"
            issuer = "https://auth.acme.test"

            [rate_limit]
            requests_per_minute = 60

            [stream]
            file_poll_secs = 5
            timeout_secs = 120

            [backend]
            url = "http://backend.test:8000"

            [records]
            url = "http://records.test:9000"
            api_key = "anon-key"

            [session]
            ttl_minutes = 30
            "#,
        )
        .unwrap();

        let config = ServerConfig::from_file(parsed);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9100);
        assert!(config.debug_errors);
        assert_eq!(config.auth.tenants.len(), 1);
        assert_eq!(config.auth.tenants[0].id, "acme");
        assert_eq!(
            config.auth.tenants[0].issuer.as_deref(),
            Some("https://auth.acme.test")
        );
        assert_eq!(config.auth.org_domain.as_deref(), Some("example.com"));
        assert!(config.auth.enforce_domain);
        assert_eq!(config.rate_limit_per_minute, Some(60));
        assert_eq!(config.stream.file_poll_secs, 5);
        assert_eq!(config.stream.heartbeat_secs, 30);
        assert_eq!(config.stream.timeout_secs, 120);
        assert_eq!(config.core.backend_url, "http://backend.test:8000");
        assert_eq!(config.core.records_url, "http://records.test:9000");
        assert_eq!(config.core.session_ttl_minutes, 30);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let parsed: FileConfig = toml::from_str("").unwrap();
        let config = ServerConfig::from_file(parsed);

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert!(!config.debug_errors);
        assert!(config.auth.tenants.is_empty());
        assert_eq!(config.auth.cookie_name, "flowgate_auth");
        assert_eq!(config.rate_limit_per_minute, None);
        assert_eq!(config.stream.file_poll_secs, 10);
        assert_eq!(config.stream.heartbeat_secs, 30);
        assert_eq!(config.stream.timeout_secs, 600);
    }

    #[test]
    fn tenant_pairs_parse_and_skip_malformed_entries() {
        let tenants = parse_tenant_pairs("acme:one, beta:two ,broken,:empty,late:");
        assert_eq!(tenants.len(), 2);
        assert_eq!(tenants[0].id, "acme");
        assert_eq!(tenants[0].secret, "one");
        assert_eq!(tenants[1].id, "beta");
        assert_eq!(tenants[1].secret, "two");
    }
}
