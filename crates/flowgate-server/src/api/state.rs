use crate::auth::IdentityGate;
use crate::config::ServerConfig;
use crate::middleware::RateLimiter;
use flowgate_core::FlowCore;
use std::sync::Arc;

/// Everything the handlers and middleware share: the engine, the identity
/// gate, the optional limiter, and the resolved configuration.
pub struct AppContext {
    pub core: Arc<FlowCore>,
    pub gate: IdentityGate,
    pub limiter: Option<RateLimiter>,
    pub config: ServerConfig,
}

pub type AppState = Arc<AppContext>;
