#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod api;
mod auth;
mod config;
mod middleware;

use api::AppContext;
use auth::IdentityGate;
use axum::http::{Method, header};
use config::ServerConfig;
use flowgate_core::FlowCore;
use middleware::RateLimiter;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

#[tokio::main]
async fn main() {
    // Initialize tracing logger
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,flowgate_server=debug,flowgate_core=debug".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    tracing::info!("Starting Flowgate server");

    let config = ServerConfig::load().expect("Failed to load configuration");
    api::response::set_debug_errors(config.debug_errors);

    let core = Arc::new(FlowCore::new(config.core.clone()).expect("Failed to initialize engine"));
    let gate = IdentityGate::new(&config.auth);
    if gate.is_open() {
        tracing::warn!("no tenants configured, all requests are admitted unauthenticated");
    }
    let limiter = RateLimiter::new(config.rate_limit_per_minute);

    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppContext {
        core,
        gate,
        limiter,
        config,
    });

    // Configure CORS
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    let app = api::router(state).layer(cors);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind server address");

    tracing::info!("Flowgate running on http://{}", addr);

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
