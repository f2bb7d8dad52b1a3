//! Session orchestration engine: pairs client-facing sessions with
//! long-running remote sandbox computations.
//!
//! The crate is transport-free on the inbound side; an HTTP server (or any
//! other boundary) drives it through [`FlowCore`]. Outbound it speaks to two
//! services: the work backend that runs computations in sandboxes, and the
//! record store that keeps the durable session/unit/sandbox linkage plus
//! chat transcripts.

pub mod backend;
pub mod config;
pub mod error;
pub mod mime;
pub mod models;
pub mod registry;
pub mod session;
pub mod validate;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use backend::{
    HttpRecordStore, HttpWorkBackend, RecordStore, RunState, ServiceAuth, StoredMessage,
    WorkBackend,
};
pub use config::CoreConfig;
pub use error::{FlowError, Result};
pub use models::{
    FileRecord, FileReport, FileStatus, FilesSummary, Principal, SandboxHandle, Session,
    SessionOverview, SessionStatus, StreamEvent,
};
pub use registry::FileRegistry;
pub use session::{CloseOutcome, SessionManager};

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;

/// Assembled engine: configuration, remote clients, and the session manager
/// built on top of them. One instance is shared across the whole process.
pub struct FlowCore {
    pub config: CoreConfig,
    pub backend: Arc<dyn WorkBackend>,
    pub records: Arc<dyn RecordStore>,
    pub registry: Arc<FileRegistry>,
    pub sessions: SessionManager,
}

impl FlowCore {
    /// Wire up the engine against real HTTP services.
    pub fn new(config: CoreConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to build http client")?;
        let stream_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to build streaming http client")?;

        let auth = Arc::new(ServiceAuth::new(client.clone(), &config));
        let backend: Arc<dyn WorkBackend> = Arc::new(HttpWorkBackend::new(
            client.clone(),
            stream_client,
            &config,
            auth.clone(),
        ));
        let records: Arc<dyn RecordStore> = Arc::new(HttpRecordStore::new(client, auth));
        Ok(Self::with_components(config, backend, records))
    }

    /// Assemble the engine from explicit collaborators. Tests hand in
    /// scripted backends here; production goes through [`FlowCore::new`].
    pub fn with_components(
        config: CoreConfig,
        backend: Arc<dyn WorkBackend>,
        records: Arc<dyn RecordStore>,
    ) -> Self {
        let registry = Arc::new(FileRegistry::new(backend.clone()));
        let sessions = SessionManager::new(
            config.clone(),
            backend.clone(),
            records.clone(),
            registry.clone(),
        );
        Self {
            config,
            backend,
            records,
            registry,
            sessions,
        }
    }
}
