//! Remote collaborators, behind traits so the engine can be exercised
//! without the network.
//!
//! The work backend executes runs inside sandboxes and streams their output;
//! the record store holds the durable session -> unit -> sandbox linkage and
//! issues the service credential both clients authenticate with.

pub mod http;
pub mod records;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub use http::HttpWorkBackend;
pub use records::{HttpRecordStore, ServiceAuth};

/// Ids returned when a new session's first run is started.
#[derive(Debug, Clone)]
pub struct InitiatedRun {
    pub session_id: String,
    pub run_id: String,
}

/// One entry of a sandbox directory listing.
#[derive(Debug, Clone)]
pub struct SandboxEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Backend-reported state of a run, passed through untranslated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub run_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunState {
    /// Whether the backend considers this run finished, successfully or not.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status.as_str(),
            "completed" | "stopped" | "failed" | "error"
        )
    }
}

/// A message row from the durable store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub role: String,
    pub content: String,
    pub created_at: i64,
}

/// Chunks of a run's streamed response.
pub type TokenStream = BoxStream<'static, Result<String>>;

#[async_trait]
pub trait WorkBackend: Send + Sync {
    /// Start a brand-new session and its first run.
    async fn initiate(&self, prompt: &str, model: &str) -> Result<InitiatedRun>;

    /// Start a follow-up run on an existing session.
    async fn start_run(&self, session_id: &str, model: &str) -> Result<String>;

    async fn run_status(&self, run_id: &str) -> Result<RunState>;

    /// List a sandbox directory. Implementations return an empty list when
    /// the listing fails; an idle workspace is indistinguishable from an
    /// empty one and polling must keep going either way.
    async fn list_files(&self, sandbox_id: &str, path: &str) -> Result<Vec<SandboxEntry>>;

    async fn fetch_file(&self, sandbox_id: &str, path: &str) -> Result<Bytes>;

    async fn stop_run(&self, run_id: &str) -> Result<()>;

    async fn stop_sandbox(&self, sandbox_id: &str) -> Result<()>;

    async fn delete_sandbox(&self, sandbox_id: &str) -> Result<()>;

    /// Wake a unit's sandbox if the backend has parked it.
    async fn ensure_active(&self, unit_id: &str) -> Result<()>;

    /// Subscribe to a run's response tokens. The stream ends when the run
    /// completes; transport failures surface as stream items.
    async fn stream_run(&self, run_id: &str) -> Result<TokenStream>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Parent unit for a session, if the session was ever recorded.
    async fn unit_for_session(&self, session_id: &str) -> Result<Option<String>>;

    /// Sandbox handle id for a unit, if one has been provisioned.
    async fn sandbox_for_unit(&self, unit_id: &str) -> Result<Option<String>>;

    /// Append a message to a session's durable transcript.
    async fn append_message(&self, session_id: &str, role: &str, content: &str) -> Result<()>;

    async fn list_messages(
        &self,
        session_id: &str,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<StoredMessage>>;
}
