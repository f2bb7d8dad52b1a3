//! Session state machine types.
//!
//! A session tracks one client-facing conversation with a remote sandbox
//! computation. Status moves `Initiating -> Running`, bounces between
//! `Running` and `AwaitingPhase` as phases complete and restart, and ends at
//! `Closed`. `Closed` is terminal; no transition leaves it.

use crate::error::{FlowError, Result};
use crate::models::file::FilesSummary;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initiating,
    Running,
    AwaitingPhase,
    Closed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Closed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initiating => "initiating",
            SessionStatus::Running => "running",
            SessionStatus::AwaitingPhase => "awaiting_phase",
            SessionStatus::Closed => "closed",
        }
    }
}

/// Handle to the remote sandbox a session's work executes in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxHandle {
    pub id: String,
    /// Directory the computation writes output files into.
    pub workspace_root: String,
}

impl SandboxHandle {
    pub fn new(id: impl Into<String>, workspace_root: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            workspace_root: workspace_root.into(),
        }
    }

    /// Canonical remote path for a named output file.
    pub fn file_path(&self, name: &str) -> String {
        format!("{}/{}", self.workspace_root.trim_end_matches('/'), name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Lower-cased opaque session token, also the cache key.
    pub id: String,
    /// Parent unit of work the session belongs to.
    pub unit_id: String,
    pub sandbox: SandboxHandle,
    pub status: SessionStatus,
    pub current_phase: u32,
    /// Run driving the current phase, if one has been started.
    pub run_id: Option<String>,
    /// File names the client expects the current phase to produce.
    pub expected_files: Vec<String>,
    pub created_at: i64,
    pub touched_at: i64,
}

impl Session {
    pub fn initiating(
        id: impl Into<String>,
        unit_id: impl Into<String>,
        sandbox: SandboxHandle,
    ) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: id.into(),
            unit_id: unit_id.into(),
            sandbox,
            status: SessionStatus::Initiating,
            current_phase: 1,
            run_id: None,
            expected_files: Vec::new(),
            created_at: now,
            touched_at: now,
        }
    }

    /// Apply a status transition, rejecting anything the machine does not
    /// allow. `Closed` accepts no further transitions.
    pub fn transition(&mut self, next: SessionStatus) -> Result<()> {
        use SessionStatus::*;
        let allowed = matches!(
            (self.status, next),
            (Initiating, Running)
                | (Running, AwaitingPhase)
                | (AwaitingPhase, Running)
                | (Running, Running)
                | (Initiating, Closed)
                | (Running, Closed)
                | (AwaitingPhase, Closed)
        );
        if !allowed {
            return Err(FlowError::Validation(format!(
                "illegal session transition {} -> {}",
                self.status.as_str(),
                next.as_str()
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn touch(&mut self) {
        self.touched_at = chrono::Utc::now().timestamp_millis();
    }
}

/// Point-in-time view of a session returned by the status operation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOverview {
    pub session_id: String,
    pub status: SessionStatus,
    pub current_phase: u32,
    pub run_id: Option<String>,
    pub expected_files: Vec<String>,
    pub files_summary: FilesSummary,
}
