use crate::models::file::FileStatus;
use crate::models::session::{Session, SessionStatus};
use serde::{Deserialize, Serialize};

/// Frames multiplexed onto one client connection. The first frame on any
/// connection is always `SessionStatus`; ordering past that only holds
/// within a single producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    #[serde(rename_all = "camelCase")]
    SessionStatus {
        session_id: String,
        status: SessionStatus,
        current_phase: u32,
        expected_files: Vec<String>,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    FilesUpdated {
        files: Vec<FileStatus>,
        new_files: Vec<String>,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    ChatResponse {
        data: String,
        is_complete: bool,
        timestamp: i64,
    },
    Error {
        message: String,
        timestamp: i64,
    },
    Heartbeat {
        timestamp: i64,
    },
    StreamTimeout {
        message: String,
        timestamp: i64,
    },
}

impl StreamEvent {
    pub fn now() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    pub fn session_status(session: &Session) -> Self {
        StreamEvent::SessionStatus {
            session_id: session.id.clone(),
            status: session.status,
            current_phase: session.current_phase,
            expected_files: session.expected_files.clone(),
            timestamp: Self::now(),
        }
    }

    pub fn files_updated(files: Vec<FileStatus>, new_files: Vec<String>) -> Self {
        StreamEvent::FilesUpdated {
            files,
            new_files,
            timestamp: Self::now(),
        }
    }

    pub fn heartbeat() -> Self {
        StreamEvent::Heartbeat {
            timestamp: Self::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        StreamEvent::Error {
            message: message.into(),
            timestamp: Self::now(),
        }
    }

    pub fn chat_chunk(data: impl Into<String>) -> Self {
        StreamEvent::ChatResponse {
            data: data.into(),
            is_complete: false,
            timestamp: Self::now(),
        }
    }

    /// Final chat frame; the payload is the conventional end marker.
    pub fn chat_done() -> Self {
        StreamEvent::ChatResponse {
            data: "[DONE]".into(),
            is_complete: true,
            timestamp: Self::now(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        StreamEvent::StreamTimeout {
            message: message.into(),
            timestamp: Self::now(),
        }
    }
}
