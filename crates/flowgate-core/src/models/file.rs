use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A sandbox output file tracked by the registry. Content is kept in memory
/// so a later download can be served even if the sandbox has gone away.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub name: String,
    pub remote_path: String,
    pub content: Bytes,
    pub size: usize,
    /// First time the registry saw this file, epoch millis.
    pub discovered_at: i64,
    pub downloaded: bool,
}

impl FileRecord {
    pub fn status(&self) -> FileStatus {
        FileStatus {
            name: self.name.clone(),
            size: self.size,
            downloaded: self.downloaded,
            discovered_at: self.discovered_at,
        }
    }
}

/// Client-facing view of one tracked file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStatus {
    pub name: String,
    pub size: usize,
    pub downloaded: bool,
    pub discovered_at: i64,
}

/// Cumulative transfer counts for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesSummary {
    pub expected: usize,
    pub downloaded: usize,
    pub total_bytes: u64,
    pub complete: bool,
}

impl FilesSummary {
    pub fn describe(&self) -> String {
        format!(
            "{}/{} expected files downloaded ({})",
            self.downloaded,
            self.expected,
            human_size(self.total_bytes)
        )
    }
}

/// Result of one file-poll pass.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReport {
    pub file_statuses: Vec<FileStatus>,
    /// Names transferred during this pass.
    pub newly_downloaded: Vec<String>,
    pub all_files: Vec<String>,
    pub summary: FilesSummary,
}

fn human_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
