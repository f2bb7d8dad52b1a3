//! File registry: which sandbox outputs exist, which have been transferred,
//! and their cached bytes.
//!
//! The transfer invariant is per session, not per phase: once a name has
//! been fetched it is never fetched again unless a caller forces a refresh.
//! Cached bytes outlive the sandbox, so a download can still be served after
//! the remote side stops answering.

use crate::backend::WorkBackend;
use crate::error::{FlowError, Result};
use crate::mime;
use crate::models::{FileRecord, FileStatus, FilesSummary, Session};
use crate::validate;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct FileRegistry {
    backend: Arc<dyn WorkBackend>,
    files: DashMap<String, HashMap<String, FileRecord>>,
}

impl FileRegistry {
    pub fn new(backend: Arc<dyn WorkBackend>) -> Self {
        Self {
            backend,
            files: DashMap::new(),
        }
    }

    /// Names present in the sandbox that have not been transferred yet.
    /// Directories and disallowed file types never qualify.
    pub async fn list_new(&self, session: &Session) -> Result<Vec<String>> {
        let entries = self
            .backend
            .list_files(&session.sandbox.id, &session.sandbox.workspace_root)
            .await?;

        let known: Vec<String> = self
            .files
            .get(&session.id)
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();

        let mut fresh = Vec::new();
        for entry in entries {
            if entry.is_dir || !mime::is_allowed(&entry.name) {
                continue;
            }
            let name = entry.name.to_lowercase();
            if known.contains(&name) || fresh.contains(&name) {
                continue;
            }
            fresh.push(name);
        }
        Ok(fresh)
    }

    /// Transfer a file out of the sandbox, or serve it from the cache.
    ///
    /// With `force` unset an already-recorded file is returned as-is. When a
    /// forced or first-time download fails but bytes are cached, the cached
    /// record is served instead of an error; the fallback never erases it.
    pub async fn fetch(&self, session: &Session, name: &str, force: bool) -> Result<FileRecord> {
        let name = validate::file_name(name)?;

        if !force {
            if let Some(record) = self.cached(&session.id, &name) {
                return Ok(record);
            }
        }

        let remote_path = session.sandbox.file_path(&name);
        match self.backend.fetch_file(&session.sandbox.id, &remote_path).await {
            Ok(content) => Ok(self.record(&session.id, &name, &remote_path, content)),
            Err(err) => {
                if let Some(record) = self.cached(&session.id, &name) {
                    warn!(
                        session_id = %session.id,
                        file = %name,
                        error = %err,
                        "download failed, serving cached copy"
                    );
                    return Ok(record);
                }
                Err(FlowError::NotFound(format!(
                    "file '{}' is not available: {}",
                    name, err
                )))
            }
        }
    }

    fn record(&self, session_id: &str, name: &str, remote_path: &str, content: Bytes) -> FileRecord {
        let mut map = self.files.entry(session_id.to_string()).or_default();
        let discovered_at = map
            .get(name)
            .map(|existing| existing.discovered_at)
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        let record = FileRecord {
            name: name.to_string(),
            remote_path: remote_path.to_string(),
            size: content.len(),
            content,
            discovered_at,
            downloaded: true,
        };
        debug!(session_id, file = name, size = record.size, "file transferred");
        map.insert(name.to_string(), record.clone());
        record
    }

    pub fn cached(&self, session_id: &str, name: &str) -> Option<FileRecord> {
        self.files
            .get(session_id)
            .and_then(|map| map.get(name).cloned())
    }

    /// All tracked files for a session, name-sorted for stable output.
    pub fn snapshot(&self, session_id: &str) -> Vec<FileStatus> {
        let mut statuses: Vec<FileStatus> = self
            .files
            .get(session_id)
            .map(|map| map.values().map(FileRecord::status).collect())
            .unwrap_or_default();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Transfer progress against an expected-file list.
    pub fn summary(&self, session_id: &str, expected: &[String]) -> FilesSummary {
        let statuses = self.snapshot(session_id);
        let downloaded = statuses.iter().filter(|s| s.downloaded).count();
        let total_bytes = statuses.iter().map(|s| s.size as u64).sum();
        let complete = !expected.is_empty()
            && expected.iter().all(|name| {
                statuses
                    .iter()
                    .any(|status| status.downloaded && &status.name == name)
            });
        FilesSummary {
            expected: expected.len(),
            downloaded,
            total_bytes,
            complete,
        }
    }

    /// Drop everything tracked for a session. Called on cache eviction.
    pub fn remove_session(&self, session_id: &str) {
        if self.files.remove(session_id).is_some() {
            debug!(session_id, "file registry entry dropped");
        }
    }
}
