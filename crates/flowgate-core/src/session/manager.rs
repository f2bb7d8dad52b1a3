//! Session lifecycle operations.
//!
//! The manager owns the state machine: it validates inputs before any remote
//! call, drives runs through the work backend, and rebuilds evicted sessions
//! from the record store. All mutation happens through the cache so
//! concurrent operations on one session serialize on its entry.

use crate::backend::{RecordStore, RunState, StoredMessage, WorkBackend};
use crate::config::CoreConfig;
use crate::error::{FlowError, Result};
use crate::models::{
    FileRecord, FileReport, FilesSummary, FileStatus, SandboxHandle, Session, SessionOverview,
    SessionStatus,
};
use crate::registry::FileRegistry;
use crate::session::cache::SessionCache;
use crate::validate;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Final report handed back when a session closes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseOutcome {
    pub session_id: String,
    pub final_files: Vec<FileStatus>,
    pub summary: FilesSummary,
    pub description: String,
}

pub struct SessionManager {
    config: CoreConfig,
    backend: Arc<dyn WorkBackend>,
    records: Arc<dyn RecordStore>,
    registry: Arc<FileRegistry>,
    cache: SessionCache,
}

impl SessionManager {
    pub fn new(
        config: CoreConfig,
        backend: Arc<dyn WorkBackend>,
        records: Arc<dyn RecordStore>,
        registry: Arc<FileRegistry>,
    ) -> Self {
        let cache = SessionCache::new(config.session_ttl_minutes);
        Self {
            config,
            backend,
            records,
            registry,
            cache,
        }
    }

    /// Evict idle sessions and their registry state.
    fn purge(&self) {
        for id in self.cache.purge_stale() {
            self.registry.remove_session(&id);
        }
    }

    /// Cached session, or one rebuilt from the record store.
    pub async fn resolve(&self, session_id: &str) -> Result<Session> {
        let session_id = validate::session_id(session_id)?;
        if let Some(session) = self.cache.get(&session_id) {
            return Ok(session);
        }
        self.recover(&session_id).await
    }

    /// Rebuild a session from its durable linkage. The record store has no
    /// status column, so a recovered session re-enters as `Running` with an
    /// empty expected-file set.
    pub async fn recover(&self, session_id: &str) -> Result<Session> {
        let session_id = validate::session_id(session_id)?;
        let unit_id = self
            .records
            .unit_for_session(&session_id)
            .await?
            .ok_or_else(|| {
                FlowError::SessionExpired(format!("no unit recorded for session {}", session_id))
            })?;
        let sandbox_id = self
            .records
            .sandbox_for_unit(&unit_id)
            .await?
            .ok_or_else(|| {
                FlowError::SessionExpired(format!("no sandbox recorded for unit {}", unit_id))
            })?;

        let sandbox = SandboxHandle::new(sandbox_id, &self.config.workspace_root);
        let mut session = Session::initiating(&session_id, &unit_id, sandbox);
        session.transition(SessionStatus::Running)?;
        self.cache.insert(session.clone());
        info!(session_id = %session.id, unit_id = %session.unit_id, "session recovered from records");
        Ok(session)
    }

    /// Start a new session: validate, start the first run, resolve the
    /// sandbox linkage, and cache the result as `Running` phase 1. A remote
    /// failure anywhere is fatal to the call and nothing is cached.
    pub async fn initiate(
        &self,
        prompt: &str,
        expected: &[String],
        model: Option<&str>,
    ) -> Result<Session> {
        let prompt = validate::prompt(prompt)?;
        let expected = validate::expected_files(expected)?;
        let model = validate::model(model)?;
        self.purge();

        let run = self.backend.initiate(&prompt, &model).await?;
        let session_id = run.session_id.to_lowercase();

        let unit_id = self
            .records
            .unit_for_session(&session_id)
            .await?
            .ok_or_else(|| {
                FlowError::Internal(format!("no unit recorded for new session {}", session_id))
            })?;
        let sandbox_id = self
            .records
            .sandbox_for_unit(&unit_id)
            .await?
            .ok_or_else(|| {
                FlowError::Internal(format!("no sandbox recorded for unit {}", unit_id))
            })?;

        let sandbox = SandboxHandle::new(sandbox_id, &self.config.workspace_root);
        let mut session = Session::initiating(&session_id, &unit_id, sandbox);
        session.expected_files = expected;
        session.run_id = Some(run.run_id.clone());
        session.transition(SessionStatus::Running)?;
        self.cache.insert(session.clone());

        info!(
            session_id = %session.id,
            unit_id = %session.unit_id,
            run_id = %run.run_id,
            model = %model,
            "session initiated"
        );
        Ok(session)
    }

    /// Begin the next phase: replace the expected-file set wholesale, start
    /// a fresh run, and bump the phase counter.
    pub async fn new_phase(
        &self,
        session_id: &str,
        prompt: &str,
        expected: &[String],
        model: Option<&str>,
    ) -> Result<Session> {
        let prompt = validate::prompt(prompt)?;
        let expected = validate::expected_files(expected)?;
        let model = validate::model(model)?;
        self.purge();

        let session = self.resolve(session_id).await?;
        if session.status.is_terminal() {
            return Err(FlowError::Validation("session is closed".into()));
        }

        self.records
            .append_message(&session.id, "user", &prompt)
            .await?;
        let run_id = self.backend.start_run(&session.id, &model).await?;

        let mut transition_err = None;
        let updated = self
            .cache
            .update(&session.id, |s| {
                if let Err(err) = s.transition(SessionStatus::Running) {
                    transition_err = Some(err);
                    return;
                }
                s.expected_files = expected.clone();
                s.current_phase += 1;
                s.run_id = Some(run_id.clone());
            })
            .ok_or_else(|| FlowError::NotFound("session evicted mid-operation".into()))?;
        if let Some(err) = transition_err {
            return Err(err);
        }

        info!(
            session_id = %updated.id,
            phase = updated.current_phase,
            run_id = %run_id,
            "new phase started"
        );
        Ok(updated)
    }

    /// Relay a chat message into the session's transcript and start a run
    /// for the reply. Returns the new run id.
    pub async fn send_chat(
        &self,
        session_id: &str,
        message: &str,
        model: Option<&str>,
    ) -> Result<String> {
        let message = validate::chat_message(message)?;
        let model = validate::model(model)?;
        self.purge();

        let session = self.resolve(session_id).await?;
        if session.status.is_terminal() {
            return Err(FlowError::Validation("session is closed".into()));
        }

        self.records
            .append_message(&session.id, "user", &message)
            .await?;
        let run_id = self.backend.start_run(&session.id, &model).await?;

        let mut transition_err = None;
        self.cache.update(&session.id, |s| {
            if let Err(err) = s.transition(SessionStatus::Running) {
                transition_err = Some(err);
                return;
            }
            s.run_id = Some(run_id.clone());
        });
        if let Some(err) = transition_err {
            return Err(err);
        }

        info!(session_id = %session.id, run_id = %run_id, "chat relayed");
        Ok(run_id)
    }

    /// One file-poll pass: transfer whatever is new, report everything
    /// known. Individual file failures are logged and skipped; the pass
    /// itself only fails if the session cannot be resolved.
    pub async fn get_files(
        &self,
        session_id: &str,
        expected_hint: Option<&[String]>,
    ) -> Result<FileReport> {
        let session = self.resolve(session_id).await?;
        let expected = match expected_hint {
            Some(hint) if !hint.is_empty() => validate::expected_files(hint)?,
            _ => session.expected_files.clone(),
        };

        let fresh = self.registry.list_new(&session).await?;
        let mut newly_downloaded = Vec::new();
        for name in fresh {
            match self.registry.fetch(&session, &name, false).await {
                Ok(_) => newly_downloaded.push(name),
                Err(err) => {
                    warn!(
                        session_id = %session.id,
                        file = %name,
                        error = %err,
                        "file skipped this pass"
                    );
                }
            }
        }

        let file_statuses = self.registry.snapshot(&session.id);
        let all_files = file_statuses.iter().map(|s| s.name.clone()).collect();
        let summary = self.registry.summary(&session.id, &expected);
        Ok(FileReport {
            file_statuses,
            newly_downloaded,
            all_files,
            summary,
        })
    }

    /// Serve one file, from cache or sandbox.
    pub async fn download(&self, session_id: &str, file_name: &str) -> Result<FileRecord> {
        let session = self.resolve(session_id).await?;
        self.registry.fetch(&session, file_name, false).await
    }

    /// Close the session. Terminal and idempotent; remote resources are
    /// torn down separately, never as a side effect of closing.
    pub async fn close(&self, session_id: &str) -> Result<CloseOutcome> {
        let session = self.resolve(session_id).await?;

        let mut transition_err = None;
        let closed = self
            .cache
            .update(&session.id, |s| {
                if s.status.is_terminal() {
                    return;
                }
                if let Err(err) = s.transition(SessionStatus::Closed) {
                    transition_err = Some(err);
                }
            })
            .ok_or_else(|| FlowError::NotFound("session evicted mid-operation".into()))?;
        if let Some(err) = transition_err {
            return Err(err);
        }

        let final_files = self.registry.snapshot(&closed.id);
        let summary = self.registry.summary(&closed.id, &closed.expected_files);
        let description = summary.describe();
        info!(
            session_id = %closed.id,
            files = final_files.len(),
            "session closed"
        );
        Ok(CloseOutcome {
            session_id: closed.id,
            final_files,
            summary,
            description,
        })
    }

    /// Current session view without forcing any remote call beyond recovery.
    pub async fn status(&self, session_id: &str) -> Result<SessionOverview> {
        let session = self.resolve(session_id).await?;
        let files_summary = self.registry.summary(&session.id, &session.expected_files);
        Ok(SessionOverview {
            session_id: session.id.clone(),
            status: session.status,
            current_phase: session.current_phase,
            run_id: session.run_id,
            expected_files: session.expected_files,
            files_summary,
        })
    }

    pub async fn run_status(&self, run_id: &str) -> Result<RunState> {
        let run_id = validate::run_id(run_id)?;
        self.backend.run_status(&run_id).await
    }

    /// Status of the run driving the current phase. A terminal run moves the
    /// session to `AwaitingPhase`.
    pub async fn current_run_status(&self, session_id: &str) -> Result<RunState> {
        let session = self.resolve(session_id).await?;
        let run_id = session
            .run_id
            .ok_or_else(|| FlowError::NotFound("session has no active run".into()))?;
        let state = self.backend.run_status(&run_id).await?;
        if state.is_terminal() {
            self.mark_awaiting(&session.id);
        }
        Ok(state)
    }

    /// Run finished; hold the session until the next phase instruction.
    pub fn mark_awaiting(&self, session_id: &str) {
        self.cache.update(session_id, |s| {
            if s.status == SessionStatus::Running {
                s.status = SessionStatus::AwaitingPhase;
            }
        });
    }

    /// Stop a run, and its sandbox when one is named.
    pub async fn stop_run(&self, run_id: &str, sandbox_id: Option<&str>) -> Result<()> {
        let run_id = validate::run_id(run_id)?;
        self.backend.stop_run(&run_id).await?;
        if let Some(sandbox_id) = sandbox_id {
            self.backend.stop_sandbox(sandbox_id).await?;
        }
        info!(run_id = %run_id, "run stopped");
        Ok(())
    }

    /// Tear a sandbox down completely. Stopping is best effort; only the
    /// delete itself is allowed to fail the operation.
    pub async fn stop_and_delete(&self, run_id: &str, sandbox_id: &str) -> Result<()> {
        let run_id = validate::run_id(run_id)?;
        if let Err(err) = self.backend.stop_run(&run_id).await {
            warn!(run_id = %run_id, error = %err, "run stop failed before delete");
        }
        if let Err(err) = self.backend.stop_sandbox(sandbox_id).await {
            warn!(sandbox_id, error = %err, "sandbox stop failed before delete");
        }
        self.backend.delete_sandbox(sandbox_id).await?;
        info!(run_id = %run_id, sandbox_id, "sandbox deleted");
        Ok(())
    }

    pub async fn ensure_active(&self, unit_id: &str) -> Result<()> {
        self.backend.ensure_active(unit_id).await
    }

    pub async fn messages(
        &self,
        session_id: &str,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<StoredMessage>> {
        let session_id = validate::session_id(session_id)?;
        if limit == 0 || limit > 1000 {
            return Err(FlowError::Validation(
                "limit must be between 1 and 1000".into(),
            ));
        }
        self.records.list_messages(&session_id, offset, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedBackend, ScriptedRecords};

    fn manager_with(
        backend: ScriptedBackend,
        records: ScriptedRecords,
    ) -> (SessionManager, Arc<ScriptedBackend>, Arc<ScriptedRecords>) {
        let backend = Arc::new(backend);
        let records = Arc::new(records);
        let registry = Arc::new(FileRegistry::new(backend.clone()));
        let manager = SessionManager::new(
            CoreConfig::default(),
            backend.clone(),
            records.clone(),
            registry,
        );
        (manager, backend, records)
    }

    fn scripted() -> (SessionManager, Arc<ScriptedBackend>, Arc<ScriptedRecords>) {
        manager_with(
            ScriptedBackend::new().with_sandbox_file("out.txt", b"hello"),
            ScriptedRecords::new().with_default_linkage(),
        )
    }

    const PROMPT: &str = "build a small report about the quarterly numbers";

    #[tokio::test]
    async fn initiate_creates_running_session() {
        let (manager, backend, _) = scripted();
        let (session_id, run_id) = ScriptedBackend::ids();

        let session = manager
            .initiate(PROMPT, &["out.txt".to_string()], None)
            .await
            .unwrap();

        assert_eq!(session.id, session_id);
        assert_eq!(session.status, SessionStatus::Running);
        assert_eq!(session.current_phase, 1);
        assert_eq!(session.run_id.as_deref(), Some(run_id));
        assert_eq!(session.unit_id, "unit-1");
        assert_eq!(session.sandbox.id, "sbx-1");
        assert_eq!(backend.initiate_calls(), 1);

        let overview = manager.status(session_id).await.unwrap();
        assert_eq!(overview.status, SessionStatus::Running);
        assert_eq!(overview.expected_files, vec!["out.txt"]);
    }

    #[tokio::test]
    async fn initiate_validates_before_any_remote_call() {
        let (manager, backend, _) = scripted();

        let err = manager.initiate("too short", &[], None).await.unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)));

        let dup = vec!["a.txt".to_string(), "a.txt".to_string()];
        let err = manager.initiate(PROMPT, &dup, None).await.unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)));

        let err = manager
            .initiate(PROMPT, &[], Some("mystery-model"))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)));

        assert_eq!(backend.initiate_calls(), 0);
    }

    #[tokio::test]
    async fn initiate_failure_is_fatal_and_caches_nothing() {
        let (manager, backend, _) = scripted();
        backend.fail_initiate();

        let err = manager.initiate(PROMPT, &[], None).await.unwrap_err();
        assert!(matches!(err, FlowError::Unavailable(_)));

        let (session_id, _) = ScriptedBackend::ids();
        assert!(manager.cache.get(session_id).is_none());
    }

    #[tokio::test]
    async fn initiate_without_linkage_fails_internal() {
        let (manager, _, _) = manager_with(ScriptedBackend::new(), ScriptedRecords::new());

        let err = manager.initiate(PROMPT, &[], None).await.unwrap_err();
        assert!(matches!(err, FlowError::Internal(_)));
    }

    #[tokio::test]
    async fn new_phase_bumps_phase_and_replaces_expected() {
        let (manager, backend, records) = scripted();
        let (session_id, _) = ScriptedBackend::ids();
        manager
            .initiate(PROMPT, &["out.txt".to_string()], None)
            .await
            .unwrap();

        let session = manager
            .new_phase(
                session_id,
                "now produce the follow-up artifacts please",
                &["next.md".to_string()],
                None,
            )
            .await
            .unwrap();

        assert_eq!(session.current_phase, 2);
        assert_eq!(session.expected_files, vec!["next.md"]);
        assert_eq!(session.status, SessionStatus::Running);
        assert_eq!(backend.start_calls(), 1);
        assert_eq!(records.append_calls(), 1);
    }

    #[tokio::test]
    async fn new_phase_resumes_an_awaiting_session() {
        let (manager, _, _) = scripted();
        let (session_id, _) = ScriptedBackend::ids();
        manager.initiate(PROMPT, &[], None).await.unwrap();
        manager.mark_awaiting(session_id);

        let session = manager
            .new_phase(session_id, PROMPT, &[], None)
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Running);
        assert_eq!(session.current_phase, 2);
    }

    #[tokio::test]
    async fn closed_session_rejects_new_phase_and_chat() {
        let (manager, backend, _) = scripted();
        let (session_id, _) = ScriptedBackend::ids();
        manager.initiate(PROMPT, &[], None).await.unwrap();
        manager.close(session_id).await.unwrap();

        let err = manager
            .new_phase(session_id, PROMPT, &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)));

        let err = manager
            .send_chat(session_id, "hello again", None)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)));

        // Neither rejection started a run.
        assert_eq!(backend.start_calls(), 0);
    }

    #[tokio::test]
    async fn chat_records_the_new_run() {
        let (manager, _, records) = scripted();
        let (session_id, run_id) = ScriptedBackend::ids();
        manager.initiate(PROMPT, &[], None).await.unwrap();

        let returned = manager
            .send_chat(session_id, "tweak the header", None)
            .await
            .unwrap();
        assert_eq!(returned, run_id);
        assert_eq!(records.append_calls(), 1);

        let overview = manager.status(session_id).await.unwrap();
        assert_eq!(overview.run_id.as_deref(), Some(run_id));
    }

    #[tokio::test]
    async fn get_files_transfers_once_across_calls() {
        let (manager, backend, _) = scripted();
        let (session_id, _) = ScriptedBackend::ids();
        manager
            .initiate(PROMPT, &["out.txt".to_string()], None)
            .await
            .unwrap();

        let report = manager.get_files(session_id, None).await.unwrap();
        assert_eq!(report.newly_downloaded, vec!["out.txt"]);
        assert!(report.summary.complete);

        let report = manager.get_files(session_id, None).await.unwrap();
        assert!(report.newly_downloaded.is_empty());
        assert_eq!(report.all_files, vec!["out.txt"]);
        assert_eq!(backend.fetch_calls(), 1);

        // A file appearing later is picked up without re-transferring the rest.
        backend.add_sandbox_file("extra.md", b"# more");
        let report = manager.get_files(session_id, None).await.unwrap();
        assert_eq!(report.newly_downloaded, vec!["extra.md"]);
        assert_eq!(report.all_files, vec!["extra.md", "out.txt"]);
        assert_eq!(backend.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn get_files_skips_broken_files_and_continues() {
        let (manager, _, _) = manager_with(
            ScriptedBackend::new()
                .with_sandbox_file("good.txt", b"ok")
                .with_phantom_file("ghost.txt"),
            ScriptedRecords::new().with_default_linkage(),
        );
        let (session_id, _) = ScriptedBackend::ids();
        manager.initiate(PROMPT, &[], None).await.unwrap();

        let report = manager.get_files(session_id, None).await.unwrap();
        assert_eq!(report.newly_downloaded, vec!["good.txt"]);
        assert_eq!(report.all_files, vec!["good.txt"]);
    }

    #[tokio::test]
    async fn close_reports_final_files_and_is_idempotent() {
        let (manager, _, _) = scripted();
        let (session_id, _) = ScriptedBackend::ids();
        manager
            .initiate(PROMPT, &["out.txt".to_string()], None)
            .await
            .unwrap();
        manager.get_files(session_id, None).await.unwrap();

        let outcome = manager.close(session_id).await.unwrap();
        assert_eq!(outcome.final_files.len(), 1);
        assert!(outcome.summary.complete);
        assert_eq!(outcome.description, "1/1 expected files downloaded (5 B)");

        let overview = manager.status(session_id).await.unwrap();
        assert_eq!(overview.status, SessionStatus::Closed);

        // Closing again changes nothing.
        let outcome = manager.close(session_id).await.unwrap();
        assert_eq!(outcome.final_files.len(), 1);
    }

    #[tokio::test]
    async fn recovery_rebuilds_an_evicted_session() {
        let (manager, _, _) = scripted();
        let (session_id, _) = ScriptedBackend::ids();
        manager.initiate(PROMPT, &[], None).await.unwrap();

        manager.cache.remove(session_id);
        manager.registry.remove_session(session_id);

        let report = manager.get_files(session_id, None).await.unwrap();
        assert_eq!(report.newly_downloaded, vec!["out.txt"]);

        let overview = manager.status(session_id).await.unwrap();
        assert_eq!(overview.status, SessionStatus::Running);
        assert!(overview.expected_files.is_empty());
    }

    #[tokio::test]
    async fn unknown_session_reads_as_expired() {
        let (manager, _, records) = scripted();
        records.unlink(ScriptedBackend::ids().0);

        let err = manager
            .status("550e8400-e29b-41d4-a716-446655440000")
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::SessionExpired(_)));
    }

    #[tokio::test]
    async fn terminal_run_parks_the_session() {
        let (manager, backend, _) = scripted();
        let (session_id, _) = ScriptedBackend::ids();
        manager.initiate(PROMPT, &[], None).await.unwrap();

        backend.set_run_status("completed");
        let state = manager.current_run_status(session_id).await.unwrap();
        assert!(state.is_terminal());

        let overview = manager.status(session_id).await.unwrap();
        assert_eq!(overview.status, SessionStatus::AwaitingPhase);
    }

    #[tokio::test]
    async fn stop_and_delete_is_best_effort_about_stopping() {
        let (manager, backend, _) = scripted();
        let (_, run_id) = ScriptedBackend::ids();

        manager.stop_and_delete(run_id, "sbx-1").await.unwrap();
        assert_eq!(backend.stop_run_calls(), 1);
        assert_eq!(backend.stop_sandbox_calls(), 1);
        assert_eq!(backend.delete_sandbox_calls(), 1);
    }

    #[tokio::test]
    async fn messages_validates_limit() {
        let (manager, _, _) = scripted();
        let (session_id, _) = ScriptedBackend::ids();

        let err = manager.messages(session_id, 0, 0).await.unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)));
        let err = manager.messages(session_id, 0, 1001).await.unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)));
        assert!(manager.messages(session_id, 0, 100).await.is_ok());
    }
}
