//! Deterministic in-memory collaborators for engine tests.
//!
//! `ScriptedBackend` and `ScriptedRecords` stand in for the remote services:
//! every answer is set up by the test, every call is counted, and failures
//! flip on and off without touching the network.

use crate::backend::{
    InitiatedRun, RecordStore, RunState, SandboxEntry, StoredMessage, TokenStream, WorkBackend,
};
use crate::error::{FlowError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

const TEST_SESSION_ID: &str = "550e8400-e29b-41d4-a716-446655440000";
const TEST_RUN_ID: &str = "7c9e6679-7425-40de-944b-e07fc1f90ae7";

#[derive(Default)]
struct BackendState {
    files: Vec<SandboxEntry>,
    contents: HashMap<String, Bytes>,
    run_status: String,
    chunks: Vec<String>,
}

/// Work backend whose sandbox contents and run answers are fixed up front.
pub struct ScriptedBackend {
    state: Mutex<BackendState>,
    fail_fetches: AtomicBool,
    fail_initiate: AtomicBool,
    fail_stream: AtomicBool,
    initiate_calls: AtomicUsize,
    start_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    list_calls: AtomicUsize,
    stop_run_calls: AtomicUsize,
    stop_sandbox_calls: AtomicUsize,
    delete_sandbox_calls: AtomicUsize,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BackendState {
                files: Vec::new(),
                contents: HashMap::new(),
                run_status: "running".to_string(),
                chunks: Vec::new(),
            }),
            fail_fetches: AtomicBool::new(false),
            fail_initiate: AtomicBool::new(false),
            fail_stream: AtomicBool::new(false),
            initiate_calls: AtomicUsize::new(0),
            start_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            stop_run_calls: AtomicUsize::new(0),
            stop_sandbox_calls: AtomicUsize::new(0),
            delete_sandbox_calls: AtomicUsize::new(0),
        }
    }

    /// Session and run ids every scripted initiate hands back.
    pub fn ids() -> (&'static str, &'static str) {
        (TEST_SESSION_ID, TEST_RUN_ID)
    }

    pub fn with_sandbox_file(self, name: &str, content: &[u8]) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.files.push(SandboxEntry {
                name: name.to_string(),
                path: format!("/workspace/{}", name),
                is_dir: false,
                size: content.len() as u64,
            });
            state
                .contents
                .insert(format!("/workspace/{}", name), Bytes::copy_from_slice(content));
        }
        self
    }

    pub fn with_sandbox_dir(self, name: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.files.push(SandboxEntry {
                name: name.to_string(),
                path: format!("/workspace/{}", name),
                is_dir: true,
                size: 0,
            });
        }
        self
    }

    /// A file that shows up in listings but has no content to fetch.
    pub fn with_phantom_file(self, name: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.files.push(SandboxEntry {
                name: name.to_string(),
                path: format!("/workspace/{}", name),
                is_dir: false,
                size: 1,
            });
        }
        self
    }

    pub fn with_chunks(self, chunks: &[&str]) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.chunks = chunks.iter().map(|c| c.to_string()).collect();
        }
        self
    }

    pub fn set_run_status(&self, status: &str) {
        self.state.lock().unwrap().run_status = status.to_string();
    }

    pub fn add_sandbox_file(&self, name: &str, content: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.files.push(SandboxEntry {
            name: name.to_string(),
            path: format!("/workspace/{}", name),
            is_dir: false,
            size: content.len() as u64,
        });
        state
            .contents
            .insert(format!("/workspace/{}", name), Bytes::copy_from_slice(content));
    }

    pub fn fail_fetches(&self) {
        self.fail_fetches.store(true, Ordering::SeqCst);
    }

    pub fn fail_initiate(&self) {
        self.fail_initiate.store(true, Ordering::SeqCst);
    }

    pub fn fail_stream(&self) {
        self.fail_stream.store(true, Ordering::SeqCst);
    }

    pub fn initiate_calls(&self) -> usize {
        self.initiate_calls.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn stop_run_calls(&self) -> usize {
        self.stop_run_calls.load(Ordering::SeqCst)
    }

    pub fn stop_sandbox_calls(&self) -> usize {
        self.stop_sandbox_calls.load(Ordering::SeqCst)
    }

    pub fn delete_sandbox_calls(&self) -> usize {
        self.delete_sandbox_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkBackend for ScriptedBackend {
    async fn initiate(&self, _prompt: &str, _model: &str) -> Result<InitiatedRun> {
        self.initiate_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_initiate.load(Ordering::SeqCst) {
            return Err(FlowError::Unavailable("scripted initiate failure".into()));
        }
        Ok(InitiatedRun {
            session_id: TEST_SESSION_ID.to_string(),
            run_id: TEST_RUN_ID.to_string(),
        })
    }

    async fn start_run(&self, _session_id: &str, _model: &str) -> Result<String> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        Ok(TEST_RUN_ID.to_string())
    }

    async fn run_status(&self, run_id: &str) -> Result<RunState> {
        let status = self.state.lock().unwrap().run_status.clone();
        Ok(RunState {
            run_id: run_id.to_string(),
            status,
            error: None,
        })
    }

    async fn list_files(&self, _sandbox_id: &str, _path: &str) -> Result<Vec<SandboxEntry>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().unwrap().files.clone())
    }

    async fn fetch_file(&self, _sandbox_id: &str, path: &str) -> Result<Bytes> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(FlowError::Unavailable("scripted fetch failure".into()));
        }
        self.state
            .lock()
            .unwrap()
            .contents
            .get(path)
            .cloned()
            .ok_or_else(|| FlowError::Unavailable(format!("no scripted content for {}", path)))
    }

    async fn stop_run(&self, _run_id: &str) -> Result<()> {
        self.stop_run_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_sandbox(&self, _sandbox_id: &str) -> Result<()> {
        self.stop_sandbox_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_sandbox(&self, _sandbox_id: &str) -> Result<()> {
        self.delete_sandbox_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ensure_active(&self, _unit_id: &str) -> Result<()> {
        Ok(())
    }

    async fn stream_run(&self, _run_id: &str) -> Result<TokenStream> {
        if self.fail_stream.load(Ordering::SeqCst) {
            return Err(FlowError::Unavailable("scripted stream failure".into()));
        }
        let chunks = self.state.lock().unwrap().chunks.clone();
        Ok(futures::stream::iter(chunks.into_iter().map(Ok)).boxed())
    }
}

/// Record store answering from in-memory maps.
#[derive(Default)]
pub struct ScriptedRecords {
    units: Mutex<HashMap<String, String>>,
    sandboxes: Mutex<HashMap<String, String>>,
    messages: Mutex<Vec<StoredMessage>>,
    append_calls: AtomicUsize,
}

impl ScriptedRecords {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire up the default scripted session to a unit and sandbox.
    pub fn with_default_linkage(self) -> Self {
        self.link(TEST_SESSION_ID, "unit-1", "sbx-1");
        self
    }

    pub fn link(&self, session_id: &str, unit_id: &str, sandbox_id: &str) {
        self.units
            .lock()
            .unwrap()
            .insert(session_id.to_string(), unit_id.to_string());
        self.sandboxes
            .lock()
            .unwrap()
            .insert(unit_id.to_string(), sandbox_id.to_string());
    }

    pub fn unlink(&self, session_id: &str) {
        self.units.lock().unwrap().remove(session_id);
    }

    pub fn append_calls(&self) -> usize {
        self.append_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordStore for ScriptedRecords {
    async fn unit_for_session(&self, session_id: &str) -> Result<Option<String>> {
        Ok(self.units.lock().unwrap().get(session_id).cloned())
    }

    async fn sandbox_for_unit(&self, unit_id: &str) -> Result<Option<String>> {
        Ok(self.sandboxes.lock().unwrap().get(unit_id).cloned())
    }

    async fn append_message(&self, _session_id: &str, role: &str, content: &str) -> Result<()> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        let mut messages = self.messages.lock().unwrap();
        let id = format!("msg-{}", messages.len() + 1);
        messages.push(StoredMessage {
            id,
            role: role.to_string(),
            content: content.to_string(),
            created_at: chrono::Utc::now().timestamp_millis(),
        });
        Ok(())
    }

    async fn list_messages(
        &self,
        _session_id: &str,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<StoredMessage>> {
        let messages = self.messages.lock().unwrap();
        Ok(messages
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}
