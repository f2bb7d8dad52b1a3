//! HTTP client for the work backend.
//!
//! Runs start through a multipart form, files come back as raw bytes, and
//! response tokens arrive over a server-sent-event stream that is split on
//! blank lines and parsed frame by frame.

use crate::backend::{InitiatedRun, RunState, SandboxEntry, ServiceAuth, TokenStream, WorkBackend};
use crate::config::CoreConfig;
use crate::error::{FlowError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct InitiateResponse {
    thread_id: String,
    agent_run_id: String,
}

#[derive(Debug, Deserialize)]
struct StartRunResponse {
    agent_run_id: String,
}

#[derive(Debug, Deserialize)]
struct RunStatusResponse {
    id: Option<String>,
    status: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListFilesResponse {
    #[serde(default)]
    files: Vec<FileEntry>,
}

#[derive(Debug, Deserialize)]
struct FileEntry {
    name: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    is_dir: bool,
    #[serde(default)]
    size: u64,
}

/// One frame of the run's SSE response stream.
#[derive(Debug, Deserialize)]
struct StreamFrame {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

pub struct HttpWorkBackend {
    client: reqwest::Client,
    /// Client without a total-request timeout; token streams outlive the
    /// per-call deadline the regular client enforces.
    stream_client: reqwest::Client,
    base_url: String,
    auth: Arc<ServiceAuth>,
}

impl HttpWorkBackend {
    pub fn new(
        client: reqwest::Client,
        stream_client: reqwest::Client,
        config: &CoreConfig,
        auth: Arc<ServiceAuth>,
    ) -> Self {
        Self {
            client,
            stream_client,
            base_url: config.backend_url.trim_end_matches('/').to_string(),
            auth,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    async fn check(&self, response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            // Stale service credential; the next call re-exchanges.
            self.auth.invalidate().await;
        }
        let body = response.text().await.unwrap_or_default();
        warn!(%status, what, "work backend call failed");
        Err(FlowError::Unavailable(format!(
            "{} failed with status {}: {}",
            what, status, body
        )))
    }
}

#[async_trait]
impl WorkBackend for HttpWorkBackend {
    async fn initiate(&self, prompt: &str, model: &str) -> Result<InitiatedRun> {
        let token = self.auth.token().await?;
        let form = reqwest::multipart::Form::new()
            .text("prompt", prompt.to_string())
            .text("model_name", model.to_string())
            .text("enable_thinking", "false")
            .text("reasoning_effort", "low")
            .text("stream", "true");

        let response = self
            .client
            .post(self.url("/agent/initiate"))
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await?;
        let response = self.check(response, "session initiation").await?;
        let body: InitiateResponse = response.json().await?;
        debug!(session_id = %body.thread_id, run_id = %body.agent_run_id, "session initiated");
        Ok(InitiatedRun {
            session_id: body.thread_id,
            run_id: body.agent_run_id,
        })
    }

    async fn start_run(&self, session_id: &str, model: &str) -> Result<String> {
        let token = self.auth.token().await?;
        let response = self
            .client
            .post(self.url(&format!("/thread/{}/agent/start", session_id)))
            .bearer_auth(token)
            .json(&serde_json::json!({
                "model_name": model,
                "enable_thinking": false,
                "stream": true,
            }))
            .send()
            .await?;
        let response = self.check(response, "run start").await?;
        let body: StartRunResponse = response.json().await?;
        Ok(body.agent_run_id)
    }

    async fn run_status(&self, run_id: &str) -> Result<RunState> {
        let token = self.auth.token().await?;
        let response = self
            .client
            .get(self.url(&format!("/agent-run/{}", run_id)))
            .bearer_auth(token)
            .send()
            .await?;
        let response = self.check(response, "run status").await?;
        let body: RunStatusResponse = response.json().await?;
        Ok(RunState {
            run_id: body.id.unwrap_or_else(|| run_id.to_string()),
            status: body.status,
            error: body.error,
        })
    }

    async fn list_files(&self, sandbox_id: &str, path: &str) -> Result<Vec<SandboxEntry>> {
        let token = self.auth.token().await?;
        let response = self
            .client
            .get(self.url(&format!("/sandboxes/{}/files", sandbox_id)))
            .query(&[("path", path)])
            .bearer_auth(token)
            .send()
            .await;

        // A failed listing means an idle or restarting workspace, not a
        // poisoned session; callers poll again on the next tick.
        let response = match response {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!(status = %response.status(), sandbox_id, "file listing unavailable");
                return Ok(Vec::new());
            }
            Err(err) => {
                debug!(error = %err, sandbox_id, "file listing unavailable");
                return Ok(Vec::new());
            }
        };

        let body: ListFilesResponse = response.json().await.unwrap_or(ListFilesResponse {
            files: Vec::new(),
        });
        Ok(body
            .files
            .into_iter()
            .map(|entry| SandboxEntry {
                path: entry
                    .path
                    .unwrap_or_else(|| format!("{}/{}", path.trim_end_matches('/'), entry.name)),
                name: entry.name,
                is_dir: entry.is_dir,
                size: entry.size,
            })
            .collect())
    }

    async fn fetch_file(&self, sandbox_id: &str, path: &str) -> Result<Bytes> {
        let token = self.auth.token().await?;
        let response = self
            .client
            .get(self.url(&format!("/sandboxes/{}/files/content", sandbox_id)))
            .query(&[("path", path)])
            .bearer_auth(token)
            .send()
            .await?;
        let response = self.check(response, "file fetch").await?;
        Ok(response.bytes().await?)
    }

    async fn stop_run(&self, run_id: &str) -> Result<()> {
        let token = self.auth.token().await?;
        let response = self
            .client
            .post(self.url(&format!("/agent-run/{}/stop", run_id)))
            .bearer_auth(token)
            .send()
            .await?;
        self.check(response, "run stop").await?;
        Ok(())
    }

    async fn stop_sandbox(&self, sandbox_id: &str) -> Result<()> {
        let token = self.auth.token().await?;
        let response = self
            .client
            .post(self.url(&format!("/sandboxes/{}/stop", sandbox_id)))
            .bearer_auth(token)
            .send()
            .await?;
        self.check(response, "sandbox stop").await?;
        Ok(())
    }

    async fn delete_sandbox(&self, sandbox_id: &str) -> Result<()> {
        let token = self.auth.token().await?;
        let response = self
            .client
            .delete(self.url(&format!("/sandboxes/{}", sandbox_id)))
            .bearer_auth(token)
            .send()
            .await?;
        self.check(response, "sandbox delete").await?;
        Ok(())
    }

    async fn ensure_active(&self, unit_id: &str) -> Result<()> {
        let token = self.auth.token().await?;
        let response = self
            .client
            .post(self.url(&format!("/project/{}/sandbox/ensure-active", unit_id)))
            .bearer_auth(token)
            .send()
            .await?;
        self.check(response, "sandbox ensure-active").await?;
        Ok(())
    }

    async fn stream_run(&self, run_id: &str) -> Result<TokenStream> {
        let token = self.auth.token().await?;
        let response = self
            .stream_client
            .get(self.url(&format!("/agent-run/{}/stream", run_id)))
            .bearer_auth(token)
            .send()
            .await?;
        let response = self.check(response, "run stream").await?;

        let stream = async_stream::stream! {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk_result) = byte_stream.next().await {
                let chunk = match chunk_result {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        yield Err(FlowError::Unavailable(format!("stream error: {}", err)));
                        return;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // Process complete SSE events from the buffer
                while let Some(pos) = buffer.find("\n\n") {
                    let event_str = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();

                    for line in event_str.lines() {
                        let Some(data) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        if data.trim().is_empty() {
                            continue;
                        }

                        let frame: StreamFrame = match serde_json::from_str(data) {
                            Ok(frame) => frame,
                            Err(_) => continue,
                        };

                        if let Some(status) = frame.status.as_deref() {
                            if matches!(status, "completed" | "stopped" | "failed") {
                                return;
                            }
                        }

                        if frame.kind.as_deref() == Some("assistant") {
                            if let Some(content) = frame.content {
                                if !content.is_empty() {
                                    yield Ok(content);
                                }
                            }
                        }
                    }
                }
            }
        };

        Ok(stream.boxed())
    }
}
