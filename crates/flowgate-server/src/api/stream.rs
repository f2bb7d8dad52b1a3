//! Realtime stream multiplexer.
//!
//! One SSE connection carries frames from several independent producers:
//! a file poller, an optional chat relay, a heartbeat, and a watchdog that
//! caps the connection's lifetime. Producers write into one bounded channel;
//! the connection owns the receiving end. The first frame on any connection
//! is always `session_status`, enqueued before a single producer is spawned.
//!
//! Teardown runs exactly once no matter who triggers it: client disconnect
//! drops the [`ConnectionGuard`], the watchdog calls [`shutdown`] itself,
//! and every producer watches the shared cancellation token.

use crate::api::response::ApiError;
use crate::api::state::AppState;
use crate::config::StreamConfig;
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use flowgate_core::models::StreamEvent;
use flowgate_core::{FlowCore, FlowError, validate};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    pub session_id: String,
    /// Run to relay token-by-token; omitted for status-only connections.
    #[serde(default)]
    pub run_id: Option<String>,
}

/// Ties producer teardown to the connection. Dropping the guard (the client
/// went away) cancels every producer; the watchdog reaches the same path
/// through [`ConnectionGuard::shutdown`].
#[derive(Debug)]
pub struct ConnectionGuard {
    live: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl ConnectionGuard {
    pub fn shutdown(&self) {
        shutdown(&self.live, &self.cancel);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Flip liveness and cancel the token. Only the call that wins the flip
/// cancels; later calls are no-ops.
fn shutdown(live: &AtomicBool, cancel: &CancellationToken) {
    if live.swap(false, Ordering::SeqCst) {
        cancel.cancel();
        debug!("stream connection shut down");
    }
}

/// What a producer holds onto: the frame channel plus the shared teardown
/// state.
#[derive(Clone)]
struct ProducerLink {
    tx: mpsc::Sender<StreamEvent>,
    live: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl ProducerLink {
    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Send a frame unless teardown wins the race. Returns true when the
    /// producer must stop.
    async fn send_or_stop(&self, event: StreamEvent) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            sent = self.tx.send(event) => sent.is_err(),
        }
    }
}

// GET /api/agent/stream - Multiplexed SSE feed for one session
pub async fn stream_session(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let (rx, guard) = open_stream(
        state.core.clone(),
        query.session_id,
        query.run_id,
        state.config.stream.clone(),
    )
    .await?;

    // The guard rides inside the stream so that axum dropping the response
    // body tears the producers down.
    let stream = ReceiverStream::new(rx).map(move |event| {
        let _owner = &guard;
        Ok(to_sse_event(&event))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn to_sse_event(event: &StreamEvent) -> Event {
    match Event::default().json_data(event) {
        Ok(event) => event,
        Err(err) => {
            warn!(error = %err, "stream frame failed to serialize");
            Event::default().data(r#"{"type":"error","message":"frame serialization failed"}"#)
        }
    }
}

/// Resolve the session, enqueue the initial `session_status` frame, and
/// spawn the producers. Returns the consumer end plus the guard that owns
/// teardown.
pub async fn open_stream(
    core: Arc<FlowCore>,
    session_id: String,
    run_id: Option<String>,
    settings: StreamConfig,
) -> Result<(mpsc::Receiver<StreamEvent>, ConnectionGuard), FlowError> {
    let run_id = match run_id {
        Some(raw) => Some(validate::run_id(&raw)?),
        None => None,
    };
    let session = core.sessions.resolve(&session_id).await?;
    let session_id = session.id.clone();

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let live = Arc::new(AtomicBool::new(true));
    let cancel = CancellationToken::new();
    let link = ProducerLink {
        tx,
        live: live.clone(),
        cancel: cancel.clone(),
    };

    // First frame goes in before any producer can race it.
    if link.tx.send(StreamEvent::session_status(&session)).await.is_err() {
        return Err(FlowError::Internal(
            "stream closed before the first frame".into(),
        ));
    }

    spawn_file_poll(
        core.clone(),
        session_id.clone(),
        settings.file_poll_secs,
        link.clone(),
    );
    if let Some(run_id) = run_id {
        spawn_chat_relay(core, session_id, run_id, link.clone());
    }
    spawn_heartbeat(settings.heartbeat_secs, link.clone());
    spawn_watchdog(settings.timeout_secs, link);

    Ok((rx, ConnectionGuard { live, cancel }))
}

/// Poll the sandbox on an interval and report newly transferred files. The
/// first pass runs immediately; quiet passes emit nothing.
fn spawn_file_poll(core: Arc<FlowCore>, session_id: String, poll_secs: u64, link: ProducerLink) {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(poll_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = link.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !link.is_live() {
                break;
            }
            let event = match core.sessions.get_files(&session_id, None).await {
                Ok(report) if !report.newly_downloaded.is_empty() => {
                    StreamEvent::files_updated(report.file_statuses, report.newly_downloaded)
                }
                Ok(_) => continue,
                Err(err) => {
                    warn!(session_id = %session_id, error = %err, "file poll failed");
                    StreamEvent::error("file polling hit an error, will retry")
                }
            };
            if link.send_or_stop(event).await {
                break;
            }
        }
        debug!(session_id = %session_id, "file poll stopped");
    });
}

/// Relay one run's token stream as chat frames, then persist the full reply
/// and park the session for its next phase. Runs once per connection.
fn spawn_chat_relay(core: Arc<FlowCore>, session_id: String, run_id: String, link: ProducerLink) {
    tokio::spawn(async move {
        let mut tokens = match core.backend.stream_run(&run_id).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "token stream unavailable");
                let _ = link
                    .send_or_stop(StreamEvent::error("response stream unavailable"))
                    .await;
                return;
            }
        };

        let mut transcript = String::new();
        loop {
            let chunk = tokio::select! {
                _ = link.cancel.cancelled() => return,
                chunk = tokens.next() => chunk,
            };
            match chunk {
                Some(Ok(data)) => {
                    transcript.push_str(&data);
                    if link.send_or_stop(StreamEvent::chat_chunk(data)).await {
                        return;
                    }
                }
                Some(Err(err)) => {
                    warn!(run_id = %run_id, error = %err, "token stream failed");
                    let _ = link
                        .send_or_stop(StreamEvent::error("response stream interrupted"))
                        .await;
                    return;
                }
                None => break,
            }
        }

        // Clean end of stream: the reply is complete from this connection's
        // point of view.
        if !transcript.is_empty() {
            if let Err(err) = core
                .records
                .append_message(&session_id, "assistant", &transcript)
                .await
            {
                warn!(session_id = %session_id, error = %err, "failed to persist assistant reply");
            }
        }
        core.sessions.mark_awaiting(&session_id);
        let _ = link.send_or_stop(StreamEvent::chat_done()).await;
        debug!(session_id = %session_id, run_id = %run_id, "chat relay finished");
    });
}

/// Periodic keepalive. Unlike the file poll, the first beat waits a full
/// interval; the initial `session_status` frame already proved the
/// connection alive.
fn spawn_heartbeat(heartbeat_secs: u64, link: ProducerLink) {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(heartbeat_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = link.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !link.is_live() {
                break;
            }
            if link.send_or_stop(StreamEvent::heartbeat()).await {
                break;
            }
        }
    });
}

/// Hard cap on connection lifetime. Announces the timeout, then triggers
/// the shared teardown.
fn spawn_watchdog(timeout_secs: u64, link: ProducerLink) {
    tokio::spawn(async move {
        tokio::select! {
            _ = link.cancel.cancelled() => return,
            _ = sleep(Duration::from_secs(timeout_secs)) => {}
        }
        if !link.is_live() {
            return;
        }
        let _ = link
            .tx
            .send(StreamEvent::timeout("stream reached its maximum duration"))
            .await;
        shutdown(&link.live, &link.cancel);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::state::AppState;
    use crate::api::test_support::scripted_state;
    use flowgate_core::models::SessionStatus;
    use flowgate_core::testing::{ScriptedBackend, ScriptedRecords};

    fn settings(file_poll: u64, heartbeat: u64, timeout: u64) -> StreamConfig {
        StreamConfig {
            file_poll_secs: file_poll,
            heartbeat_secs: heartbeat,
            timeout_secs: timeout,
        }
    }

    async fn open(
        backend: ScriptedBackend,
        run_id: Option<&str>,
        settings: StreamConfig,
    ) -> (AppState, mpsc::Receiver<StreamEvent>, ConnectionGuard) {
        let (state, _backend, _records) =
            scripted_state(backend, ScriptedRecords::new().with_default_linkage());
        let (session_id, _) = ScriptedBackend::ids();
        let (rx, guard) = open_stream(
            state.core.clone(),
            session_id.to_string(),
            run_id.map(|id| id.to_string()),
            settings,
        )
        .await
        .unwrap();
        (state, rx, guard)
    }

    #[tokio::test(start_paused = true)]
    async fn first_frame_is_always_session_status() {
        let (_state, mut rx, _guard) = open(
            ScriptedBackend::new().with_sandbox_file("out.txt", b"hello"),
            None,
            settings(10, 30, 600),
        )
        .await;

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, StreamEvent::SessionStatus { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn file_poll_reports_new_files_once() {
        let (_state, mut rx, _guard) = open(
            ScriptedBackend::new().with_sandbox_file("out.txt", b"hello"),
            None,
            settings(10, 30, 600),
        )
        .await;

        rx.recv().await.unwrap(); // session_status

        let second = rx.recv().await.unwrap();
        match second {
            StreamEvent::FilesUpdated { new_files, .. } => {
                assert_eq!(new_files, vec!["out.txt"]);
            }
            other => panic!("expected files_updated, got {:?}", other),
        }

        // The next polls find nothing new; the heartbeat arrives first.
        let third = rx.recv().await.unwrap();
        assert!(matches!(third, StreamEvent::Heartbeat { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_fills_quiet_stretches() {
        let (_state, mut rx, _guard) =
            open(ScriptedBackend::new(), None, settings(3600, 30, 7200)).await;

        rx.recv().await.unwrap(); // session_status
        assert!(matches!(
            rx.recv().await.unwrap(),
            StreamEvent::Heartbeat { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            StreamEvent::Heartbeat { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_closes_an_idle_stream() {
        let (_state, mut rx, guard) =
            open(ScriptedBackend::new(), None, settings(3600, 3600, 5)).await;

        rx.recv().await.unwrap(); // session_status

        let frame = rx.recv().await.unwrap();
        assert!(matches!(frame, StreamEvent::StreamTimeout { .. }));
        assert!(rx.recv().await.is_none());
        assert!(!guard.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_guard_stops_every_producer() {
        let (_state, mut rx, guard) =
            open(ScriptedBackend::new(), None, settings(10, 30, 600)).await;

        rx.recv().await.unwrap(); // session_status
        drop(guard);

        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn chat_relay_ends_with_the_done_marker() {
        let (session_id, run_id) = ScriptedBackend::ids();
        let (state, mut rx, _guard) = open(
            ScriptedBackend::new().with_chunks(&["Hello ", "world"]),
            Some(run_id),
            settings(3600, 3600, 7200),
        )
        .await;

        rx.recv().await.unwrap(); // session_status

        assert_chat(&rx.recv().await.unwrap(), "Hello ", false);
        assert_chat(&rx.recv().await.unwrap(), "world", false);
        assert_chat(&rx.recv().await.unwrap(), "[DONE]", true);

        let messages = state
            .core
            .records
            .list_messages(session_id, 0, 10)
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "assistant");
        assert_eq!(messages[0].content, "Hello world");

        let overview = state.core.sessions.status(session_id).await.unwrap();
        assert_eq!(overview.status, SessionStatus::AwaitingPhase);
    }

    #[tokio::test(start_paused = true)]
    async fn relay_failure_surfaces_as_an_error_frame() {
        let backend = ScriptedBackend::new();
        backend.fail_stream();
        let (session_id, run_id) = ScriptedBackend::ids();
        let (state, mut rx, _guard) =
            open(backend, Some(run_id), settings(3600, 3600, 7200)).await;

        rx.recv().await.unwrap(); // session_status
        assert!(matches!(
            rx.recv().await.unwrap(),
            StreamEvent::Error { .. }
        ));

        // The run may still be live; the session is not parked.
        let overview = state.core.sessions.status(session_id).await.unwrap();
        assert_eq!(overview.status, SessionStatus::Running);
    }

    #[tokio::test]
    async fn malformed_run_id_is_rejected_up_front() {
        let (state, _backend, _records) = scripted_state(
            ScriptedBackend::new(),
            ScriptedRecords::new().with_default_linkage(),
        );
        let (session_id, _) = ScriptedBackend::ids();

        let err = open_stream(
            state.core.clone(),
            session_id.to_string(),
            Some("not-a-run".to_string()),
            settings(10, 30, 600),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, FlowError::Validation(_)));
    }

    #[tokio::test]
    async fn unknown_session_fails_before_any_frame() {
        let (state, _backend, _records) =
            scripted_state(ScriptedBackend::new(), ScriptedRecords::new());

        let err = open_stream(
            state.core.clone(),
            "550e8400-e29b-41d4-a716-446655440999".to_string(),
            None,
            settings(10, 30, 600),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, FlowError::SessionExpired(_)));
    }

    fn assert_chat(frame: &StreamEvent, expected: &str, complete: bool) {
        match frame {
            StreamEvent::ChatResponse {
                data, is_complete, ..
            } => {
                assert_eq!(data, expected);
                assert_eq!(*is_complete, complete);
            }
            other => panic!("expected chat_response, got {:?}", other),
        }
    }
}
