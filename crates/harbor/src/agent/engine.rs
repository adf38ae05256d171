//! Per-session turn execution.
//!
//! One turn at a time per session: spawn the agent CLI, relay its JSONL
//! stream to the client, reconcile the session log on exit, and release the
//! temp image directory on every path out.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use harbor_protocol::{SendMessagePayload, ServerFrame};
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::HarborConfig;
use crate::catalog::SessionRepository;
use crate::runner::{OutputChunk, RunOutcome, RunSpec, RunStatus, run_streaming};
use crate::sessionlog;
use crate::stream::JsonlParser;

use super::args::TurnCommand;
use super::images::{TempImageDir, write_turn_images};

/// Size of the child-output chunk channel.
const CHUNK_BUFFER: usize = 64;

/// Live state of one connected agent session.
pub struct AgentSession {
    pub session_id: String,
    pub user_id: String,
    pub project_id: String,
    pub project_path: PathBuf,
    /// Set while a turn is in flight; a second `send_message` is rejected.
    busy: AtomicBool,
    /// Connections currently attached. The session is deregistered and
    /// cancelled only when the last one detaches.
    attached: AtomicUsize,
    /// Cancelled on socket close or shutdown; propagates to the child.
    cancel: CancellationToken,
    /// The in-flight turn's temp image dir, if any.
    temp_images: Mutex<Option<Arc<TempImageDir>>>,
}

impl AgentSession {
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        project_id: impl Into<String>,
        project_path: impl Into<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            project_id: project_id.into(),
            project_path: project_path.into(),
            busy: AtomicBool::new(false),
            attached: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
            temp_images: Mutex::new(None),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    fn try_begin_turn(&self) -> bool {
        !self.busy.swap(true, Ordering::SeqCst)
    }

    fn end_turn(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Record one more attached connection; returns the new count.
    pub fn attach(&self) -> usize {
        self.attached.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Record one detached connection; returns the remaining count.
    /// Saturates at zero so an unbalanced caller cannot wrap.
    pub fn detach(&self) -> usize {
        self.attached
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map(|prev| prev - 1)
            .unwrap_or(0)
    }

    pub fn attached_count(&self) -> usize {
        self.attached.load(Ordering::SeqCst)
    }

    /// Cancel the in-flight child (if any) and release the temp images.
    /// Safe to call from any path out of the session; cleanup runs once.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.release_temp_images().await;
    }

    async fn stash_temp_images(&self, images: Option<Arc<TempImageDir>>) {
        *self.temp_images.lock().await = images;
    }

    async fn release_temp_images(&self) {
        let images = self.temp_images.lock().await.take();
        if let Some(images) = images {
            images.cleanup().await;
        }
    }
}

impl std::fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSession")
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("busy", &self.is_busy())
            .finish_non_exhaustive()
    }
}

/// Turn executor shared by all sessions.
#[derive(Clone)]
pub struct AgentEngine {
    config: Arc<HarborConfig>,
    sessions: SessionRepository,
}

impl AgentEngine {
    pub fn new(config: Arc<HarborConfig>, sessions: SessionRepository) -> Self {
        Self { config, sessions }
    }

    /// Start a turn for `session`, streaming frames to `outbound`.
    ///
    /// Rejects with a `busy` error frame when a turn is already in flight.
    /// The turn itself runs as a detached task; `message_complete` (or the
    /// turn's `error` frame) is always its final frame.
    pub async fn start_turn(
        &self,
        session: Arc<AgentSession>,
        payload: SendMessagePayload,
        outbound: mpsc::Sender<ServerFrame>,
    ) {
        if !session.try_begin_turn() {
            debug!(
                "Rejecting send_message for busy session {}",
                session.session_id
            );
            let _ = outbound
                .send(ServerFrame::session_error(
                    &session.session_id,
                    "A message is already being processed for this session",
                    serde_json::json!({ "code": "busy" }),
                ))
                .await;
            return;
        }

        let engine = self.clone();
        let turn_session = session.clone();
        let turn_outbound = outbound.clone();
        let handle = tokio::spawn(async move {
            engine
                .run_turn(turn_session.clone(), payload, turn_outbound)
                .await;
            turn_session.end_turn();
        });

        // Session boundary: a panicking turn must not wedge the session or
        // take the process down with it.
        tokio::spawn(async move {
            if let Err(err) = handle.await
                && err.is_panic()
            {
                error!("Turn task for session {} panicked", session.session_id);
                session.release_temp_images().await;
                session.end_turn();
                let _ = outbound
                    .send(ServerFrame::session_error(
                        &session.session_id,
                        "Internal error while processing the message",
                        Value::Null,
                    ))
                    .await;
            }
        });
    }

    async fn run_turn(
        &self,
        session: Arc<AgentSession>,
        payload: SendMessagePayload,
        outbound: mpsc::Sender<ServerFrame>,
    ) {
        let sid = session.session_id.clone();

        let temp_images = match write_turn_images(&session.project_path, &payload.images).await {
            Ok(images) => images.map(Arc::new),
            Err(err) => {
                warn!("Failed to write turn images for session {}: {:#}", sid, err);
                let _ = outbound
                    .send(ServerFrame::session_error(
                        &sid,
                        "Failed to prepare attached images",
                        serde_json::json!({ "error": format!("{err:#}") }),
                    ))
                    .await;
                return;
            }
        };
        session.stash_temp_images(temp_images.clone()).await;

        let spec = self.build_run_spec(&session, &payload, temp_images.as_deref());
        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_BUFFER);
        let cancel = session.cancel_token().child_token();
        let runner = tokio::spawn(run_streaming(spec, chunk_tx, cancel));

        // Relay parsed events as they arrive; the awaited socket write is the
        // backpressure point.
        let events = relay_stream(&sid, chunk_rx, &outbound).await;

        let outcome = match runner.await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("Runner task for session {} failed: {}", sid, err);
                session.release_temp_images().await;
                let _ = outbound
                    .send(ServerFrame::session_error(
                        &sid,
                        "Agent process supervision failed",
                        Value::Null,
                    ))
                    .await;
                return;
            }
        };

        // Guaranteed release before the turn's final event.
        session.release_temp_images().await;

        if !outcome.status.is_success() {
            let _ = outbound.send(turn_error_frame(&sid, &outcome)).await;
            return;
        }

        // A zero exit code is not the whole story: the CLI reports failures
        // like hitting max turns in the final record with exit 0.
        if let Some(reason) = final_record_error(&events) {
            warn!("Session {} final record reported an error: {}", sid, reason);
            let _ = outbound
                .send(in_band_error_frame(&sid, &reason, &outcome))
                .await;
            return;
        }

        self.finish_turn(&session, &outcome, events, &outbound).await;
    }

    fn build_run_spec(
        &self,
        session: &AgentSession,
        payload: &SendMessagePayload,
        temp_images: Option<&TempImageDir>,
    ) -> RunSpec {
        let mut command = TurnCommand::new(payload.content.clone());
        command.session_id = Some(session.session_id.clone());
        command.resume = payload.options.resume;
        command.continue_conversation = payload.options.continue_conversation;
        command.model = payload.options.model.clone();
        command.permission_mode = payload.options.permission_mode.clone();
        command.dangerously_skip_permissions = payload.options.dangerously_skip_permissions;
        command.allowed_tools = payload.options.allowed_tools.clone();
        command.disallowed_tools = payload.options.disallowed_tools.clone();
        if let Some(images) = temp_images {
            command.images = images.paths().to_vec();
        }

        RunSpec {
            program: PathBuf::from(self.config.agent_binary()),
            args: command.build_args(),
            cwd: session.project_path.clone(),
            env: HashMap::new(),
            timeout: self.config.turn_timeout(),
        }
    }

    async fn finish_turn(
        &self,
        session: &AgentSession,
        outcome: &RunOutcome,
        events: Vec<Value>,
        outbound: &mpsc::Sender<ServerFrame>,
    ) {
        let sid = &session.session_id;
        let log_path = sessionlog::session_file_path(
            &self.config.agent_home(),
            &self.config.agent.name,
            &session.project_path.to_string_lossy(),
            sid,
        );

        let metadata = match sessionlog::reconcile_file(&log_path) {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!("Reconciliation failed for session {}: {:#}", sid, err);
                let _ = outbound
                    .send(ServerFrame::session_error(
                        sid,
                        "Failed to reconcile session log",
                        serde_json::json!({ "error": format!("{err:#}") }),
                    ))
                    .await;
                return;
            }
        };

        if let Err(err) = self
            .sessions
            .upsert(sid, &session.project_id, &session.user_id, &metadata)
            .await
        {
            warn!("Catalog update failed for session {}: {:#}", sid, err);
        }

        info!(
            "Turn complete for session {}: {} events, {} messages, {}ms",
            sid,
            events.len(),
            metadata.message_count,
            outcome.duration.as_millis()
        );

        let metadata_json = serde_json::to_value(&metadata).unwrap_or(Value::Null);
        let _ = outbound
            .send(ServerFrame::message_complete(sid, metadata_json, &events))
            .await;
    }
}

/// Drain the child's output, relaying each completed JSONL record in order.
/// Returns the full ordered event list for the `message_complete` payload.
async fn relay_stream(
    session_id: &str,
    mut chunks: mpsc::Receiver<OutputChunk>,
    outbound: &mpsc::Sender<ServerFrame>,
) -> Vec<Value> {
    let mut parser = JsonlParser::new();
    let mut all_events = Vec::new();
    let mut assistant_text = String::new();

    while let Some(chunk) = chunks.recv().await {
        let bytes = match chunk {
            OutputChunk::Stdout(bytes) => bytes,
            // stderr is diagnostics only; it is retained in the run outcome.
            OutputChunk::Stderr(_) => continue,
        };
        let events = parser.push(&bytes);
        if events.is_empty() {
            continue;
        }
        accumulate_assistant_text(&events, &mut assistant_text);
        let frame = ServerFrame::stream_output(session_id, &events);
        all_events.extend(events);
        if outbound.send(frame).await.is_err() {
            // Client is gone; keep draining so the child can finish or be
            // cancelled by the close path.
            continue;
        }
    }

    let trailing = parser.finish();
    if !trailing.is_empty() {
        accumulate_assistant_text(&trailing, &mut assistant_text);
        let frame = ServerFrame::stream_output(session_id, &trailing);
        all_events.extend(trailing);
        let _ = outbound.send(frame).await;
    }

    if !assistant_text.is_empty() {
        debug!(
            "Session {} assistant text: {} chars",
            session_id,
            assistant_text.chars().count()
        );
    }

    all_events
}

/// Pull assistant text out of streamed records for observability.
fn accumulate_assistant_text(events: &[Value], text: &mut String) {
    for event in events {
        if event.get("type").and_then(Value::as_str) != Some("assistant") {
            continue;
        }
        let content = event
            .get("message")
            .and_then(|m| m.get("content"))
            .or_else(|| event.get("content"));
        match content {
            Some(Value::String(s)) => text.push_str(s),
            Some(Value::Array(blocks)) => {
                for block in blocks {
                    if block.get("type").and_then(Value::as_str) == Some("text")
                        && let Some(s) = block.get("text").and_then(Value::as_str)
                    {
                        text.push_str(s);
                    }
                }
            }
            _ => {}
        }
    }
}

/// An error reported in-band by the final streamed record: `is_error`, a
/// `status` of `error`, or a `result` record with a non-`success` subtype.
fn final_record_error(events: &[Value]) -> Option<String> {
    let last = events.last()?;

    let flagged = last.get("is_error").and_then(Value::as_bool) == Some(true)
        || last.get("status").and_then(Value::as_str) == Some("error");
    let failed_result = last.get("type").and_then(Value::as_str) == Some("result")
        && matches!(
            last.get("subtype").and_then(Value::as_str),
            Some(subtype) if subtype != "success"
        );
    if !flagged && !failed_result {
        return None;
    }

    let reason = last
        .get("error")
        .and_then(Value::as_str)
        .or_else(|| last.get("result").and_then(Value::as_str))
        .or_else(|| last.get("subtype").and_then(Value::as_str))
        .unwrap_or("agent reported an error");
    Some(reason.to_string())
}

fn in_band_error_frame(session_id: &str, reason: &str, outcome: &RunOutcome) -> ServerFrame {
    ServerFrame::session_error(
        session_id,
        "Agent reported an error",
        serde_json::json!({
            "code": "child_error",
            "reason": reason,
            "exitCode": outcome.status.exit_code(),
            "stderr": outcome.stderr,
            "stdout": outcome.stdout,
            "duration": outcome.duration.as_millis() as u64,
        }),
    )
}

fn turn_error_frame(session_id: &str, outcome: &RunOutcome) -> ServerFrame {
    let (message, code) = match outcome.status {
        RunStatus::TimedOut => ("Agent turn timed out", "child_timeout"),
        RunStatus::SpawnFailed => ("Failed to launch the agent CLI", "spawn_failed"),
        RunStatus::Signaled(_) => ("Agent process was terminated", "child_signaled"),
        RunStatus::Exited(_) => ("Agent exited with an error", "child_exit_nonzero"),
    };
    ServerFrame::session_error(
        session_id,
        message,
        serde_json::json!({
            "code": code,
            "exitCode": outcome.status.exit_code(),
            "stderr": outcome.stderr,
            "stdout": outcome.stdout,
            "duration": outcome.duration.as_millis() as u64,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_flag_is_exclusive() {
        let session = AgentSession::new("s1", "u1", "p1", "/tmp");
        assert!(session.try_begin_turn());
        assert!(!session.try_begin_turn());
        session.end_turn();
        assert!(session.try_begin_turn());
    }

    #[test]
    fn attach_count_balances_and_saturates() {
        let session = AgentSession::new("s1", "u1", "p1", "/tmp");
        assert_eq!(session.attach(), 1);
        assert_eq!(session.attach(), 2);
        assert_eq!(session.detach(), 1);
        assert_eq!(session.detach(), 0);
        // Unbalanced detach must not wrap.
        assert_eq!(session.detach(), 0);
        assert_eq!(session.attached_count(), 0);
    }

    #[test]
    fn error_frame_carries_details() {
        let outcome = RunOutcome {
            status: RunStatus::Exited(2),
            duration: std::time::Duration::from_millis(150),
            stdout: "partial".to_string(),
            stderr: "boom".to_string(),
        };
        let frame = turn_error_frame("s1", &outcome);
        assert_eq!(frame.kind, "session.s1.error");
        assert_eq!(frame.data["details"]["exitCode"], 2);
        assert_eq!(frame.data["details"]["stderr"], "boom");
        assert_eq!(frame.data["details"]["code"], "child_exit_nonzero");
    }

    #[test]
    fn timeout_frame_has_no_exit_code() {
        let outcome = RunOutcome {
            status: RunStatus::TimedOut,
            duration: std::time::Duration::from_secs(600),
            stdout: String::new(),
            stderr: String::new(),
        };
        let frame = turn_error_frame("s1", &outcome);
        assert_eq!(frame.data["details"]["code"], "child_timeout");
        assert!(frame.data["details"]["exitCode"].is_null());
    }

    #[test]
    fn final_result_with_error_subtype_is_detected() {
        let events = vec![
            serde_json::json!({"type":"assistant","message":{"content":"..."}}),
            serde_json::json!({"type":"result","subtype":"error_max_turns","is_error":true}),
        ];
        assert_eq!(
            final_record_error(&events).as_deref(),
            Some("error_max_turns")
        );
    }

    #[test]
    fn final_record_status_error_is_detected() {
        let events = vec![serde_json::json!({"type":"result","status":"error","error":"boom"})];
        assert_eq!(final_record_error(&events).as_deref(), Some("boom"));
    }

    #[test]
    fn successful_result_is_not_an_error() {
        let events = vec![
            serde_json::json!({"type":"result","subtype":"success","result":"done"}),
        ];
        assert!(final_record_error(&events).is_none());
        assert!(final_record_error(&[]).is_none());
    }

    #[test]
    fn error_flag_only_counts_on_the_final_record() {
        let events = vec![
            serde_json::json!({"type":"result","is_error":true}),
            serde_json::json!({"type":"result","subtype":"success"}),
        ];
        assert!(final_record_error(&events).is_none());
    }

    #[test]
    fn assistant_text_accumulates_across_events() {
        let events = vec![
            serde_json::json!({"type":"assistant","message":{"content":[{"type":"text","text":"Hel"}]}}),
            serde_json::json!({"type":"user","message":{"content":"ignored"}}),
            serde_json::json!({"type":"assistant","message":{"content":"lo"}}),
        ];
        let mut text = String::new();
        accumulate_assistant_text(&events, &mut text);
        assert_eq!(text, "Hello");
    }
}
