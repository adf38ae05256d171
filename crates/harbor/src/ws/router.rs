//! WebSocket connection handling and frame dispatch.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use harbor_protocol::{
    ClientFrame, FrameTarget, SendMessagePayload, ServerFrame, ShellInitPayload,
    ShellInputPayload, ShellResizePayload,
};
use log::{debug, info, warn};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::api::AppState;
use crate::shell::{ShellSession, Utf8CarryDecoder, spawn_shell};

/// Ping interval for keepalive.
const PING_INTERVAL_SECS: u64 = 30;

/// Size of the per-connection outbound buffer.
const OUTBOUND_BUFFER: usize = 64;

/// WebSocket close code for policy violations (auth failures).
const CLOSE_POLICY_VIOLATION: u16 = 1008;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    token: Option<String>,
}

/// Whether the connection survives the frame just handled.
enum Disposition {
    Continue,
    /// Close with 1008; the one unconditional way out of an auth failure.
    CloseUnauthorized,
}

/// WebSocket upgrade handler.
///
/// GET /ws?token=<bearer>
///
/// The token rides in the query because browsers cannot set headers on
/// `ws://` upgrades. A bad token still upgrades, then immediately closes
/// with 1008 so the client sees a policy violation rather than a dead TCP
/// connection.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let claims = query
        .token
        .as_deref()
        .ok_or(crate::auth::AuthError::MissingToken)
        .and_then(|token| state.auth.validate_token(token));

    match claims {
        Ok(claims) => {
            let user_id = claims.user_id().to_string();
            info!("WebSocket upgrade for user {}", user_id);
            ws.on_upgrade(move |socket| handle_connection(socket, state, user_id))
        }
        Err(err) => {
            warn!("WebSocket auth failed: {}", err);
            ws.on_upgrade(close_unauthorized)
        }
    }
}

async fn close_unauthorized(mut socket: WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_POLICY_VIOLATION,
            reason: "authentication failed".into(),
        })))
        .await;
}

/// Per-connection state: the shells this socket opened (keyed by the
/// client's channel id) and the agent sessions it is attached to. Each
/// attachment is mirrored by the session's attach count; the last detach
/// tears the session down.
#[derive(Default)]
struct ConnState {
    shells: HashMap<String, Arc<ShellSession>>,
    agent_sessions: HashSet<String>,
}

async fn handle_connection(socket: WebSocket, state: AppState, user_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerFrame>(OUTBOUND_BUFFER);

    // Writer task: the only place that touches the sink. Draining a bounded
    // channel here is what turns slow clients into backpressure upstream.
    let send_task = tokio::spawn(async move {
        let mut ping_interval =
            tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
        ping_interval.tick().await; // first tick is immediate
        loop {
            let frame = tokio::select! {
                frame = outbound_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = ping_interval.tick() => ServerFrame::ping(),
            };
            let json = match serde_json::to_string(&frame) {
                Ok(json) => json,
                Err(err) => {
                    warn!("Failed to serialize frame: {}", err);
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let _ = outbound_tx.send(ServerFrame::connected()).await;

    let mut conn = ConnState::default();

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let disposition =
                    handle_frame(&state, &user_id, &mut conn, &outbound_tx, text.as_str()).await;
                if matches!(disposition, Disposition::CloseUnauthorized) {
                    break;
                }
            }
            Ok(Message::Binary(_)) => {
                debug!("Ignoring binary frame from user {}", user_id);
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!("User {} closed WebSocket", user_id);
                break;
            }
            Err(err) => {
                warn!("WebSocket error for user {}: {}", user_id, err);
                break;
            }
        }
    }

    // Cleanup: detach from every agent session; the last connection out
    // cancels the in-flight turn, releases temp images, and drops the
    // registry entry. Shells are connection-private and die with the socket.
    for session_id in conn.agent_sessions {
        let Some(session) = state.registry.get_agent(&session_id).await else {
            continue;
        };
        if session.detach() == 0 {
            state.registry.remove_agent(&session_id).await;
            session.close().await;
        }
    }
    for shell in conn.shells.values() {
        shell.kill();
        state.registry.remove_shell(&shell.id).await;
    }

    send_task.abort();
    info!("WebSocket connection closed for user {}", user_id);
}

async fn handle_frame(
    state: &AppState,
    user_id: &str,
    conn: &mut ConnState,
    outbound: &mpsc::Sender<ServerFrame>,
    raw: &str,
) -> Disposition {
    let frame: ClientFrame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(err) => {
            debug!("Malformed frame from user {}: {}", user_id, err);
            let _ = outbound
                .send(ServerFrame::global_error("Malformed frame"))
                .await;
            return Disposition::Continue;
        }
    };

    let Some(target) = FrameTarget::parse(&frame.kind) else {
        let _ = outbound
            .send(ServerFrame::global_error(format!(
                "Unknown event type: {}",
                frame.kind
            )))
            .await;
        return Disposition::Continue;
    };

    match target {
        FrameTarget::Global { .. } => Disposition::Continue,
        FrameTarget::Session { id, op } if op == "send_message" => {
            handle_send_message(state, user_id, conn, outbound, &id, frame.data).await
        }
        FrameTarget::Session { id, op } => {
            let _ = outbound
                .send(ServerFrame::session_error(
                    &id,
                    format!("Unknown event type: session.{id}.{op}"),
                    serde_json::Value::Null,
                ))
                .await;
            Disposition::Continue
        }
        FrameTarget::Shell { id, op } => {
            handle_shell_frame(state, user_id, conn, outbound, &id, &op, frame.data).await
        }
    }
}

async fn handle_send_message(
    state: &AppState,
    user_id: &str,
    conn: &mut ConnState,
    outbound: &mpsc::Sender<ServerFrame>,
    session_id: &str,
    data: serde_json::Value,
) -> Disposition {
    let payload: SendMessagePayload = match serde_json::from_value(data) {
        Ok(payload) => payload,
        Err(err) => {
            let _ = outbound
                .send(ServerFrame::session_error(
                    session_id,
                    format!("Invalid send_message payload: {err}"),
                    serde_json::Value::Null,
                ))
                .await;
            return Disposition::Continue;
        }
    };

    // A registry hit whose token already tripped is a leftover from a close
    // that raced a reattach; replace it with a fresh session.
    let existing = state
        .registry
        .get_agent(session_id)
        .await
        .filter(|live| !live.cancel_token().is_cancelled());

    let live = match existing {
        Some(live) => {
            if live.user_id != user_id {
                warn!(
                    "User {} attempted to use session {} owned by {}",
                    user_id, session_id, live.user_id
                );
                return Disposition::CloseUnauthorized;
            }
            live
        }
        None => {
            let detail = match state.sessions.find_by_id(session_id).await {
                Ok(Some(detail)) => detail,
                Ok(None) => {
                    let _ = outbound
                        .send(ServerFrame::session_error(
                            session_id,
                            "Session not found",
                            serde_json::json!({ "code": "not_found" }),
                        ))
                        .await;
                    return Disposition::Continue;
                }
                Err(err) => {
                    warn!("Catalog lookup failed for {}: {:#}", session_id, err);
                    let _ = outbound
                        .send(ServerFrame::session_error(
                            session_id,
                            "Failed to look up session",
                            serde_json::Value::Null,
                        ))
                        .await;
                    return Disposition::Continue;
                }
            };
            if !detail.is_owned_by(user_id) {
                warn!(
                    "User {} attempted to join session {} owned by {}",
                    user_id, session_id, detail.user_id
                );
                return Disposition::CloseUnauthorized;
            }
            let live = crate::agent::AgentSession::new(
                session_id,
                user_id,
                detail.project_id.clone(),
                PathBuf::from(&detail.project_path),
            );
            state.registry.put_agent(live.clone()).await;
            live
        }
    };

    // Count this connection's attachment exactly once, whether the session
    // was created here or already live from another socket.
    if conn.agent_sessions.insert(session_id.to_string()) {
        live.attach();
    }

    state
        .engine
        .start_turn(live, payload, outbound.clone())
        .await;
    Disposition::Continue
}

async fn handle_shell_frame(
    state: &AppState,
    user_id: &str,
    conn: &mut ConnState,
    outbound: &mpsc::Sender<ServerFrame>,
    channel: &str,
    op: &str,
    data: serde_json::Value,
) -> Disposition {
    match op {
        "init" => {
            if conn.shells.contains_key(channel) {
                let _ = outbound
                    .send(ServerFrame::shell_error(channel, "Shell already initialized"))
                    .await;
                return Disposition::Continue;
            }
            let payload: ShellInitPayload = match serde_json::from_value(data) {
                Ok(payload) => payload,
                Err(err) => {
                    let _ = outbound
                        .send(ServerFrame::shell_error(
                            channel,
                            format!("Invalid init payload: {err}"),
                        ))
                        .await;
                    return Disposition::Continue;
                }
            };
            init_shell(state, user_id, conn, outbound, channel, payload).await;
            Disposition::Continue
        }
        "input" => {
            let payload: Result<ShellInputPayload, _> = serde_json::from_value(data);
            match (conn.shells.get(channel), payload) {
                (Some(shell), Ok(payload)) => {
                    if let Err(err) = shell.write_input(payload.data.into_bytes()).await {
                        let _ = outbound
                            .send(ServerFrame::shell_error(channel, format!("{err:#}")))
                            .await;
                    }
                }
                (None, _) => {
                    let _ = outbound
                        .send(ServerFrame::shell_error(channel, "Shell not initialized"))
                        .await;
                }
                (_, Err(err)) => {
                    let _ = outbound
                        .send(ServerFrame::shell_error(
                            channel,
                            format!("Invalid input payload: {err}"),
                        ))
                        .await;
                }
            }
            Disposition::Continue
        }
        "resize" => {
            let payload: Result<ShellResizePayload, _> = serde_json::from_value(data);
            match (conn.shells.get(channel), payload) {
                (Some(shell), Ok(payload)) => {
                    if let Err(err) = shell.resize(payload.cols, payload.rows) {
                        let _ = outbound
                            .send(ServerFrame::shell_error(channel, format!("{err:#}")))
                            .await;
                    }
                }
                (None, _) => {
                    let _ = outbound
                        .send(ServerFrame::shell_error(channel, "Shell not initialized"))
                        .await;
                }
                (_, Err(err)) => {
                    let _ = outbound
                        .send(ServerFrame::shell_error(
                            channel,
                            format!("Invalid resize payload: {err}"),
                        ))
                        .await;
                }
            }
            Disposition::Continue
        }
        other => {
            let _ = outbound
                .send(ServerFrame::shell_error(
                    channel,
                    format!("Unknown event type: shell.{channel}.{other}"),
                ))
                .await;
            Disposition::Continue
        }
    }
}

async fn init_shell(
    state: &AppState,
    user_id: &str,
    conn: &mut ConnState,
    outbound: &mpsc::Sender<ServerFrame>,
    channel: &str,
    payload: ShellInitPayload,
) {
    let project = match state.projects.get(&payload.project_id).await {
        Ok(Some(project)) => project,
        Ok(None) => {
            let _ = outbound
                .send(ServerFrame::shell_error(channel, "Project not found"))
                .await;
            return;
        }
        Err(err) => {
            warn!("Project lookup failed: {:#}", err);
            let _ = outbound
                .send(ServerFrame::shell_error(channel, "Failed to look up project"))
                .await;
            return;
        }
    };

    let spawned = match spawn_shell(
        &project.id,
        user_id,
        std::path::Path::new(&project.path),
        payload.cols,
        payload.rows,
    ) {
        Ok(spawned) => spawned,
        Err(err) => {
            warn!("Failed to spawn shell for user {}: {:#}", user_id, err);
            let _ = outbound
                .send(ServerFrame::shell_error(
                    channel,
                    format!("Failed to start shell: {err:#}"),
                ))
                .await;
            return;
        }
    };

    let shell = spawned.session.clone();
    state.registry.put_shell(shell.clone()).await;
    conn.shells.insert(channel.to_string(), shell.clone());

    let _ = outbound
        .send(ServerFrame::shell_initialized(channel, &shell.id))
        .await;

    // Pump task: PTY chunks out in emission order, then exactly one exit
    // frame once the child is reaped. The carry decoder keeps multi-byte
    // characters split across read chunks intact.
    let pump_outbound = outbound.clone();
    let pump_channel = channel.to_string();
    let pump_registry = state.registry.clone();
    let mut output_rx = spawned.output_rx;
    let exit_rx = spawned.exit_rx;
    tokio::spawn(async move {
        let mut decoder = Utf8CarryDecoder::new();
        while let Some(chunk) = output_rx.recv().await {
            let data = decoder.push(&chunk);
            if data.is_empty() {
                continue;
            }
            if pump_outbound
                .send(ServerFrame::shell_output(&pump_channel, &data))
                .await
                .is_err()
            {
                break;
            }
        }
        let tail = decoder.finish();
        if !tail.is_empty() {
            let _ = pump_outbound
                .send(ServerFrame::shell_output(&pump_channel, &tail))
                .await;
        }
        let exit_code = exit_rx.await.ok();
        let _ = pump_outbound
            .send(ServerFrame::shell_exit(&pump_channel, exit_code, None))
            .await;
        pump_registry.remove_shell(&shell.id).await;
        debug!("Shell {} finished", shell.id);
    });
}
