//! REST handlers.
//!
//! A thin read/management surface next to the WebSocket: project sync and
//! listing, explicit session create/delete, and history replay. The chat
//! path itself lives entirely on the socket.

use axum::{
    Json,
    extract::{Path, State},
};
use harbor_protocol::{DerivedMetadata, SessionMessage};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::catalog::{Project, SessionRow};
use crate::importer;
use crate::sessionlog;

use super::error::ApiError;
use super::state::{AppState, CurrentUser};

/// GET /api/health
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub user_id: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
}

/// POST /api/auth/token
///
/// Development convenience: mints a token for the configured dev user.
/// Returns 403 for any other user id, and 404-equivalent behavior when no
/// dev user is configured.
pub async fn mint_token(
    State(state): State<AppState>,
    Json(request): Json<TokenRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let dev_user = state
        .config
        .auth
        .dev_user
        .as_deref()
        .ok_or(ApiError::NotFound)?;
    if request.user_id != dev_user {
        return Err(ApiError::Forbidden);
    }
    let token = state
        .auth
        .generate_token(&request.user_id)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!(e)))?;
    Ok(Json(TokenResponse { token }))
}

/// GET /api/projects
pub async fn list_projects(
    State(state): State<AppState>,
    _user: CurrentUser,
) -> Result<Json<Vec<Project>>, ApiError> {
    let projects = state.projects.list().await?;
    Ok(Json(projects))
}

/// POST /api/projects/sync
///
/// Scan the agent's on-disk session tree, import qualifying projects, and
/// reconcile their sessions into the catalog.
pub async fn sync_projects(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<Json<importer::SyncOutcome>, ApiError> {
    let outcome = importer::sync_agent_tree(
        &state.config,
        &state.projects,
        &state.sessions,
        user.id(),
    )
    .await?;
    Ok(Json(outcome))
}

/// GET /api/projects/{id}/sessions
pub async fn list_sessions(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(project_id): Path<String>,
) -> Result<Json<Vec<SessionRow>>, ApiError> {
    if state.projects.get(&project_id).await?.is_none() {
        return Err(ApiError::NotFound);
    }
    let sessions = state
        .sessions
        .list_by_project(&project_id, user.id())
        .await?;
    Ok(Json(sessions))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// Client-generated session id, accepted verbatim.
    pub id: String,
    pub project_id: String,
}

/// POST /api/sessions
pub async fn create_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<SessionRow>, ApiError> {
    Uuid::parse_str(&request.id)
        .map_err(|_| ApiError::BadRequest("session id must be a UUID".to_string()))?;
    if state.projects.get(&request.project_id).await?.is_none() {
        return Err(ApiError::NotFound);
    }
    if state.sessions.find_by_id(&request.id).await?.is_some() {
        return Err(ApiError::Conflict("session already exists".to_string()));
    }

    let metadata = DerivedMetadata {
        message_count: 0,
        total_tokens: 0,
        first_message_preview: "(No messages)".to_string(),
        last_message_at: chrono::Utc::now(),
    };
    state
        .sessions
        .upsert(&request.id, &request.project_id, user.id(), &metadata)
        .await?;

    let detail = state
        .sessions
        .find_by_id(&request.id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(SessionRow {
        id: detail.id,
        project_id: detail.project_id,
        user_id: detail.user_id,
        message_count: detail.message_count,
        total_tokens: detail.total_tokens,
        first_message_preview: detail.first_message_preview,
        last_message_at: detail.last_message_at,
        created_at: detail.created_at,
    }))
}

/// DELETE /api/sessions/{id}
pub async fn delete_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let detail = state
        .sessions
        .find_by_id(&session_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    if !detail.is_owned_by(user.id()) {
        return Err(ApiError::Forbidden);
    }

    if let Some(live) = state.registry.remove_agent(&session_id).await {
        live.close().await;
    }
    state.sessions.delete(&session_id).await?;
    Ok(Json(json!({ "deleted": session_id })))
}

/// GET /api/sessions/{id}/messages
///
/// Replays the session's on-disk log into canonical messages. An absent log
/// file is an empty history, not an error.
pub async fn get_session_messages(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<SessionMessage>>, ApiError> {
    let detail = state
        .sessions
        .find_by_id(&session_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    if !detail.is_owned_by(user.id()) {
        return Err(ApiError::Forbidden);
    }

    let log_path = sessionlog::session_file_path(
        &state.config.agent_home(),
        &state.config.agent.name,
        &detail.project_path,
        &session_id,
    );
    let messages = sessionlog::replay_messages(&log_path)?;
    Ok(Json(messages))
}
