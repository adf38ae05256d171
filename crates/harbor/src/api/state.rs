//! Application state shared across handlers.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use crate::agent::AgentEngine;
use crate::auth::{AuthError, AuthState, Claims, bearer_token_from_header};
use crate::catalog::{ProjectRepository, SessionRepository};
use crate::config::HarborConfig;
use crate::db::Database;
use crate::registry::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HarborConfig>,
    pub db: Database,
    pub projects: ProjectRepository,
    pub sessions: SessionRepository,
    pub auth: AuthState,
    pub registry: SessionRegistry,
    pub engine: AgentEngine,
}

impl AppState {
    pub fn new(config: Arc<HarborConfig>, db: Database, auth: AuthState) -> Self {
        let projects = ProjectRepository::new(db.pool().clone());
        let sessions = SessionRepository::new(db.pool().clone());
        let engine = AgentEngine::new(config.clone(), sessions.clone());
        Self {
            config,
            db,
            projects,
            sessions,
            auth,
            registry: SessionRegistry::new(),
            engine,
        }
    }
}

/// The authenticated principal, extracted from the `Authorization` header.
pub struct CurrentUser(pub Claims);

impl CurrentUser {
    pub fn id(&self) -> &str {
        self.0.user_id()
    }
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError::MissingToken)?;
        let token = bearer_token_from_header(header)?;
        let claims = state.auth.validate_token(token)?;
        Ok(CurrentUser(claims))
    }
}
