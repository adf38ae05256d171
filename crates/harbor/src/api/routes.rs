//! Route table.

use axum::{
    Router,
    http::{HeaderValue, Method},
    routing::{delete, get, post},
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::ws;

use super::handlers;
use super::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.server.allowed_origins);

    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/auth/token", post(handlers::mint_token))
        .route("/api/projects", get(handlers::list_projects))
        .route("/api/projects/sync", post(handlers::sync_projects))
        .route(
            "/api/projects/{id}/sessions",
            get(handlers::list_sessions),
        )
        .route("/api/sessions", post(handlers::create_session))
        .route("/api/sessions/{id}", delete(handlers::delete_session))
        .route(
            "/api/sessions/{id}/messages",
            get(handlers::get_session_messages),
        )
        .route("/ws", get(ws::ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(tower_http::cors::Any);

    if allowed_origins.is_empty() {
        return layer.allow_origin(AllowOrigin::any());
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}
