//! HTTP surface: application state, REST handlers, and routes.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::ApiError;
pub use routes::build_router;
pub use state::AppState;
