//! The catalog: durable project and session records.
//!
//! Sessions here mirror the agent's on-disk log tree; reconciliation is the
//! only writer of the derived metadata columns.

mod models;
mod projects;
mod sessions;

pub use models::{Project, SessionDetail, SessionRow};
pub use projects::ProjectRepository;
pub use sessions::SessionRepository;
