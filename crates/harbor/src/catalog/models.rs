//! Catalog data models.

use harbor_protocol::DerivedMetadata;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A project: a working directory the agent runs in.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Project {
    pub id: String,
    pub name: String,
    /// Absolute path of the working directory.
    pub path: String,
    pub created_at: String,
}

/// One agent session as stored in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SessionRow {
    pub id: String,
    pub project_id: String,
    pub user_id: String,
    pub message_count: i64,
    pub total_tokens: i64,
    pub first_message_preview: Option<String>,
    pub last_message_at: Option<String>,
    pub created_at: String,
}

/// A session joined with its project.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SessionDetail {
    pub id: String,
    pub project_id: String,
    pub user_id: String,
    pub message_count: i64,
    pub total_tokens: i64,
    pub first_message_preview: Option<String>,
    pub last_message_at: Option<String>,
    pub created_at: String,
    pub project_name: String,
    pub project_path: String,
}

impl SessionDetail {
    /// Whether the given principal owns this session.
    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }

    pub fn metadata(&self) -> DerivedMetadata {
        DerivedMetadata {
            message_count: self.message_count,
            total_tokens: self.total_tokens,
            first_message_preview: self
                .first_message_preview
                .clone()
                .unwrap_or_else(|| "(No messages)".to_string()),
            last_message_at: self
                .last_message_at
                .as_deref()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or_else(chrono::Utc::now),
        }
    }
}
