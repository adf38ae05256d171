//! Derived session metadata and canonical replay messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata derived from a session log by reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedMetadata {
    pub message_count: i64,
    pub total_tokens: i64,
    pub first_message_preview: String,
    pub last_message_at: chrono::DateTime<chrono::Utc>,
}

/// A conversation message in canonical form, replayed from the session log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub id: String,
    pub role: String,
    pub content: Vec<ContentBlock>,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

/// One content block of a message.
///
/// Only `text` is interpreted; other block types (`thinking`, `tool_use`,
/// `tool_result`, and whatever future CLIs add) keep their fields in `extra`
/// and round-trip unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: Some(text.into()),
            extra: serde_json::Map::new(),
        }
    }
}
