//! Agent CLI session-log records.
//!
//! The agent CLI appends one JSON object per line to its session file and
//! emits the same shape on stdout while a turn runs. The broker only reads
//! the handful of fields it needs; everything else passes through untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One record of an agent session log.
///
/// Permissive by construction: every field is optional and unrecognised
/// variants deserialize fine with only `kind` unset. Records the broker
/// doesn't understand still count for `lastMessageAt` tracking.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogRecord {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    #[serde(default)]
    pub message: Option<MessageBody>,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub cwd: Option<String>,
}

/// The nested `message` object some record formats carry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

/// Token accounting on an assistant record, top-level or under `message`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub cache_creation_input_tokens: i64,
    #[serde(default)]
    pub cache_read_input_tokens: i64,
}

impl TokenUsage {
    pub fn total(&self) -> i64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_creation_input_tokens
            + self.cache_read_input_tokens
    }
}

impl LogRecord {
    /// Whether this record is a conversation message. Both record formats
    /// are accepted: a `user`/`assistant` `type` discriminator, or a bare
    /// `role` field when `type` is absent or something else.
    pub fn is_message(&self) -> bool {
        self.message_role().is_some()
    }

    /// The message role: the `type` discriminator when it names a message,
    /// else the `role` field when it does.
    pub fn message_role(&self) -> Option<&str> {
        match self.kind.as_deref() {
            Some("user") | Some("assistant") => self.kind.as_deref(),
            _ => match self.role.as_deref() {
                Some("user") | Some("assistant") => self.role.as_deref(),
                _ => None,
            },
        }
    }

    /// Message content: `message.content` when present, else top-level
    /// `content`.
    pub fn content_value(&self) -> Option<&Value> {
        self.message
            .as_ref()
            .and_then(|m| m.content.as_ref())
            .or(self.content.as_ref())
    }

    /// Token usage, reading either the top-level `usage` or `message.usage`.
    pub fn token_usage(&self) -> Option<TokenUsage> {
        self.usage
            .or_else(|| self.message.as_ref().and_then(|m| m.usage))
    }

    /// The record timestamp parsed to epoch milliseconds.
    pub fn timestamp_millis(&self) -> Option<i64> {
        let raw = self.timestamp.as_deref()?;
        chrono::DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.timestamp_millis())
    }
}
