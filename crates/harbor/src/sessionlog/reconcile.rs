//! Metadata derivation and history replay from a session log.

use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use harbor_protocol::{ContentBlock, DerivedMetadata, LogRecord, SessionMessage};
use serde_json::Value;

/// Preview length in code points.
const PREVIEW_CHARS: usize = 100;

/// Placeholder preview for sessions with no user message yet.
const EMPTY_PREVIEW: &str = "(No messages)";

/// Derive catalog metadata from a session log file.
///
/// A missing file is not an error: it yields zeroed metadata with the
/// placeholder preview. Any other I/O failure propagates.
pub fn reconcile_file(path: &Path) -> Result<DerivedMetadata> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Ok(DerivedMetadata {
                message_count: 0,
                total_tokens: 0,
                first_message_preview: EMPTY_PREVIEW.to_string(),
                last_message_at: Utc::now(),
            });
        }
        Err(err) => {
            return Err(err).with_context(|| format!("reading session log {}", path.display()));
        }
    };

    let mut message_count = 0i64;
    let mut total_tokens = 0i64;
    let mut first_message_preview: Option<String> = None;
    let mut last_message_at: Option<DateTime<Utc>> = None;

    for record in parse_records(&contents) {
        // Any record's timestamp advances the watermark, in file order.
        if let Some(raw) = record.timestamp.as_deref()
            && let Ok(parsed) = DateTime::parse_from_rfc3339(raw)
        {
            last_message_at = Some(parsed.with_timezone(&Utc));
        }

        // Gate on the same role resolution replay uses: `type`, falling back
        // to `role` for logs that only carry the latter.
        match record.message_role() {
            Some("user") => {
                message_count += 1;
                if first_message_preview.is_none()
                    && let Some(content) = record.content_value()
                {
                    let text = flatten_content(content);
                    if !text.is_empty() {
                        first_message_preview =
                            Some(text.chars().take(PREVIEW_CHARS).collect());
                    }
                }
            }
            Some("assistant") => {
                message_count += 1;
                if let Some(usage) = record.token_usage() {
                    total_tokens += usage.total();
                }
            }
            _ => {}
        }
    }

    Ok(DerivedMetadata {
        message_count,
        total_tokens,
        first_message_preview: first_message_preview.unwrap_or_else(|| EMPTY_PREVIEW.to_string()),
        last_message_at: last_message_at.unwrap_or_else(Utc::now),
    })
}

/// Replay a session log into canonical messages.
///
/// Only `user`/`assistant` records appear in the replay; everything else in
/// the log (summaries, snapshots, results) is skipped. A missing file yields
/// an empty history.
pub fn replay_messages(path: &Path) -> Result<Vec<SessionMessage>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("reading session log {}", path.display()));
        }
    };

    let messages = parse_records(&contents)
        .filter(|r| r.is_message())
        .map(canonical_message)
        .collect();
    Ok(messages)
}

fn parse_records(contents: &str) -> impl Iterator<Item = LogRecord> + '_ {
    contents.lines().filter_map(|line| {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match serde_json::from_str::<LogRecord>(line) {
            Ok(record) => Some(record),
            Err(err) => {
                tracing::debug!(error = %err, "skipping malformed session log line");
                None
            }
        }
    })
}

fn canonical_message(record: LogRecord) -> SessionMessage {
    let role = record.message_role().unwrap_or("user").to_string();
    let content = record
        .content_value()
        .map(content_blocks)
        .unwrap_or_default();
    let timestamp = record
        .timestamp_millis()
        .unwrap_or_else(|| Utc::now().timestamp_millis());
    let id = record.id.clone().unwrap_or_else(|| {
        let stamp = record
            .timestamp
            .clone()
            .unwrap_or_else(|| timestamp.to_string());
        format!("{stamp}-{role}")
    });

    SessionMessage {
        id,
        role,
        content,
        timestamp,
    }
}

/// String content becomes a single text block; a list is taken as blocks;
/// anything else is empty.
fn content_blocks(content: &Value) -> Vec<ContentBlock> {
    match content {
        Value::String(text) => vec![ContentBlock::text(text.clone())],
        Value::Array(items) => items
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect(),
        _ => Vec::new(),
    }
}

/// Flatten content to plain text: strings as-is, block lists by joining the
/// `text` of text blocks with single spaces.
fn flatten_content(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_log(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    #[test]
    fn missing_file_yields_zero_metadata() {
        let metadata = reconcile_file(Path::new("/nonexistent/session.jsonl")).unwrap();
        assert_eq!(metadata.message_count, 0);
        assert_eq!(metadata.total_tokens, 0);
        assert_eq!(metadata.first_message_preview, "(No messages)");
    }

    #[test]
    fn missing_file_yields_empty_history() {
        let messages = replay_messages(Path::new("/nonexistent/session.jsonl")).unwrap();
        assert!(messages.is_empty());
    }

    #[test]
    fn single_turn_metadata() {
        let file = write_log(&[
            r#"{"type":"user","message":{"content":"Hello Claude"},"timestamp":"2025-01-01T10:00:00Z"}"#,
            r#"{"type":"assistant","message":{"content":"Hi!"},"timestamp":"2025-01-01T10:00:05Z","usage":{"input_tokens":10,"output_tokens":15,"cache_creation_input_tokens":5,"cache_read_input_tokens":3}}"#,
        ]);
        let metadata = reconcile_file(file.path()).unwrap();
        assert_eq!(metadata.message_count, 2);
        assert_eq!(metadata.total_tokens, 33);
        assert_eq!(metadata.first_message_preview, "Hello Claude");
        assert_eq!(
            metadata.last_message_at,
            "2025-01-01T10:00:05Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn block_content_preview_joins_text_blocks() {
        let file = write_log(&[
            r#"{"type":"user","message":{"content":[{"type":"text","text":"First part"},{"type":"text","text":"Second part"}]}}"#,
        ]);
        let metadata = reconcile_file(file.path()).unwrap();
        assert_eq!(metadata.first_message_preview, "First part Second part");
    }

    #[test]
    fn malformed_lines_do_not_fail_reconciliation() {
        let file = write_log(&[
            r#"{"type":"user","message":{"content":"hi"}}"#,
            "this is not valid json",
            r#"{"type":"assistant","message":{"content":"hello"}}"#,
        ]);
        let metadata = reconcile_file(file.path()).unwrap();
        assert_eq!(metadata.message_count, 2);
    }

    #[test]
    fn preview_is_capped_at_100_code_points() {
        let long = "é".repeat(250);
        let file = write_log(&[&format!(
            r#"{{"type":"user","message":{{"content":"{long}"}}}}"#
        )]);
        let metadata = reconcile_file(file.path()).unwrap();
        assert_eq!(metadata.first_message_preview.chars().count(), 100);
    }

    #[test]
    fn role_only_records_are_counted_and_replayed() {
        let file = write_log(&[
            r#"{"role":"user","message":{"content":"Hello there"},"timestamp":"2025-01-01T10:00:00Z"}"#,
            r#"{"role":"assistant","message":{"content":"Hi"},"timestamp":"2025-01-01T10:00:05Z","usage":{"input_tokens":2,"output_tokens":3}}"#,
        ]);
        let metadata = reconcile_file(file.path()).unwrap();
        assert_eq!(metadata.message_count, 2);
        assert_eq!(metadata.total_tokens, 5);
        assert_eq!(metadata.first_message_preview, "Hello there");
        assert_eq!(
            metadata.last_message_at,
            "2025-01-01T10:00:05Z".parse::<DateTime<Utc>>().unwrap()
        );

        let messages = replay_messages(file.path()).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].role, "assistant");
    }

    #[test]
    fn non_message_timestamp_advances_watermark() {
        let file = write_log(&[
            r#"{"type":"user","message":{"content":"hi"},"timestamp":"2025-01-01T10:00:00Z"}"#,
            r#"{"type":"summary","summary":"done","timestamp":"2025-01-02T08:00:00Z"}"#,
        ]);
        let metadata = reconcile_file(file.path()).unwrap();
        assert_eq!(metadata.message_count, 1);
        assert_eq!(
            metadata.last_message_at,
            "2025-01-02T08:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn reconciliation_is_idempotent() {
        let file = write_log(&[
            r#"{"type":"user","message":{"content":"one"},"timestamp":"2025-03-01T00:00:00Z"}"#,
            r#"{"type":"assistant","message":{"content":"two"},"timestamp":"2025-03-01T00:00:01Z","usage":{"input_tokens":4,"output_tokens":4}}"#,
        ]);
        let first = reconcile_file(file.path()).unwrap();
        let second = reconcile_file(file.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn replay_canonicalizes_string_content() {
        let file = write_log(&[
            r#"{"type":"user","message":{"content":"Hello"},"timestamp":"2025-01-01T10:00:00Z"}"#,
            r#"{"type":"summary","summary":"ignored"}"#,
            r#"{"type":"assistant","id":"msg_1","message":{"content":[{"type":"text","text":"Hi"}]},"timestamp":"2025-01-01T10:00:05Z"}"#,
        ]);
        let messages = replay_messages(file.path()).unwrap();
        assert_eq!(messages.len(), 2);

        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[0].id, "2025-01-01T10:00:00Z-user");
        assert_eq!(messages[0].content.len(), 1);
        assert_eq!(messages[0].content[0].kind, "text");
        assert_eq!(messages[0].content[0].text.as_deref(), Some("Hello"));
        assert_eq!(messages[0].timestamp, 1735725600000);

        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].id, "msg_1");
    }

    #[test]
    fn replay_treats_non_list_content_as_empty() {
        let file = write_log(&[r#"{"type":"user","message":{"content":{"weird":true}}}"#]);
        let messages = replay_messages(file.path()).unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].content.is_empty());
    }
}
