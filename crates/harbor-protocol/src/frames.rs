//! WebSocket frame envelope and payloads.
//!
//! Both directions use the same outer shape: `{"type": <string>, "data": <any>}`.
//! The type string is a dotted path; the middle segment of `session.<id>.*`
//! and `shell.<id>.*` frames carries the channel id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A frame received from a client.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// A frame sent to a client.
#[derive(Debug, Clone, Serialize)]
pub struct ServerFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// Routing target parsed out of a frame's type string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameTarget {
    /// `global.<op>`
    Global { op: String },
    /// `session.<id>.<op>` — an agent session channel.
    Session { id: String, op: String },
    /// `shell.<id>.<op>` — a shell channel.
    Shell { id: String, op: String },
}

impl FrameTarget {
    /// Parse a dotted frame type. Returns `None` for unknown prefixes or
    /// malformed paths; the router answers those with `global.error`.
    pub fn parse(kind: &str) -> Option<FrameTarget> {
        let mut parts = kind.splitn(3, '.');
        let prefix = parts.next()?;
        match prefix {
            "global" => {
                let op = parts.next()?;
                if parts.next().is_some() || op.is_empty() {
                    return None;
                }
                Some(FrameTarget::Global { op: op.to_string() })
            }
            "session" | "shell" => {
                let id = parts.next()?;
                let op = parts.next()?;
                if id.is_empty() || op.is_empty() {
                    return None;
                }
                if prefix == "session" {
                    Some(FrameTarget::Session {
                        id: id.to_string(),
                        op: op.to_string(),
                    })
                } else {
                    Some(FrameTarget::Shell {
                        id: id.to_string(),
                        op: op.to_string(),
                    })
                }
            }
            _ => None,
        }
    }
}

// ============================================================================
// Inbound payloads
// ============================================================================

/// Payload of `session.<id>.send_message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessagePayload {
    pub content: String,
    #[serde(default)]
    pub images: Vec<TurnImage>,
    #[serde(default)]
    pub options: TurnOptions,
}

/// One image attached to a turn: either an inline data URL or a path the
/// broker can read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnImage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

/// Per-turn agent invocation options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub dangerously_skip_permissions: bool,
    /// Resume the named session instead of starting it fresh.
    #[serde(default)]
    pub resume: bool,
    /// Continue the most recent conversation (only when no session id is sent).
    #[serde(default, rename = "continue")]
    pub continue_conversation: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disallowed_tools: Vec<String>,
}

/// Payload of `shell.<id>.init`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellInitPayload {
    pub project_id: String,
    pub cols: u16,
    pub rows: u16,
}

/// Payload of `shell.<id>.input`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellInputPayload {
    pub data: String,
}

/// Payload of `shell.<id>.resize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellResizePayload {
    pub cols: u16,
    pub rows: u16,
}

// ============================================================================
// Outbound constructors
// ============================================================================

impl ServerFrame {
    fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    pub fn connected() -> Self {
        Self::new("global.connected", Value::Null)
    }

    pub fn ping() -> Self {
        Self::new("global.ping", Value::Null)
    }

    pub fn global_error(message: impl Into<String>) -> Self {
        Self::new(
            "global.error",
            serde_json::json!({ "message": message.into() }),
        )
    }

    pub fn stream_output(session_id: &str, events: &[Value]) -> Self {
        Self::new(
            format!("session.{session_id}.stream_output"),
            serde_json::json!({ "events": events }),
        )
    }

    pub fn message_complete(session_id: &str, metadata: Value, events: &[Value]) -> Self {
        Self::new(
            format!("session.{session_id}.message_complete"),
            serde_json::json!({ "metadata": metadata, "events": events }),
        )
    }

    pub fn session_error(session_id: &str, message: impl Into<String>, details: Value) -> Self {
        Self::new(
            format!("session.{session_id}.error"),
            serde_json::json!({ "message": message.into(), "details": details }),
        )
    }

    pub fn shell_initialized(channel: &str, shell_id: &str) -> Self {
        Self::new(
            format!("shell.{channel}.initialized"),
            serde_json::json!({ "sessionId": shell_id }),
        )
    }

    pub fn shell_output(channel: &str, data: &str) -> Self {
        Self::new(
            format!("shell.{channel}.output"),
            serde_json::json!({ "data": data }),
        )
    }

    pub fn shell_exit(channel: &str, exit_code: Option<i32>, signal: Option<i32>) -> Self {
        Self::new(
            format!("shell.{channel}.exit"),
            serde_json::json!({ "exitCode": exit_code, "signal": signal }),
        )
    }

    pub fn shell_error(channel: &str, message: impl Into<String>) -> Self {
        Self::new(
            format!("shell.{channel}.error"),
            serde_json::json!({ "message": message.into() }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_session_target() {
        let t = FrameTarget::parse("session.9b2d9c4e.send_message").unwrap();
        assert_eq!(
            t,
            FrameTarget::Session {
                id: "9b2d9c4e".to_string(),
                op: "send_message".to_string()
            }
        );
    }

    #[test]
    fn parse_shell_target() {
        let t = FrameTarget::parse("shell.ch1.resize").unwrap();
        assert_eq!(
            t,
            FrameTarget::Shell {
                id: "ch1".to_string(),
                op: "resize".to_string()
            }
        );
    }

    #[test]
    fn parse_global_target() {
        let t = FrameTarget::parse("global.ping").unwrap();
        assert_eq!(
            t,
            FrameTarget::Global {
                op: "ping".to_string()
            }
        );
    }

    #[test]
    fn parse_rejects_unknown_prefix() {
        assert!(FrameTarget::parse("terminal.x.input").is_none());
        assert!(FrameTarget::parse("session.only-two").is_none());
        assert!(FrameTarget::parse("").is_none());
    }

    #[test]
    fn server_frame_serializes_envelope() {
        let frame = ServerFrame::shell_output("ch1", "hello");
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"shell.ch1.output\""));
        assert!(json.contains("\"data\":{\"data\":\"hello\"}"));
    }

    #[test]
    fn connected_frame_omits_null_data() {
        let json = serde_json::to_string(&ServerFrame::connected()).unwrap();
        assert_eq!(json, "{\"type\":\"global.connected\"}");
    }

    #[test]
    fn send_message_payload_defaults() {
        let payload: SendMessagePayload =
            serde_json::from_str("{\"content\":\"hi\"}").unwrap();
        assert_eq!(payload.content, "hi");
        assert!(payload.images.is_empty());
        assert!(payload.options.model.is_none());
        assert!(!payload.options.dangerously_skip_permissions);
    }
}
