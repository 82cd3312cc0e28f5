//! Control protocol message types for live agent stdin/interrupt actions.
//!
//! These payload types are carried inside the socket envelope (`command:
//! "control"`). They are versioned independently from the socket framing
//! protocol via the `v` field.

use serde::{Deserialize, Serialize};

/// Socket framing protocol version (the envelope `version` field).
pub const PROTOCOL_VERSION: u32 = 1;

/// Current control payload schema version (the message `v` field).
pub const CONTROL_SCHEMA_VERSION: u32 = 1;

/// Transport wrapper for one request or response line on the socket.
///
/// `version` governs socket framing and is checked before the payload is
/// looked at; the payload carries its own `v` schema version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlEnvelope {
    pub version: u32,
    /// Envelope-level correlation id echoed back in the response line.
    pub request_id: String,
    /// Always `"control"` for this protocol.
    pub command: String,
    /// The [`ControlMessage`], kept as raw JSON so malformed payloads can
    /// still be answered with a `rejected` ack carrying whatever correlation
    /// fields are recoverable.
    pub payload: serde_json::Value,
}

/// One control payload, tagged by the wire `type` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "control.stdin.request")]
    StdinRequest(StdinRequest),
    #[serde(rename = "control.interrupt.request")]
    InterruptRequest(InterruptRequest),
    #[serde(rename = "control.stdin.ack")]
    StdinAck(ControlAck),
    #[serde(rename = "control.interrupt.ack")]
    InterruptAck(ControlAck),
}

/// Request to inject text into a live worker session's input stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StdinRequest {
    /// Control schema version.
    pub v: u32,
    /// Sender-chosen idempotency key, reused verbatim on retries.
    pub request_id: String,
    /// Team namespace.
    pub team: String,
    /// Owning session identifier.
    pub session_id: String,
    /// Target worker identifier.
    pub agent_id: String,
    /// Sender identity.
    pub sender: String,
    /// RFC3339 UTC timestamp from the sender.
    pub sent_at: String,
    /// Inline UTF-8 payload. Exactly one of `content` / `content_ref` must
    /// be present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Out-of-band file reference for oversized payloads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_ref: Option<ContentRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_preview: Option<String>,
    /// Advisory flag; the receiver records it in audit metadata but only a
    /// standalone interrupt request triggers interrupt execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupt: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

/// Request to deliver an interrupt signal to a live worker session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterruptRequest {
    pub v: u32,
    pub request_id: String,
    pub team: String,
    pub session_id: String,
    pub agent_id: String,
    pub sender: String,
    pub sent_at: String,
    /// Must be the literal `"interrupt"`.
    pub signal: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

/// Acknowledgement returned by the receiver for every control request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlAck {
    pub v: u32,
    pub request_id: String,
    pub team: String,
    pub session_id: String,
    pub agent_id: String,
    /// RFC3339 UTC timestamp at which the result was decided.
    pub acked_at: String,
    pub result: ResultCode,
    /// `true` when this ack replays a previously stored outcome.
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result status for control processing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    Ok,
    NotLive,
    NotFound,
    Busy,
    Timeout,
    Rejected,
    InternalError,
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::NotLive => "not_live",
            Self::NotFound => "not_found",
            Self::Busy => "busy",
            Self::Timeout => "timeout",
            Self::Rejected => "rejected",
            Self::InternalError => "internal_error",
        };
        write!(f, "{s}")
    }
}

/// File-backed content reference for oversize payloads.
///
/// The receiver verifies declared size and hash against the file before use
/// and never mutates or deletes the referenced file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentRef {
    pub path: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub mime: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

impl ControlEnvelope {
    /// Build a response envelope echoing the request's correlation id.
    pub fn response(request_id: &str, payload: serde_json::Value) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            request_id: request_id.to_string(),
            command: "control".to_string(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdin_request() -> StdinRequest {
        StdinRequest {
            v: CONTROL_SCHEMA_VERSION,
            request_id: "req-1".to_string(),
            team: "ctl-dev".to_string(),
            session_id: "sess-1".to_string(),
            agent_id: "arch-1".to_string(),
            sender: "team-lead".to_string(),
            sent_at: "2026-08-01T00:00:00Z".to_string(),
            content: Some("hello".to_string()),
            content_ref: None,
            content_encoding: None,
            content_preview: None,
            interrupt: None,
            meta: None,
        }
    }

    #[test]
    fn stdin_request_round_trip_uses_wire_type_tag() {
        let msg = ControlMessage::StdinRequest(stdin_request());
        let json = serde_json::to_string(&msg).expect("serialize request");
        assert!(
            json.contains(r#""type":"control.stdin.request""#),
            "wire tag must be control.stdin.request; got: {json}"
        );
        let decoded: ControlMessage = serde_json::from_str(&json).expect("deserialize request");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn optional_fields_are_omitted_when_absent() {
        let msg = ControlMessage::StdinRequest(stdin_request());
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("content_ref"));
        assert!(!json.contains("meta"));
        assert!(!json.contains("interrupt"));
    }

    #[test]
    fn interrupt_request_round_trip() {
        let msg = ControlMessage::InterruptRequest(InterruptRequest {
            v: CONTROL_SCHEMA_VERSION,
            request_id: "req-2".to_string(),
            team: "ctl-dev".to_string(),
            session_id: "sess-1".to_string(),
            agent_id: "arch-1".to_string(),
            sender: "team-lead".to_string(),
            sent_at: "2026-08-01T00:00:00Z".to_string(),
            signal: "interrupt".to_string(),
            meta: None,
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"control.interrupt.request""#));
        let decoded: ControlMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn ack_round_trip_with_result_code() {
        let msg = ControlMessage::StdinAck(ControlAck {
            v: CONTROL_SCHEMA_VERSION,
            request_id: "req-3".to_string(),
            team: "ctl-dev".to_string(),
            session_id: "sess-1".to_string(),
            agent_id: "arch-1".to_string(),
            acked_at: "2026-08-01T00:00:01Z".to_string(),
            result: ResultCode::NotLive,
            duplicate: false,
            detail: Some("target session is not live".to_string()),
            error: None,
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""result":"not_live""#));
        let decoded: ControlMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn result_code_serializes_snake_case() {
        let json = serde_json::to_string(&ResultCode::InternalError).unwrap();
        assert_eq!(json, r#""internal_error""#);
        assert_eq!(ResultCode::NotFound.to_string(), "not_found");
    }

    #[test]
    fn content_ref_round_trip() {
        let cref = ContentRef {
            path: "/tmp/input.txt".to_string(),
            size_bytes: 12,
            sha256: "abc123".to_string(),
            mime: "text/plain".to_string(),
            expires_at: Some("2026-08-01T00:10:00Z".to_string()),
        };
        let json = serde_json::to_string(&cref).unwrap();
        let decoded: ContentRef = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, cref);
    }

    #[test]
    fn envelope_response_echoes_request_id() {
        let env = ControlEnvelope::response("env-7", serde_json::json!({"x": 1}));
        assert_eq!(env.version, PROTOCOL_VERSION);
        assert_eq!(env.request_id, "env-7");
        assert_eq!(env.command, "control");
    }
}
