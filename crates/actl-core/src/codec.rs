//! Envelope codec: parsing and structural validation of inbound control
//! payloads.
//!
//! All failure modes resolve to a typed [`ValidationError`] whose display
//! string is safe to return as the `detail` of a `rejected` ack. Nothing in
//! this module panics on untrusted input.

use crate::control::{
    CONTROL_SCHEMA_VERSION, ControlEnvelope, ControlMessage, InterruptRequest, PROTOCOL_VERSION,
    StdinRequest,
};
use crate::limits::HARD_LIMIT_BYTES;
use serde_json::Value;
use thiserror::Error;

/// Default clock-skew window for `sent_at` (seconds).
pub const DEFAULT_MAX_SKEW_SECS: i64 = 300;

/// Tunable bounds applied during request validation.
#[derive(Debug, Clone)]
pub struct ValidationLimits {
    /// Inline payloads at or above this size are rejected (use `content_ref`).
    pub hard_limit_bytes: usize,
    /// Maximum allowed absolute skew between `sent_at` and receiver time.
    pub max_skew_secs: i64,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            hard_limit_bytes: HARD_LIMIT_BYTES,
            max_skew_secs: DEFAULT_MAX_SKEW_SECS,
        }
    }
}

/// Structural validation failure. Always resolves to a `rejected` ack.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("empty transport payload")]
    EmptyPayload,
    #[error("malformed control payload: {0}")]
    MalformedJson(String),
    #[error("unsupported protocol version {got}; receiver supports {want}")]
    UnsupportedVersion { got: u32, want: u32 },
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("unsupported control schema version {got}; expected {want}")]
    UnsupportedSchema { got: u32, want: u32 },
    #[error("acks cannot be submitted as requests")]
    NotARequest,
    #[error("missing required control field '{0}'")]
    MissingField(&'static str),
    #[error("content and content_ref are mutually exclusive")]
    ContentAmbiguous,
    #[error("stdin request requires content or content_ref")]
    ContentMissing,
    #[error("inline content of {len} bytes reaches the {limit} byte hard limit; use content_ref")]
    OversizeInline { len: usize, limit: usize },
    #[error("sent_at must be RFC3339")]
    BadTimestamp,
    #[error("sent_at skew exceeds {0}s")]
    ExcessiveSkew(i64),
    #[error("interrupt request requires signal=\"interrupt\"")]
    BadSignal,
}

/// A validated inbound request, dispatched by action type.
#[derive(Debug, Clone)]
pub enum InboundRequest {
    Stdin(StdinRequest),
    Interrupt(InterruptRequest),
}

impl InboundRequest {
    pub fn request_id(&self) -> &str {
        match self {
            Self::Stdin(r) => &r.request_id,
            Self::Interrupt(r) => &r.request_id,
        }
    }

    pub fn team(&self) -> &str {
        match self {
            Self::Stdin(r) => &r.team,
            Self::Interrupt(r) => &r.team,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::Stdin(r) => &r.session_id,
            Self::Interrupt(r) => &r.session_id,
        }
    }

    pub fn agent_id(&self) -> &str {
        match self {
            Self::Stdin(r) => &r.agent_id,
            Self::Interrupt(r) => &r.agent_id,
        }
    }

    pub fn sender(&self) -> &str {
        match self {
            Self::Stdin(r) => &r.sender,
            Self::Interrupt(r) => &r.sender,
        }
    }

    /// Audit action name for this request variant.
    pub fn action_name(&self) -> &'static str {
        match self {
            Self::Stdin(_) => "control_stdin",
            Self::Interrupt(_) => "control_interrupt",
        }
    }
}

/// Parse one raw socket line into a framing envelope.
pub fn decode_envelope(raw: &str) -> Result<ControlEnvelope, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyPayload);
    }
    let envelope: ControlEnvelope =
        serde_json::from_str(trimmed).map_err(|e| ValidationError::MalformedJson(e.to_string()))?;
    if envelope.version != PROTOCOL_VERSION {
        return Err(ValidationError::UnsupportedVersion {
            got: envelope.version,
            want: PROTOCOL_VERSION,
        });
    }
    if envelope.command != "control" {
        return Err(ValidationError::UnknownCommand(envelope.command.clone()));
    }
    Ok(envelope)
}

/// Parse and validate the envelope payload into a typed request.
pub fn decode_request(
    envelope: &ControlEnvelope,
    limits: &ValidationLimits,
) -> Result<InboundRequest, ValidationError> {
    if envelope.payload.is_null() {
        return Err(ValidationError::EmptyPayload);
    }
    let message: ControlMessage = serde_json::from_value(envelope.payload.clone())
        .map_err(|e| ValidationError::MalformedJson(e.to_string()))?;

    let request = match message {
        ControlMessage::StdinRequest(r) => InboundRequest::Stdin(r),
        ControlMessage::InterruptRequest(r) => InboundRequest::Interrupt(r),
        ControlMessage::StdinAck(_) | ControlMessage::InterruptAck(_) => {
            return Err(ValidationError::NotARequest);
        }
    };
    validate_request(&request, limits)?;
    Ok(request)
}

fn validate_request(
    request: &InboundRequest,
    limits: &ValidationLimits,
) -> Result<(), ValidationError> {
    let (v, sent_at) = match request {
        InboundRequest::Stdin(r) => (r.v, r.sent_at.as_str()),
        InboundRequest::Interrupt(r) => (r.v, r.sent_at.as_str()),
    };
    if v != CONTROL_SCHEMA_VERSION {
        return Err(ValidationError::UnsupportedSchema {
            got: v,
            want: CONTROL_SCHEMA_VERSION,
        });
    }

    require_field("request_id", request.request_id())?;
    require_field("team", request.team())?;
    require_field("session_id", request.session_id())?;
    require_field("agent_id", request.agent_id())?;
    require_field("sender", request.sender())?;
    validate_sent_at(sent_at, limits.max_skew_secs)?;

    match request {
        InboundRequest::Stdin(r) => validate_stdin_body(r, limits),
        InboundRequest::Interrupt(r) => {
            if r.signal != "interrupt" {
                return Err(ValidationError::BadSignal);
            }
            Ok(())
        }
    }
}

fn validate_stdin_body(r: &StdinRequest, limits: &ValidationLimits) -> Result<(), ValidationError> {
    match (&r.content, &r.content_ref) {
        (Some(_), Some(_)) => return Err(ValidationError::ContentAmbiguous),
        (None, None) => return Err(ValidationError::ContentMissing),
        _ => {}
    }
    if let Some(content) = &r.content {
        if content.is_empty() {
            return Err(ValidationError::ContentMissing);
        }
        if content.len() >= limits.hard_limit_bytes {
            return Err(ValidationError::OversizeInline {
                len: content.len(),
                limit: limits.hard_limit_bytes,
            });
        }
    }
    Ok(())
}

fn require_field(name: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField(name));
    }
    Ok(())
}

fn validate_sent_at(sent_at: &str, max_skew_secs: i64) -> Result<(), ValidationError> {
    let parsed =
        chrono::DateTime::parse_from_rfc3339(sent_at).map_err(|_| ValidationError::BadTimestamp)?;
    let skew = (chrono::Utc::now() - parsed.with_timezone(&chrono::Utc)).num_seconds();
    if skew.unsigned_abs() > max_skew_secs as u64 {
        return Err(ValidationError::ExcessiveSkew(max_skew_secs));
    }
    Ok(())
}

/// Correlation fields recovered best-effort from a payload that failed
/// validation, so a `rejected` ack can still be correlated by the sender.
#[derive(Debug, Clone, Default)]
pub struct AckFields {
    pub request_id: String,
    pub team: String,
    pub session_id: String,
    pub agent_id: String,
}

pub fn ack_fields_from_value(payload: &Value) -> AckFields {
    let field = |name: &str| {
        payload
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string()
    };
    AckFields {
        request_id: field("request_id"),
        team: field("team"),
        session_id: field("session_id"),
        agent_id: field("agent_id"),
    }
}
