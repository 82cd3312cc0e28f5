//! Sender-side client for the control channel.
//!
//! Thin, synchronous Unix-socket interface used by CLI tooling to deliver
//! stdin/interrupt requests to the receiver. The protocol is
//! newline-delimited JSON, one request line and one response line per
//! connection:
//!
//! ```json
//! // Request
//! {"version":1,"request_id":"uuid","command":"control","payload":{"type":"control.stdin.request",...}}
//! // Response
//! {"version":1,"request_id":"uuid","command":"control","payload":{"type":"control.stdin.ack",...}}
//! ```
//!
//! # Graceful Fallback
//!
//! All send functions return `Ok(None)` when the receiver is not running,
//! when the platform has no Unix sockets, or when no ack arrives within the
//! configured timeout after all retries. Retries reuse the identical
//! `request_id`, so a retried send is deduplicated on the receiver side.

use crate::control::{
    CONTROL_SCHEMA_VERSION, ContentRef, ControlAck, ControlEnvelope, ControlMessage,
    InterruptRequest, PROTOCOL_VERSION, StdinRequest,
};
use crate::limits::{HARD_LIMIT_BYTES, SOFT_LIMIT_BYTES};
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Default ack wait per attempt.
const DEFAULT_ACK_TIMEOUT_MS: u64 = 2000;
/// Default number of retries after the first attempt.
const DEFAULT_RETRIES: u32 = 1;

/// Sender-side timing configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long to wait for an ack on each attempt.
    pub ack_timeout: Duration,
    /// Additional attempts after the first, each reusing the same
    /// `request_id`.
    pub retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(DEFAULT_ACK_TIMEOUT_MS),
            retries: DEFAULT_RETRIES,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let ack_timeout_ms = std::env::var("ACTL_ACK_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_ACK_TIMEOUT_MS);
        let retries = std::env::var("ACTL_SEND_RETRIES")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(DEFAULT_RETRIES);
        Self {
            ack_timeout: Duration::from_millis(ack_timeout_ms),
            retries,
        }
    }
}

/// Compute the well-known receiver socket path,
/// `${ACTL_HOME}/.actl/receiver.sock`.
pub fn receiver_socket_path() -> Result<PathBuf> {
    Ok(crate::home::control_dir()?.join("receiver.sock"))
}

/// Compute the well-known receiver PID file path.
pub fn receiver_pid_path() -> Result<PathBuf> {
    Ok(crate::home::control_dir()?.join("receiver.pid"))
}

/// Generate a fresh idempotency key for one logical send.
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Build a stdin request with inline content.
///
/// Warns (but still sends inline) at the soft limit. Content at or above the
/// hard limit must be spilled to a file first via [`write_content_ref`].
pub fn stdin_request(
    team: &str,
    session_id: &str,
    agent_id: &str,
    sender: &str,
    content: &str,
) -> Result<StdinRequest> {
    if content.len() >= HARD_LIMIT_BYTES {
        anyhow::bail!(
            "inline content of {} bytes reaches the {} byte hard limit; \
             spill it with write_content_ref first",
            content.len(),
            HARD_LIMIT_BYTES
        );
    }
    if content.len() >= SOFT_LIMIT_BYTES {
        warn!(
            "inline content of {} bytes exceeds the {} byte soft limit",
            content.len(),
            SOFT_LIMIT_BYTES
        );
    }
    Ok(StdinRequest {
        v: CONTROL_SCHEMA_VERSION,
        request_id: new_request_id(),
        team: team.to_string(),
        session_id: session_id.to_string(),
        agent_id: agent_id.to_string(),
        sender: sender.to_string(),
        sent_at: now_rfc3339(),
        content: Some(content.to_string()),
        content_ref: None,
        content_encoding: None,
        content_preview: None,
        interrupt: None,
        meta: None,
    })
}

/// Build a stdin request around an already-written content reference.
pub fn stdin_request_with_ref(
    team: &str,
    session_id: &str,
    agent_id: &str,
    sender: &str,
    content_ref: ContentRef,
) -> StdinRequest {
    StdinRequest {
        v: CONTROL_SCHEMA_VERSION,
        request_id: new_request_id(),
        team: team.to_string(),
        session_id: session_id.to_string(),
        agent_id: agent_id.to_string(),
        sender: sender.to_string(),
        sent_at: now_rfc3339(),
        content: None,
        content_ref: Some(content_ref),
        content_encoding: None,
        content_preview: None,
        interrupt: None,
        meta: None,
    }
}

/// Build an interrupt request for the given target.
pub fn interrupt_request(
    team: &str,
    session_id: &str,
    agent_id: &str,
    sender: &str,
) -> InterruptRequest {
    InterruptRequest {
        v: CONTROL_SCHEMA_VERSION,
        request_id: new_request_id(),
        team: team.to_string(),
        session_id: session_id.to_string(),
        agent_id: agent_id.to_string(),
        sender: sender.to_string(),
        sent_at: now_rfc3339(),
        signal: "interrupt".to_string(),
        meta: None,
    }
}

/// Spill oversized content into a file under `share_dir` and return the
/// verified reference for it.
pub fn write_content_ref(content: &str, share_dir: &Path) -> Result<ContentRef> {
    std::fs::create_dir_all(share_dir)
        .with_context(|| format!("failed to create share dir {}", share_dir.display()))?;
    let path = share_dir.join(format!("{}.txt", uuid::Uuid::new_v4()));
    std::fs::write(&path, content.as_bytes())
        .with_context(|| format!("failed to write content to {}", path.display()))?;
    let digest = Sha256::digest(content.as_bytes());
    Ok(ContentRef {
        path: path.to_string_lossy().to_string(),
        size_bytes: content.len() as u64,
        sha256: format!("{digest:x}"),
        mime: "text/plain".to_string(),
        expires_at: None,
    })
}

/// Send one control request and wait for its ack, retrying with the same
/// `request_id` on ack timeout.
///
/// Returns `Ok(None)` when the receiver is unreachable or no ack arrived
/// within `config.ack_timeout` across all attempts.
#[allow(unused_variables)]
pub fn send_control(message: &ControlMessage, config: &ClientConfig) -> Result<Option<ControlAck>> {
    #[cfg(unix)]
    {
        let attempts = config.retries.saturating_add(1);
        for attempt in 0..attempts {
            if attempt > 0 {
                warn!("no ack received, retrying with the same request_id (attempt {attempt})");
            }
            if let Some(ack) = send_once_unix(message, config.ack_timeout)? {
                return Ok(Some(ack));
            }
        }
        Ok(None)
    }

    #[cfg(not(unix))]
    {
        Ok(None)
    }
}

#[cfg(unix)]
fn send_once_unix(message: &ControlMessage, timeout: Duration) -> Result<Option<ControlAck>> {
    use std::io::{BufRead, BufReader, Write};
    use std::os::unix::net::UnixStream;

    let socket_path = receiver_socket_path()?;

    // Missing socket or refused connection means the receiver is not running.
    let stream = match UnixStream::connect(&socket_path) {
        Ok(s) => s,
        Err(_) => return Ok(None),
    };
    stream.set_read_timeout(Some(timeout)).ok();
    stream.set_write_timeout(Some(timeout)).ok();

    let envelope = ControlEnvelope {
        version: PROTOCOL_VERSION,
        request_id: new_request_id(),
        command: "control".to_string(),
        payload: serde_json::to_value(message)?,
    };
    let request_line = serde_json::to_string(&envelope)?;

    {
        let mut writer = std::io::BufWriter::new(&stream);
        writer.write_all(request_line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
    }

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    match reader.read_line(&mut response_line) {
        Ok(0) | Err(_) => return Ok(None), // receiver closed or timed out
        Ok(_) => {}
    }

    let response: ControlEnvelope = match serde_json::from_str(response_line.trim()) {
        Ok(r) => r,
        Err(_) => return Ok(None),
    };
    let ack = match serde_json::from_value::<ControlMessage>(response.payload) {
        Ok(ControlMessage::StdinAck(a)) | Ok(ControlMessage::InterruptAck(a)) => a,
        _ => return Ok(None),
    };
    Ok(Some(ack))
}
