//! Unix socket ingress for the control receiver.
//!
//! The receiver listens on a Unix domain socket at:
//!
//! ```text
//! ${ACTL_HOME}/.actl/receiver.sock
//! ```
//!
//! Each client connection follows a simple request/response protocol:
//!
//! 1. Client connects
//! 2. Client writes one JSON line (newline-terminated envelope)
//! 3. Server writes one JSON line (newline-terminated response envelope)
//! 4. Server closes the connection
//!
//! Two envelope commands are served: `"control"` requests go through the
//! [`ControlReceiver`] pipeline, and `"session-event"` lines feed the
//! session registry with agent lifecycle updates.
//!
//! ## Platform availability
//!
//! The socket server is only compiled and active on Unix platforms. On
//! non-Unix platforms [`start_socket_server`] returns `Ok(None)`.

use crate::dispatch::ControlReceiver;
use crate::liveness::{AgentState, SessionStatus, SessionTarget, StaticRegistry, TargetStatus};
use agent_ctl_core::control::{ControlEnvelope, PROTOCOL_VERSION};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Start the socket server and return a handle that cleans up the socket
/// and PID files on drop.
#[allow(unused_variables)]
pub async fn start_socket_server(
    home_dir: PathBuf,
    receiver: Arc<ControlReceiver>,
    registry: StaticRegistry,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<Option<SocketServerHandle>> {
    #[cfg(unix)]
    {
        start_unix_socket_server(home_dir, receiver, registry, cancel)
            .await
            .map(Some)
    }

    #[cfg(not(unix))]
    {
        info!("Unix socket server not available on this platform");
        Ok(None)
    }
}

/// A handle to the running socket server. Dropping it removes the socket
/// and PID files from disk.
pub struct SocketServerHandle {
    socket_path: PathBuf,
    pid_path: PathBuf,
}

impl SocketServerHandle {
    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket_path
    }
}

impl Drop for SocketServerHandle {
    fn drop(&mut self) {
        cleanup_socket_files(&self.socket_path, &self.pid_path);
    }
}

fn cleanup_socket_files(socket_path: &PathBuf, pid_path: &PathBuf) {
    if socket_path.exists() {
        if let Err(e) = std::fs::remove_file(socket_path) {
            warn!("Failed to remove socket file {}: {e}", socket_path.display());
        } else {
            debug!("Removed socket file {}", socket_path.display());
        }
    }
    if pid_path.exists() {
        if let Err(e) = std::fs::remove_file(pid_path) {
            warn!("Failed to remove PID file {}: {e}", pid_path.display());
        } else {
            debug!("Removed PID file {}", pid_path.display());
        }
    }
}

// ── Unix implementation ───────────────────────────────────────────────────────

#[cfg(unix)]
async fn start_unix_socket_server(
    home_dir: PathBuf,
    receiver: Arc<ControlReceiver>,
    registry: StaticRegistry,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<SocketServerHandle> {
    use tokio::net::UnixListener;

    let control_dir = home_dir.join(".actl");
    let socket_path = control_dir.join("receiver.sock");
    let pid_path = control_dir.join("receiver.pid");

    std::fs::create_dir_all(&control_dir)?;

    // A previous receiver may have crashed without cleaning up.
    if socket_path.exists() {
        warn!("Removing stale socket file: {}", socket_path.display());
        std::fs::remove_file(&socket_path)?;
    }

    let pid = std::process::id();
    std::fs::write(&pid_path, format!("{pid}\n"))?;
    debug!("Wrote PID {pid} to {}", pid_path.display());

    let listener = UnixListener::bind(&socket_path)?;
    info!("Control socket listening on {}", socket_path.display());

    let accept_socket_path = socket_path.clone();
    tokio::spawn(async move {
        run_accept_loop(listener, receiver, registry, cancel, &accept_socket_path).await;
    });

    Ok(SocketServerHandle {
        socket_path,
        pid_path,
    })
}

#[cfg(unix)]
async fn run_accept_loop(
    listener: tokio::net::UnixListener,
    receiver: Arc<ControlReceiver>,
    registry: StaticRegistry,
    cancel: tokio_util::sync::CancellationToken,
    socket_path: &std::path::Path,
) {
    info!("Socket accept loop started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Socket server cancelled");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let receiver = Arc::clone(&receiver);
                        let registry = registry.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, receiver, registry).await {
                                error!("Socket connection handler error: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error on socket {}: {e}", socket_path.display());
                        // Brief pause before retrying to avoid a tight error loop
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    info!("Socket accept loop stopped");
}

#[cfg(unix)]
async fn handle_connection(
    stream: tokio::net::UnixStream,
    receiver: Arc<ControlReceiver>,
    registry: StaticRegistry,
) -> Result<()> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    debug!("New socket connection");

    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();

    match reader.read_line(&mut request_line).await {
        Ok(0) => {
            debug!("Client disconnected without sending request");
            return Ok(());
        }
        Err(e) => {
            warn!("Failed to read socket request: {e}");
            return Ok(());
        }
        Ok(_) => {}
    }

    let raw = request_line.trim();
    let mut response_json = route_line(raw, &receiver, &registry).await;
    response_json.push('\n');

    let mut stream = reader.into_inner();
    stream.write_all(response_json.as_bytes()).await?;
    stream.flush().await?;

    debug!("Socket response sent");
    Ok(())
}

/// Route one raw request line to the control pipeline or the session-event
/// handler.
async fn route_line(
    raw: &str,
    receiver: &ControlReceiver,
    registry: &StaticRegistry,
) -> String {
    let command = serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|v| v.get("command").and_then(|c| c.as_str()).map(String::from));

    match command.as_deref() {
        Some("session-event") => {
            let response = handle_session_event(raw, registry);
            serde_json::to_string(&response).unwrap_or_else(|_| "{}".to_string())
        }
        // Everything else, including malformed lines, goes through the
        // control pipeline so rejections stay correlated.
        _ => receiver.handle_line(raw).await,
    }
}

/// Apply one session lifecycle event to the registry.
///
/// Payload: `{"session_id": "...", "agent_id": "...", "event":
/// "register"|"state"|"session-end"|"deregister", "state": "...",
/// "process_id": 1234}` (`state` and `process_id` are optional).
fn handle_session_event(raw: &str, registry: &StaticRegistry) -> ControlEnvelope {
    let envelope: ControlEnvelope = match serde_json::from_str(raw) {
        Ok(envelope) => envelope,
        Err(e) => return event_error("unknown", &format!("malformed session event: {e}")),
    };
    if envelope.version != PROTOCOL_VERSION {
        return event_error(
            &envelope.request_id,
            &format!(
                "unsupported protocol version {}; receiver supports {PROTOCOL_VERSION}",
                envelope.version
            ),
        );
    }

    let payload = &envelope.payload;
    let field = |name: &str| {
        payload
            .get(name)
            .and_then(serde_json::Value::as_str)
            .unwrap_or("")
            .to_string()
    };
    let session_id = field("session_id");
    let agent_id = field("agent_id");
    let event = field("event");
    if session_id.is_empty() || agent_id.is_empty() || event.is_empty() {
        return event_error(
            &envelope.request_id,
            "session event requires session_id, agent_id, and event",
        );
    }

    let target = SessionTarget::new(&session_id, &agent_id);
    match event.as_str() {
        "register" => {
            let state = payload
                .get("state")
                .and_then(serde_json::Value::as_str)
                .and_then(AgentState::parse)
                .unwrap_or(AgentState::Launching);
            let process_id = payload
                .get("process_id")
                .and_then(serde_json::Value::as_u64)
                .map(|pid| pid as u32);
            registry.upsert(
                target.clone(),
                TargetStatus {
                    session: SessionStatus::Active,
                    agent: state,
                },
                process_id,
            );
        }
        "state" => {
            let Some(state) = payload
                .get("state")
                .and_then(serde_json::Value::as_str)
                .and_then(AgentState::parse)
            else {
                return event_error(&envelope.request_id, "unknown or missing agent state");
            };
            registry.set_agent_state(&target, state);
        }
        "session-end" => registry.end_session(&target),
        "deregister" => registry.remove(&target),
        other => {
            return event_error(
                &envelope.request_id,
                &format!("unknown session event '{other}'"),
            );
        }
    }

    debug!(target_id = %target, event, "applied session event");
    ControlEnvelope {
        version: PROTOCOL_VERSION,
        request_id: envelope.request_id,
        command: "session-event".to_string(),
        payload: serde_json::json!({"status": "ok"}),
    }
}

fn event_error(request_id: &str, message: &str) -> ControlEnvelope {
    ControlEnvelope {
        version: PROTOCOL_VERSION,
        request_id: request_id.to_string(),
        command: "session-event".to_string(),
        payload: serde_json::json!({"status": "error", "message": message}),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditHandle;
    use crate::authz::TeamRoster;
    use crate::config::ReceiverConfig;
    use crate::testkit::{MemorySink, MockAdapter};
    use agent_ctl_core::control::{ControlMessage, ResultCode};

    fn build_receiver(registry: &StaticRegistry) -> Arc<ControlReceiver> {
        let roster = TeamRoster::from_toml_str(
            r#"
            [teams.ctl-dev]
            members = ["orchestrator", "arch-1"]
            "#,
        )
        .unwrap();
        let (audit, _forwarder) =
            AuditHandle::spawn(Arc::new(MemorySink::new()), &ReceiverConfig::default());
        Arc::new(ControlReceiver::new(
            ReceiverConfig::default(),
            Arc::new(registry.clone()),
            Arc::new(MockAdapter::new()),
            Arc::new(roster),
            audit,
        ))
    }

    fn register_event(request_id: &str) -> String {
        serde_json::json!({
            "version": PROTOCOL_VERSION,
            "request_id": request_id,
            "command": "session-event",
            "payload": {
                "session_id": "sess-1",
                "agent_id": "arch-1",
                "event": "register",
                "state": "idle",
            },
        })
        .to_string()
    }

    fn stdin_line(request_id: &str) -> String {
        serde_json::json!({
            "version": PROTOCOL_VERSION,
            "request_id": "env-1",
            "command": "control",
            "payload": {
                "type": "control.stdin.request",
                "v": 1,
                "request_id": request_id,
                "team": "ctl-dev",
                "session_id": "sess-1",
                "agent_id": "arch-1",
                "sender": "orchestrator",
                "sent_at": chrono::Utc::now().to_rfc3339(),
                "content": "hello",
            },
        })
        .to_string()
    }

    #[tokio::test]
    async fn session_event_registers_target() {
        let registry = StaticRegistry::new();
        let response = handle_session_event(&register_event("ev-1"), &registry);
        assert_eq!(response.payload["status"], "ok");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn session_event_with_unknown_state_is_an_error() {
        let registry = StaticRegistry::new();
        let raw = serde_json::json!({
            "version": PROTOCOL_VERSION,
            "request_id": "ev-2",
            "command": "session-event",
            "payload": {
                "session_id": "sess-1",
                "agent_id": "arch-1",
                "event": "state",
                "state": "warp-speed",
            },
        })
        .to_string();
        let response = handle_session_event(&raw, &registry);
        assert_eq!(response.payload["status"], "error");
    }

    #[tokio::test]
    async fn route_line_dispatches_by_command() {
        let registry = StaticRegistry::new();
        let receiver = build_receiver(&registry);

        let response = route_line(&register_event("ev-1"), &receiver, &registry).await;
        let envelope: ControlEnvelope = serde_json::from_str(&response).unwrap();
        assert_eq!(envelope.command, "session-event");

        let response = route_line(&stdin_line("req-1"), &receiver, &registry).await;
        let envelope: ControlEnvelope = serde_json::from_str(&response).unwrap();
        assert_eq!(envelope.command, "control");
    }

    /// Integration-style test: start server, register a target over the
    /// socket, then deliver a control request to it.
    #[cfg(unix)]
    #[tokio::test]
    async fn socket_round_trip_register_then_deliver() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        use tokio_util::sync::CancellationToken;

        let temp_dir = tempfile::TempDir::new().unwrap();
        let home_dir = temp_dir.path().to_path_buf();
        let cancel = CancellationToken::new();

        let registry = StaticRegistry::new();
        let receiver = build_receiver(&registry);
        let _handle =
            start_socket_server(home_dir.clone(), receiver, registry.clone(), cancel.clone())
                .await
                .unwrap()
                .expect("Expected socket server handle on unix");

        let socket_path = home_dir.join(".actl/receiver.sock");

        let exchange = |line: String| {
            let socket_path = socket_path.clone();
            async move {
                let stream = tokio::net::UnixStream::connect(&socket_path).await.unwrap();
                let mut reader = BufReader::new(stream);
                reader
                    .get_mut()
                    .write_all(format!("{line}\n").as_bytes())
                    .await
                    .unwrap();
                let mut response = String::new();
                reader.read_line(&mut response).await.unwrap();
                response
            }
        };

        let response = exchange(register_event("ev-1")).await;
        let envelope: ControlEnvelope = serde_json::from_str(response.trim()).unwrap();
        assert_eq!(envelope.payload["status"], "ok");

        let response = exchange(stdin_line("req-1")).await;
        let envelope: ControlEnvelope = serde_json::from_str(response.trim()).unwrap();
        let message: ControlMessage = serde_json::from_value(envelope.payload).unwrap();
        match message {
            ControlMessage::StdinAck(ack) => {
                assert_eq!(ack.result, ResultCode::Ok);
                assert!(!ack.duplicate);
            }
            other => panic!("expected stdin ack, got {other:?}"),
        }

        cancel.cancel();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pid_file_written_and_cleaned_up() {
        use tokio_util::sync::CancellationToken;

        let temp_dir = tempfile::TempDir::new().unwrap();
        let home_dir = temp_dir.path().to_path_buf();
        let cancel = CancellationToken::new();

        let registry = StaticRegistry::new();
        let receiver = build_receiver(&registry);
        let socket_path = home_dir.join(".actl/receiver.sock");
        let pid_path = home_dir.join(".actl/receiver.pid");

        {
            let _handle =
                start_socket_server(home_dir.clone(), receiver, registry, cancel.clone())
                    .await
                    .unwrap()
                    .expect("Expected socket server handle on unix");

            assert!(socket_path.exists());
            let pid: u32 = std::fs::read_to_string(&pid_path)
                .unwrap()
                .trim()
                .parse()
                .unwrap();
            assert_eq!(pid, std::process::id());
        }
        // Handle dropped: both files cleaned up.
        assert!(!socket_path.exists());
        assert!(!pid_path.exists());

        cancel.cancel();
    }
}
