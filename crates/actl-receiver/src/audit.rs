//! Structured audit trail for control-channel decisions.
//!
//! Every receipt, ack, duplicate replay, soft-limit warning, and failure
//! produces an [`AuditEvent`]. Emission is strictly fire-and-forget: the
//! dispatcher pushes events through a bounded channel with `try_send`, so a
//! slow or broken sink can never stall the request path. Overflow drops the
//! event and bumps a counter.
//!
//! The default sink appends compact JSONL records with size-based rotation.

use crate::config::{AuditVerbosity, ReceiverConfig};
use agent_ctl_core::home::control_dir;
use chrono::Utc;
use serde_json::{Map, Value, json};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const DEFAULT_MAX_BYTES: u64 = 50 * 1024 * 1024;
const DEFAULT_MAX_FILES: u32 = 5;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuditKind {
    #[default]
    RequestReceived,
    AckEmitted,
    DuplicateReplayed,
    SoftLimitExceeded,
    RequestFailed,
}

impl AuditKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditKind::RequestReceived => "request_received",
            AuditKind::AckEmitted => "ack_emitted",
            AuditKind::DuplicateReplayed => "duplicate_replayed",
            AuditKind::SoftLimitExceeded => "soft_limit_exceeded",
            AuditKind::RequestFailed => "request_failed",
        }
    }
}

/// One audit record. Optional fields are omitted from the JSONL line.
#[derive(Debug, Clone, Default)]
pub struct AuditEvent {
    pub kind: AuditKind,
    pub level: &'static str,
    pub action: &'static str,
    pub team: Option<String>,
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
    pub sender: Option<String>,
    pub request_id: Option<String>,
    pub result: Option<String>,
    pub detail: Option<String>,
    pub duplicate: Option<bool>,
    pub size_bytes: Option<u64>,
    /// Included in sink output only under verbose audit configuration.
    pub message_text: Option<String>,
}

/// Destination for audit events. Implementations must not panic; errors are
/// swallowed.
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

// ── Dispatcher-side handle ───────────────────────────────────────────────────

/// Cloneable, non-blocking front end to the audit pipeline.
#[derive(Debug, Clone)]
pub struct AuditHandle {
    tx: mpsc::Sender<AuditEvent>,
    dropped: Arc<AtomicU64>,
    verbosity: AuditVerbosity,
    trunc_chars: usize,
}

impl AuditHandle {
    /// Build the handle and spawn the forwarder task draining into `sink`.
    pub fn spawn(
        sink: Arc<dyn AuditSink>,
        config: &ReceiverConfig,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<AuditEvent>(config.audit_queue_capacity);
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sink.emit(event);
            }
            debug!("audit forwarder drained and stopped");
        });
        let handle = Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            verbosity: config.audit_verbosity,
            trunc_chars: config.audit_trunc_chars,
        };
        (handle, forwarder)
    }

    /// Queue an event; never blocks. On a full queue the event is dropped
    /// and counted.
    pub fn emit(&self, mut event: AuditEvent) {
        event.message_text = match self.verbosity {
            AuditVerbosity::None => None,
            AuditVerbosity::Truncated => event
                .message_text
                .map(|text| text.chars().take(self.trunc_chars).collect()),
            AuditVerbosity::Full => event.message_text,
        };
        if self.tx.try_send(event).is_err() {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(dropped_total = total, "audit queue full, event dropped");
        }
    }

    /// Events lost to queue overflow since startup.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ── JSONL file sink ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct JsonlSink {
    path: PathBuf,
    max_bytes: u64,
    max_files: u32,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_bytes: DEFAULT_MAX_BYTES,
            max_files: DEFAULT_MAX_FILES,
        }
    }

    /// Sink at the default location with `ACTL_AUDIT_*` overrides applied.
    pub fn from_env() -> anyhow::Result<Self> {
        let path = std::env::var("ACTL_AUDIT_FILE")
            .map(PathBuf::from)
            .or_else(|_| control_dir().map(|dir| dir.join("audit.jsonl")))?;
        let max_bytes = std::env::var("ACTL_AUDIT_MAX_BYTES")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_MAX_BYTES);
        let max_files = std::env::var("ACTL_AUDIT_MAX_FILES")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_MAX_FILES);
        Ok(Self {
            path,
            max_bytes,
            max_files,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&self, event: &AuditEvent) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        rotate_if_needed(&self.path, self.max_bytes, self.max_files)?;
        write_header_if_empty(&self.path)?;

        let mut obj = Map::new();
        obj.insert("v".to_string(), Value::from(1));
        obj.insert("k".to_string(), Value::from("e"));
        obj.insert("ts".to_string(), Value::from(Utc::now().to_rfc3339()));
        obj.insert("kind".to_string(), Value::from(event.kind.as_str()));
        obj.insert("lv".to_string(), Value::from(event.level));
        obj.insert("act".to_string(), Value::from(event.action));
        if let Some(v) = &event.team {
            obj.insert("team".to_string(), Value::from(v.as_str()));
        }
        if let Some(v) = &event.session_id {
            obj.insert("sid".to_string(), Value::from(v.as_str()));
        }
        if let Some(v) = &event.agent_id {
            obj.insert("aid".to_string(), Value::from(v.as_str()));
        }
        if let Some(v) = &event.sender {
            obj.insert("snd".to_string(), Value::from(v.as_str()));
        }
        if let Some(v) = &event.request_id {
            obj.insert("rid".to_string(), Value::from(v.as_str()));
        }
        if let Some(v) = &event.result {
            obj.insert("res".to_string(), Value::from(v.as_str()));
        }
        if let Some(v) = &event.detail {
            obj.insert("det".to_string(), Value::from(v.as_str()));
        }
        if let Some(v) = event.duplicate {
            obj.insert("dup".to_string(), Value::from(v));
        }
        if let Some(v) = event.size_bytes {
            obj.insert("size".to_string(), Value::from(v));
        }
        if let Some(v) = &event.message_text {
            obj.insert("msg".to_string(), Value::from(v.as_str()));
        }

        let line = Value::Object(obj).to_string();
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        Ok(())
    }
}

impl AuditSink for JsonlSink {
    fn emit(&self, event: AuditEvent) {
        // Fail-open: audit loss must never break request handling.
        if let Err(err) = self.write_line(&event) {
            debug!("audit write failed: {err}");
        }
    }
}

fn rotated_path(path: &Path, idx: u32) -> PathBuf {
    PathBuf::from(format!("{}.{}", path.display(), idx))
}

fn rotate_if_needed(path: &Path, max_bytes: u64, max_files: u32) -> std::io::Result<()> {
    if !path.exists() || fs::metadata(path)?.len() < max_bytes {
        return Ok(());
    }
    for idx in (1..max_files).rev() {
        let src = rotated_path(path, idx);
        if src.exists() {
            let _ = fs::rename(&src, rotated_path(path, idx + 1));
        }
    }
    let _ = fs::rename(path, rotated_path(path, 1));
    Ok(())
}

fn write_header_if_empty(path: &Path) -> std::io::Result<()> {
    let should_write = !path.exists() || fs::metadata(path)?.len() == 0;
    if !should_write {
        return Ok(());
    }
    let header = json!({
        "v": 1,
        "k": "h",
        "ts": Utc::now().to_rfc3339(),
        "m": {
            "v": "schema_version",
            "k": "record_kind",
            "ts": "timestamp",
            "kind": "event_kind",
            "lv": "level",
            "act": "action",
            "team": "team",
            "sid": "session_id",
            "aid": "agent_id",
            "snd": "sender",
            "rid": "request_id",
            "res": "result",
            "det": "detail",
            "dup": "duplicate",
            "size": "size_bytes",
            "msg": "message_text"
        }
    });
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(header.to_string().as_bytes())?;
    file.write_all(b"\n")?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(detail: &str) -> AuditEvent {
        AuditEvent {
            kind: AuditKind::AckEmitted,
            level: "info",
            action: "control_stdin",
            team: Some("ctl-dev".to_string()),
            session_id: Some("sess-1".to_string()),
            agent_id: Some("arch-1".to_string()),
            sender: Some("orchestrator".to_string()),
            request_id: Some("req-1".to_string()),
            result: Some("ok".to_string()),
            detail: Some(detail.to_string()),
            duplicate: Some(false),
            message_text: Some("deploy the fix".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn sink_writes_header_then_events() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlSink::new(dir.path().join("audit.jsonl"));
        sink.emit(event("delivered"));
        sink.emit(event("delivered"));

        let content = fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        let header: Value = serde_json::from_str(lines[0]).unwrap();
        let first: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(header["k"], "h");
        assert_eq!(first["k"], "e");
        assert_eq!(first["kind"], "ack_emitted");
        assert_eq!(first["rid"], "req-1");
        assert_eq!(first["dup"], false);
    }

    #[test]
    fn rotation_renames_oversized_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        fs::write(&path, b"0123456789").unwrap();
        rotate_if_needed(&path, 5, 3).unwrap();
        assert!(!path.exists());
        assert!(dir.path().join("audit.jsonl.1").exists());
    }

    #[test]
    fn sink_is_fail_open_on_unwritable_path() {
        let file = tempfile::NamedTempFile::new().unwrap();
        // Parent "directory" is a regular file; writes must fail silently.
        let sink = JsonlSink::new(file.path().join("nested").join("audit.jsonl"));
        sink.emit(event("delivered"));
    }

    #[tokio::test]
    async fn handle_truncates_message_text_per_verbosity() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(JsonlSink::new(dir.path().join("audit.jsonl")));
        let config = ReceiverConfig {
            audit_verbosity: AuditVerbosity::Truncated,
            audit_trunc_chars: 6,
            ..ReceiverConfig::default()
        };
        let (handle, forwarder) = AuditHandle::spawn(sink.clone(), &config);
        handle.emit(event("delivered"));
        drop(handle);
        forwarder.await.unwrap();

        let content = fs::read_to_string(sink.path()).unwrap();
        let line: Value = serde_json::from_str(content.lines().nth(1).unwrap()).unwrap();
        assert_eq!(line["msg"], "deploy");
    }

    #[tokio::test]
    async fn handle_omits_message_text_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(JsonlSink::new(dir.path().join("audit.jsonl")));
        let (handle, forwarder) = AuditHandle::spawn(sink.clone(), &ReceiverConfig::default());
        handle.emit(event("delivered"));
        drop(handle);
        forwarder.await.unwrap();

        let content = fs::read_to_string(sink.path()).unwrap();
        let line: Value = serde_json::from_str(content.lines().nth(1).unwrap()).unwrap();
        assert!(line.get("msg").is_none());
    }

    #[tokio::test]
    async fn overflow_drops_events_and_counts_them() {
        struct NullSink;
        impl AuditSink for NullSink {
            fn emit(&self, _event: AuditEvent) {}
        }

        let config = ReceiverConfig {
            audit_queue_capacity: 1,
            ..ReceiverConfig::default()
        };
        // Build the channel by hand so nothing drains it during the test.
        let (tx, _rx) = mpsc::channel::<AuditEvent>(config.audit_queue_capacity);
        let handle = AuditHandle {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            verbosity: config.audit_verbosity,
            trunc_chars: config.audit_trunc_chars,
        };

        handle.emit(event("one"));
        handle.emit(event("two"));
        handle.emit(event("three"));
        assert_eq!(handle.dropped_count(), 2);
    }
}
