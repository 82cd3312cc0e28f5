//! Worker adapter seam.
//!
//! The dispatcher never talks to a concrete agent backend; it hands verified
//! bytes to a [`WorkerAdapter`] and maps the [`Outcome`] onto a result code.
//! Backend-internal identifiers (pane ids, conversation handles) stay behind
//! this trait and never leak into wire payloads.

use crate::liveness::SessionTarget;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Result of one adapter call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Bytes handed off to the worker.
    Delivered,
    /// Worker exists but cannot take input right now; sender may retry.
    Busy,
    /// Backend failure; surfaces as `internal_error`.
    Failed(String),
}

/// Backend delivery interface, injected into the dispatcher.
#[async_trait]
pub trait WorkerAdapter: Send + Sync {
    /// Push verified content to the target's input stream.
    async fn inject(&self, target: &SessionTarget, bytes: &[u8]) -> Outcome;

    /// Deliver an interrupt signal to the target.
    async fn interrupt(&self, target: &SessionTarget) -> Outcome;

    /// Whether this backend can interrupt the given target at all. Checked
    /// before any dedup bookkeeping so unsupported interrupts stay cheap.
    fn supports_interrupt(&self, target: &SessionTarget) -> bool;
}

/// File-spool adapter: each injection lands as a numbered message file under
/// `<base>/<session_id>/<agent_id>/`, consumed in order by the worker side.
/// Interrupts drop a marker file next to the queue.
#[derive(Debug, Clone)]
pub struct SpoolAdapter {
    base: PathBuf,
    seq: Arc<AtomicU64>,
    interrupts_supported: bool,
}

impl SpoolAdapter {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            seq: Arc::new(AtomicU64::new(0)),
            interrupts_supported: true,
        }
    }

    pub fn without_interrupts(mut self) -> Self {
        self.interrupts_supported = false;
        self
    }

    fn queue_dir(&self, target: &SessionTarget) -> PathBuf {
        self.base.join(&target.session_id).join(&target.agent_id)
    }

    fn write_message(&self, dir: &Path, bytes: &[u8]) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let final_path = dir.join(format!("{seq:08}.msg"));
        // Write-then-rename so the consumer never observes a partial file.
        let tmp_path = dir.join(format!("{seq:08}.msg.tmp"));
        std::fs::write(&tmp_path, bytes)?;
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(final_path)
    }
}

#[async_trait]
impl WorkerAdapter for SpoolAdapter {
    async fn inject(&self, target: &SessionTarget, bytes: &[u8]) -> Outcome {
        let dir = self.queue_dir(target);
        match self.write_message(&dir, bytes) {
            Ok(path) => {
                debug!(target_id = %target, path = %path.display(), "spooled stdin message");
                Outcome::Delivered
            }
            Err(err) => Outcome::Failed(format!("spool write failed: {err}")),
        }
    }

    async fn interrupt(&self, target: &SessionTarget) -> Outcome {
        if !self.interrupts_supported {
            return Outcome::Failed("interrupt not supported by this backend".to_string());
        }
        let dir = self.queue_dir(target);
        let marker = dir.join("interrupt");
        let write = std::fs::create_dir_all(&dir).and_then(|_| std::fs::write(&marker, b""));
        match write {
            Ok(()) => {
                debug!(target_id = %target, "dropped interrupt marker");
                Outcome::Delivered
            }
            Err(err) => Outcome::Failed(format!("interrupt marker write failed: {err}")),
        }
    }

    fn supports_interrupt(&self, _target: &SessionTarget) -> bool {
        self.interrupts_supported
    }
}
