//! Receiver configuration resolved from the environment.

use agent_ctl_core::codec::DEFAULT_MAX_SKEW_SECS;
use agent_ctl_core::codec::ValidationLimits;
use agent_ctl_core::limits::{HARD_LIMIT_BYTES, SOFT_LIMIT_BYTES};
use std::path::PathBuf;
use std::time::Duration;

/// Default dedup retention window in seconds.
const DEFAULT_DEDUP_TTL_SECS: u64 = 600;
/// Default max in-memory dedup keys.
const DEFAULT_DEDUP_CAPACITY: usize = 1000;
/// Default bound on how long a duplicate waits for an in-flight original.
/// Sized to cover the sender-side ack timeout times its retry budget with
/// margin.
const DEFAULT_PENDING_WAIT_SECS: u64 = 6;
/// Default bound on one adapter call.
const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 10;
/// Default interval between background dedup sweeps.
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_AUDIT_QUEUE_CAPACITY: usize = 256;
const DEFAULT_AUDIT_TRUNC_CHARS: usize = 200;

/// How much of the message text audit events may carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuditVerbosity {
    /// Omit message text entirely (default).
    None,
    /// Include a truncated prefix.
    Truncated,
    /// Include the full text.
    Full,
}

impl AuditVerbosity {
    fn from_env() -> Self {
        match std::env::var("ACTL_AUDIT_MSG")
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str()
        {
            "full" => Self::Full,
            "truncated" => Self::Truncated,
            _ => Self::None,
        }
    }
}

/// All tunables of the control receiver.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Inline payloads at or above this size trigger a warn audit event.
    pub soft_limit_bytes: usize,
    /// Inline payloads at or above this size are rejected.
    pub hard_limit_bytes: usize,
    /// Accepted absolute `sent_at` skew.
    pub max_skew_secs: i64,
    /// Retention window for finalized dedup records.
    pub dedup_ttl: Duration,
    /// Max finalized dedup records kept in memory.
    pub dedup_capacity: usize,
    /// Bound on a duplicate's wait for an in-flight original.
    pub pending_wait: Duration,
    /// Bound on one adapter call.
    pub exec_timeout: Duration,
    /// Interval between background sweeps of the dedup store.
    pub sweep_interval: Duration,
    /// Allowed base directory for `content_ref` paths.
    pub content_dir: PathBuf,
    /// Message-text policy for audit events.
    pub audit_verbosity: AuditVerbosity,
    /// Truncation length for [`AuditVerbosity::Truncated`].
    pub audit_trunc_chars: usize,
    /// Bounded audit channel depth; events beyond it are dropped, counted.
    pub audit_queue_capacity: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            soft_limit_bytes: SOFT_LIMIT_BYTES,
            hard_limit_bytes: HARD_LIMIT_BYTES,
            max_skew_secs: DEFAULT_MAX_SKEW_SECS,
            dedup_ttl: Duration::from_secs(DEFAULT_DEDUP_TTL_SECS),
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            pending_wait: Duration::from_secs(DEFAULT_PENDING_WAIT_SECS),
            exec_timeout: Duration::from_secs(DEFAULT_EXEC_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            content_dir: default_content_dir(),
            audit_verbosity: AuditVerbosity::None,
            audit_trunc_chars: DEFAULT_AUDIT_TRUNC_CHARS,
            audit_queue_capacity: DEFAULT_AUDIT_QUEUE_CAPACITY,
        }
    }
}

fn default_content_dir() -> PathBuf {
    agent_ctl_core::home::control_dir()
        .map(|d| d.join("share"))
        .unwrap_or_else(|_| PathBuf::from("share"))
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

impl ReceiverConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            soft_limit_bytes: env_usize("ACTL_SOFT_LIMIT_BYTES", defaults.soft_limit_bytes),
            hard_limit_bytes: env_usize("ACTL_HARD_LIMIT_BYTES", defaults.hard_limit_bytes),
            max_skew_secs: env_u64("ACTL_MAX_SKEW_SECS", defaults.max_skew_secs as u64) as i64,
            dedup_ttl: Duration::from_secs(env_u64("ACTL_DEDUP_TTL_SECS", DEFAULT_DEDUP_TTL_SECS)),
            dedup_capacity: env_usize("ACTL_DEDUP_CAPACITY", defaults.dedup_capacity),
            pending_wait: Duration::from_secs(env_u64(
                "ACTL_PENDING_WAIT_SECS",
                DEFAULT_PENDING_WAIT_SECS,
            )),
            exec_timeout: Duration::from_secs(env_u64(
                "ACTL_EXEC_TIMEOUT_SECS",
                DEFAULT_EXEC_TIMEOUT_SECS,
            )),
            sweep_interval: Duration::from_secs(env_u64(
                "ACTL_SWEEP_INTERVAL_SECS",
                DEFAULT_SWEEP_INTERVAL_SECS,
            )),
            content_dir: std::env::var("ACTL_CONTENT_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.content_dir),
            audit_verbosity: AuditVerbosity::from_env(),
            audit_trunc_chars: env_usize("ACTL_AUDIT_TRUNC_CHARS", DEFAULT_AUDIT_TRUNC_CHARS),
            audit_queue_capacity: env_usize(
                "ACTL_AUDIT_QUEUE_CAPACITY",
                DEFAULT_AUDIT_QUEUE_CAPACITY,
            ),
        }
    }

    /// Codec limits derived from this config.
    pub fn validation_limits(&self) -> ValidationLimits {
        ValidationLimits {
            hard_limit_bytes: self.hard_limit_bytes,
            max_skew_secs: self.max_skew_secs,
        }
    }
}
