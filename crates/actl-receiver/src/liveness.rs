//! Liveness gate for control-request targets.
//!
//! Delivery requires the target to be live *now*: its session must be
//! `Active` and its agent in a state that can accept input (`Idle` or
//! `Busy`). Everything else is a transient condition the sender can retry
//! past, so the gate never treats it as fatal.
//!
//! The registry behind the gate is injected via [`SessionRegistry`]; the
//! bundled [`StaticRegistry`] backs the binary (fed by session lifecycle
//! events over the socket) and the tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// The `(session_id, agent_id)` pair a control request addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionTarget {
    pub session_id: String,
    pub agent_id: String,
}

impl SessionTarget {
    pub fn new(session_id: &str, agent_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
        }
    }
}

impl fmt::Display for SessionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session_id, self.agent_id)
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Ended,
}

/// Execution state of an agent within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// Spawning; not yet able to accept input.
    Launching,
    Idle,
    Busy,
    /// Worker stopped responding; presumed wedged.
    Stale,
    Killed,
    Closed,
}

impl AgentState {
    /// States that can accept injected input.
    pub fn accepts_input(self) -> bool {
        matches!(self, AgentState::Idle | AgentState::Busy)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Launching => "launching",
            AgentState::Idle => "idle",
            AgentState::Busy => "busy",
            AgentState::Stale => "stale",
            AgentState::Killed => "killed",
            AgentState::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "launching" => Some(AgentState::Launching),
            "idle" => Some(AgentState::Idle),
            "busy" => Some(AgentState::Busy),
            "stale" => Some(AgentState::Stale),
            "killed" => Some(AgentState::Killed),
            "closed" => Some(AgentState::Closed),
            _ => None,
        }
    }
}

/// Snapshot of a known target's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetStatus {
    pub session: SessionStatus,
    pub agent: AgentState,
}

impl TargetStatus {
    pub fn is_live(&self) -> bool {
        self.session == SessionStatus::Active && self.agent.accepts_input()
    }
}

/// Gate verdict for one target at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessDecision {
    Live,
    /// Target is not registered at all.
    NotFound,
    /// Target is known but cannot accept input right now. Carries a
    /// human-readable reason for the ack `detail`.
    NotLive(String),
}

/// Source of target status, injected into the dispatcher.
pub trait SessionRegistry: Send + Sync {
    fn status(&self, target: &SessionTarget) -> Option<TargetStatus>;
}

/// Evaluate the gate from a registry lookup result.
pub fn evaluate(status: Option<TargetStatus>) -> LivenessDecision {
    match status {
        None => LivenessDecision::NotFound,
        Some(status) if status.is_live() => LivenessDecision::Live,
        Some(status) => {
            let reason = match status.session {
                SessionStatus::Ended => "session has ended".to_string(),
                SessionStatus::Active => {
                    format!("agent state is {}", status.agent.as_str())
                }
            };
            LivenessDecision::NotLive(reason)
        }
    }
}

// ── In-memory registry ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct TargetRecord {
    status: TargetStatus,
    /// OS process backing the agent, when known. A dead process overrides
    /// whatever state the last lifecycle event reported.
    process_id: Option<u32>,
}

/// Shared in-memory registry, updated by session lifecycle events.
///
/// Cheap to clone; all clones observe the same map.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    inner: Arc<Mutex<HashMap<SessionTarget, TargetRecord>>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a target. Re-registering a dead target revives it.
    pub fn upsert(&self, target: SessionTarget, status: TargetStatus, process_id: Option<u32>) {
        let mut map = self.inner.lock().unwrap();
        map.insert(target, TargetRecord { status, process_id });
    }

    /// Record a new agent state for a known target. Unknown targets are
    /// ignored.
    pub fn set_agent_state(&self, target: &SessionTarget, state: AgentState) {
        let mut map = self.inner.lock().unwrap();
        if let Some(record) = map.get_mut(target) {
            record.status.agent = state;
        }
    }

    /// Mark a target's session as ended. Unknown targets are ignored.
    pub fn end_session(&self, target: &SessionTarget) {
        let mut map = self.inner.lock().unwrap();
        if let Some(record) = map.get_mut(target) {
            record.status.session = SessionStatus::Ended;
        }
    }

    pub fn remove(&self, target: &SessionTarget) {
        self.inner.lock().unwrap().remove(target);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionRegistry for StaticRegistry {
    fn status(&self, target: &SessionTarget) -> Option<TargetStatus> {
        let map = self.inner.lock().unwrap();
        let record = map.get(target)?;
        // A registered PID that no longer exists means the agent is gone no
        // matter what the last lifecycle event said.
        if let Some(pid) = record.process_id {
            if !is_pid_alive(pid) {
                return Some(TargetStatus {
                    session: record.status.session,
                    agent: AgentState::Stale,
                });
            }
        }
        Some(record.status)
    }
}

/// Check whether an OS process with the given PID exists.
///
/// Unix `kill(pid, 0)` probes existence without delivering a signal. On
/// non-Unix platforms this is conservatively `false`.
pub fn is_pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // SAFETY: sig=0 never sends a signal; it only checks PID existence.
        let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
        result == 0
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}
