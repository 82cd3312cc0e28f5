//! Test doubles for the dispatcher's injected collaborators.
//!
//! Used by this crate's unit tests and the integration suite. Kept in the
//! library so both can share one set of mocks.

use crate::adapter::{Outcome, WorkerAdapter};
use crate::audit::{AuditEvent, AuditKind, AuditSink};
use crate::liveness::SessionTarget;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared observation handle for a [`MockAdapter`].
#[derive(Debug, Default)]
pub struct MockCounters {
    injected: Mutex<Vec<(SessionTarget, Vec<u8>)>>,
    interrupts: AtomicUsize,
}

impl MockCounters {
    pub fn injections(&self) -> usize {
        self.injected.lock().unwrap().len()
    }

    pub fn interrupts(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    pub fn last_injected(&self) -> Option<(SessionTarget, Vec<u8>)> {
        self.injected.lock().unwrap().last().cloned()
    }
}

/// Scriptable in-memory [`WorkerAdapter`].
///
/// Each call pops the next scripted outcome, defaulting to
/// [`Outcome::Delivered`] when the script is empty. An optional delay makes
/// calls take simulated time, which pairs with paused-clock tests.
#[derive(Debug, Clone)]
pub struct MockAdapter {
    counters: Arc<MockCounters>,
    script: Arc<Mutex<VecDeque<Outcome>>>,
    delay: Arc<Mutex<Option<Duration>>>,
    interrupts_supported: Arc<AtomicBool>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(MockCounters::default()),
            script: Arc::new(Mutex::new(VecDeque::new())),
            delay: Arc::new(Mutex::new(None)),
            interrupts_supported: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn counters(&self) -> Arc<MockCounters> {
        Arc::clone(&self.counters)
    }

    /// Queue an outcome for the next adapter call.
    pub fn push_outcome(&self, outcome: Outcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    /// Make every adapter call take `delay` of (possibly simulated) time.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn set_interrupts_supported(&self, supported: bool) {
        self.interrupts_supported.store(supported, Ordering::SeqCst);
    }

    async fn run_call(&self) -> Outcome {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Outcome::Delivered)
    }
}

#[async_trait]
impl WorkerAdapter for MockAdapter {
    async fn inject(&self, target: &SessionTarget, bytes: &[u8]) -> Outcome {
        let outcome = self.run_call().await;
        self.counters
            .injected
            .lock()
            .unwrap()
            .push((target.clone(), bytes.to_vec()));
        outcome
    }

    async fn interrupt(&self, _target: &SessionTarget) -> Outcome {
        let outcome = self.run_call().await;
        self.counters.interrupts.fetch_add(1, Ordering::SeqCst);
        outcome
    }

    fn supports_interrupt(&self, _target: &SessionTarget) -> bool {
        self.interrupts_supported.load(Ordering::SeqCst)
    }
}

/// [`AuditSink`] that records events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<AuditKind> {
        self.events.lock().unwrap().iter().map(|e| e.kind).collect()
    }
}

impl AuditSink for MemorySink {
    fn emit(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}
