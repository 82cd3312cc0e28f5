//! Per-session execution queues.
//!
//! All requests addressed to one `(session_id, agent_id)` serialize in
//! arrival order around the liveness-check-plus-execution section, even when
//! their `request_id`s differ. Unrelated targets never contend.
//!
//! Built on `tokio::sync::Mutex`, whose lock queue is FIFO, so arrival order
//! is preserved without extra bookkeeping.

use crate::liveness::SessionTarget;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Held for the duration of one request's execution section.
pub type QueueSlot = OwnedMutexGuard<()>;

/// Map of per-target async mutexes.
#[derive(Debug, Clone, Default)]
pub struct SessionQueues {
    inner: Arc<Mutex<HashMap<SessionTarget, Arc<AsyncMutex<()>>>>>,
}

impl SessionQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the queue for `target` and wait for the slot. Waiters acquire in
    /// arrival order.
    pub async fn acquire(&self, target: &SessionTarget) -> QueueSlot {
        let lock = {
            let mut map = self.inner.lock().unwrap();
            Arc::clone(map.entry(target.clone()).or_default())
        };
        lock.lock_owned().await
    }

    /// Drop queue entries nobody is waiting on. Driven by the same background
    /// task that sweeps the dedup store.
    pub fn prune(&self) {
        let mut map = self.inner.lock().unwrap();
        // strong_count == 1 means only the map holds the mutex: no slot held,
        // no waiters queued.
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn target(agent: &str) -> SessionTarget {
        SessionTarget::new("sess-1", agent)
    }

    #[tokio::test(start_paused = true)]
    async fn same_target_requests_run_one_at_a_time() {
        let queues = SessionQueues::new();
        let active = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let queues = queues.clone();
            let active = Arc::clone(&active);
            handles.push(tokio::spawn(async move {
                let _slot = queues.acquire(&target("arch-1")).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                assert_eq!(now, 1, "execution sections must not overlap");
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn distinct_targets_do_not_contend() {
        let queues = SessionQueues::new();
        let _a = queues.acquire(&target("arch-1")).await;
        // Must not block even though arch-1's slot is held.
        let _b = queues.acquire(&target("builder-2")).await;
        assert_eq!(queues.len(), 2);
    }

    #[tokio::test]
    async fn prune_keeps_held_slots_and_drops_idle_entries() {
        let queues = SessionQueues::new();
        let slot = queues.acquire(&target("arch-1")).await;
        {
            let _brief = queues.acquire(&target("builder-2")).await;
        }

        queues.prune();
        assert_eq!(queues.len(), 1, "held slot must survive pruning");

        drop(slot);
        queues.prune();
        assert!(queues.is_empty());
    }
}
