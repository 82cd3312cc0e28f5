//! Single-flight request deduplication store.
//!
//! One atomic operation, [`DedupStore::reserve_or_get`], gives every control
//! request exactly one of three answers: a fresh reservation (caller
//! executes), a cached record (caller replays it as a duplicate), or a wait
//! timeout (the in-flight original outlived the duplicate's wait bound).
//!
//! Time is measured with [`tokio::time::Instant`] so TTL and wait-bound
//! behavior is deterministic under paused test time.

use agent_ctl_core::ResultCode;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Composite idempotency key for control requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub team: String,
    pub session_id: String,
    pub agent_id: String,
    pub request_id: String,
}

impl DedupKey {
    pub fn new(team: &str, session_id: &str, agent_id: &str, request_id: &str) -> Self {
        Self {
            team: team.to_string(),
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            request_id: request_id.to_string(),
        }
    }
}

/// Stored outcome of a finalized request, replayed verbatim for repeats
/// within its TTL.
#[derive(Debug, Clone)]
pub struct DedupRecord {
    pub result: ResultCode,
    pub detail: Option<String>,
    pub error: Option<String>,
    /// RFC3339 timestamp of the original decision, echoed on replays.
    pub acked_at: String,
    /// Purge point for this record.
    pub expires_at: Instant,
    /// How many duplicate deliveries this record has served.
    pub duplicate_served: u64,
}

enum Entry {
    Pending {
        generation: u64,
        rx: watch::Receiver<bool>,
    },
    Done(DedupRecord),
}

struct Shared {
    entries: HashMap<DedupKey, Entry>,
    /// Finalized keys in finalize order, for oldest-first capacity eviction.
    /// The snapshot `Instant` disambiguates re-finalized keys.
    order: VecDeque<(DedupKey, Instant)>,
    next_generation: u64,
}

/// Outcome of [`DedupStore::reserve_or_get`].
pub enum Reservation {
    /// No record exists; the caller holds the single-flight slot.
    Reserved(ReservationGuard),
    /// A finalized record exists (or the in-flight original just finalized);
    /// the caller replays it with `duplicate = true`.
    Cached(DedupRecord),
    /// The in-flight original did not resolve within the wait bound.
    WaitTimeout,
}

/// In-memory dedup store with single-flight reservations, TTL expiry, and
/// bounded capacity.
pub struct DedupStore {
    shared: Arc<Mutex<Shared>>,
    ttl: Duration,
    capacity: usize,
    pending_wait: Duration,
}

impl DedupStore {
    pub fn new(ttl: Duration, capacity: usize, pending_wait: Duration) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                entries: HashMap::new(),
                order: VecDeque::new(),
                next_generation: 0,
            })),
            ttl,
            capacity,
            pending_wait,
        }
    }

    /// Atomically look up or reserve the single-flight slot for `key`.
    ///
    /// Callers seeing a pending reservation block (bounded by the configured
    /// pending wait) until the original finalizes or releases, then
    /// re-examine the store. A released reservation lets the waiter take a
    /// fresh slot of its own.
    pub async fn reserve_or_get(&self, key: DedupKey) -> Reservation {
        let deadline = Instant::now() + self.pending_wait;
        loop {
            let mut rx = {
                let mut shared = self.shared.lock().unwrap();
                let now = Instant::now();
                purge_front(&mut shared, now);

                // Expired record for this exact key: clear it and reserve anew.
                let expired = matches!(
                    shared.entries.get(&key),
                    Some(Entry::Done(record)) if record.expires_at <= now
                );
                if expired {
                    shared.entries.remove(&key);
                }

                match shared.entries.get_mut(&key) {
                    None => {
                        let (tx, rx) = watch::channel(false);
                        let generation = shared.next_generation;
                        shared.next_generation += 1;
                        shared
                            .entries
                            .insert(key.clone(), Entry::Pending { generation, rx });
                        return Reservation::Reserved(ReservationGuard {
                            shared: Arc::clone(&self.shared),
                            key,
                            generation,
                            tx,
                            ttl: self.ttl,
                            capacity: self.capacity,
                            done: false,
                        });
                    }
                    Some(Entry::Done(record)) => {
                        record.duplicate_served += 1;
                        return Reservation::Cached(record.clone());
                    }
                    Some(Entry::Pending { rx, .. }) => rx.clone(),
                }
            };

            // In-flight duplicate: wait (outside the lock) for the original
            // to resolve, then re-examine.
            match tokio::time::timeout_at(deadline, rx.wait_for(|resolved| *resolved)).await {
                Ok(_) => continue,
                Err(_) => {
                    warn!("duplicate wait bound elapsed while original still in flight");
                    return Reservation::WaitTimeout;
                }
            }
        }
    }

    /// Purge expired finalized records.
    ///
    /// Driven by a background interval task; also safe to call ad hoc.
    /// Pending reservations are never removed: the owning guard resolves the
    /// entry on every exit path, including drop, and executors may
    /// legitimately hold a reservation open for many execution bounds while
    /// queued behind other requests for the same target.
    pub fn sweep(&self) {
        let mut shared = self.shared.lock().unwrap();
        let now = Instant::now();
        let before = shared.entries.len();

        let Shared { entries, order, .. } = &mut *shared;
        entries.retain(|_, entry| match entry {
            Entry::Done(record) => record.expires_at > now,
            Entry::Pending { .. } => true,
        });
        order.retain(|(key, expires_at)| *expires_at > now && entries.contains_key(key));

        let removed = before - shared.entries.len();
        if removed > 0 {
            debug!("dedup sweep removed {removed} entries");
        }
    }

    /// Number of live entries (finalized plus pending).
    pub fn len(&self) -> usize {
        self.shared.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// TTL applied to finalized records.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Pop expired finalized records off the order front. Finalize order is
/// expiry order, so stopping at the first live record is correct.
fn purge_front(shared: &mut Shared, now: Instant) {
    while let Some((key, expires_at)) = shared.order.front().cloned() {
        if expires_at > now {
            break;
        }
        shared.order.pop_front();
        if matches!(
            shared.entries.get(&key),
            Some(Entry::Done(record)) if record.expires_at == expires_at
        ) {
            shared.entries.remove(&key);
        }
    }
}

fn evict_to_capacity(shared: &mut Shared, capacity: usize) {
    while shared.order.len() > capacity {
        let Some((key, expires_at)) = shared.order.pop_front() else {
            break;
        };
        if matches!(
            shared.entries.get(&key),
            Some(Entry::Done(record)) if record.expires_at == expires_at
        ) {
            shared.entries.remove(&key);
        }
    }
}

/// The single-flight slot for one key.
///
/// Exactly one of [`finalize`](Self::finalize) or [`release`](Self::release)
/// should be called. A guard dropped without either (task panic, abandoned
/// future) finalizes as `internal_error` so concurrent waiters never hang on
/// a vanished executor.
pub struct ReservationGuard {
    shared: Arc<Mutex<Shared>>,
    key: DedupKey,
    generation: u64,
    tx: watch::Sender<bool>,
    ttl: Duration,
    capacity: usize,
    done: bool,
}

impl ReservationGuard {
    /// Store the computed outcome and wake waiters. The record expires at
    /// `acked_at + TTL`.
    pub fn finalize(
        mut self,
        result: ResultCode,
        detail: Option<String>,
        error: Option<String>,
        acked_at: String,
    ) -> DedupRecord {
        let record = DedupRecord {
            result,
            detail,
            error,
            acked_at,
            expires_at: Instant::now() + self.ttl,
            duplicate_served: 0,
        };
        self.install(record.clone());
        record
    }

    /// Give the slot back without storing an outcome, so a retry re-runs the
    /// full pipeline. Used for liveness failures, which must be re-evaluated
    /// on every delivery.
    pub fn release(mut self) {
        self.done = true;
        {
            let mut shared = self.shared.lock().unwrap();
            if self.holds_slot(&shared) {
                shared.entries.remove(&self.key);
            }
        }
        let _ = self.tx.send(true);
    }

    fn holds_slot(&self, shared: &Shared) -> bool {
        matches!(
            shared.entries.get(&self.key),
            Some(Entry::Pending { generation, .. }) if *generation == self.generation
        )
    }

    fn install(&mut self, record: DedupRecord) {
        self.done = true;
        {
            let mut shared = self.shared.lock().unwrap();
            if self.holds_slot(&shared) {
                shared.order.push_back((self.key.clone(), record.expires_at));
                shared.entries.insert(self.key.clone(), Entry::Done(record));
                evict_to_capacity(&mut shared, self.capacity);
            }
        }
        let _ = self.tx.send(true);
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        warn!("dedup reservation abandoned without finalize; recording internal_error");
        let record = DedupRecord {
            result: ResultCode::InternalError,
            detail: Some("request abandoned before completion".to_string()),
            error: None,
            acked_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            expires_at: Instant::now() + self.ttl,
            duplicate_served: 0,
        };
        self.install(record);
    }
}
