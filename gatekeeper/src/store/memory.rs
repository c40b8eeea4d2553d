//! In-process coordination store.
//!
//! Every operation runs inside a single critical section, the local equivalent of a
//! store-side script. Share one `Arc<MemoryStore>` between several nodes to model a cluster.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::{CapacitySignal, ClaimOutcome, CoordinationStore, StoreError};
use crate::ticket::{PermitId, RequestId};

const SIGNAL_CAPACITY: usize = 64;

/// Far enough out to mean "never" without overflowing `Instant`.
const FOREVER: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn expiry_after(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .or_else(|| now.checked_add(FOREVER))
        .unwrap_or(now)
}

#[derive(Default)]
struct State {
    sequence: u64,
    by_sequence: BTreeMap<u64, RequestId>,
    /// request -> (sequence, entry expiry)
    by_request: HashMap<RequestId, (u64, Instant)>,
    leases: HashMap<PermitId, Instant>,
}

impl State {
    fn purge_expired_leases(&mut self, now: Instant) {
        self.leases.retain(|_, expiry| *expiry >= now);
    }

    fn purge_expired_entries(&mut self, now: Instant) {
        let by_sequence = &mut self.by_sequence;
        self.by_request.retain(|request_id, (sequence, expiry)| {
            let live = *expiry >= now;
            if !live {
                tracing::debug!(%request_id, sequence = *sequence, "Queue entry expired");
                by_sequence.remove(sequence);
            }
            live
        });
    }

    fn remove_entry(&mut self, request_id: &RequestId) -> Option<u64> {
        let (sequence, _) = self.by_request.remove(request_id)?;
        self.by_sequence.remove(&sequence);
        Some(sequence)
    }
}

pub struct MemoryStore {
    state: StdMutex<State>,
    available: AtomicBool,
    signals: broadcast::Sender<CapacitySignal>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            state: StdMutex::new(State::default()),
            available: AtomicBool::new(true),
            signals,
        }
    }

    /// Simulate the store becoming unreachable (or reachable again).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> Result<T, StoreError> {
        if !self.available.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| StoreError::Corrupted("state mutex poisoned".to_string()))?;
        Ok(f(&mut state))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn next_sequence(&self) -> Result<u64, StoreError> {
        self.with_state(|s| {
            s.sequence += 1;
            s.sequence
        })
    }

    async fn queue_insert(
        &self,
        request_id: &RequestId,
        sequence: u64,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let now = Instant::now();
        self.with_state(|s| {
            s.purge_expired_entries(now);
            s.remove_entry(request_id);
            s.by_sequence.insert(sequence, request_id.clone());
            s.by_request
                .insert(request_id.clone(), (sequence, expiry_after(now, ttl)));
        })
    }

    async fn queue_claim(
        &self,
        request_id: &RequestId,
        available: u32,
    ) -> Result<ClaimOutcome, StoreError> {
        let now = Instant::now();
        self.with_state(|s| {
            s.purge_expired_entries(now);
            let Some(&(sequence, _)) = s.by_request.get(request_id) else {
                return ClaimOutcome::missed(None);
            };
            let available = available as usize;
            if available == 0 {
                return ClaimOutcome::missed(Some(sequence));
            }
            let ahead = s.by_sequence.range(..sequence).take(available).count();
            if ahead >= available {
                return ClaimOutcome::missed(Some(sequence));
            }
            s.remove_entry(request_id);
            ClaimOutcome::won(sequence)
        })
    }

    async fn queue_remove(&self, request_id: &RequestId) -> Result<bool, StoreError> {
        self.with_state(|s| s.remove_entry(request_id).is_some())
    }

    async fn queue_len(&self) -> Result<usize, StoreError> {
        let now = Instant::now();
        self.with_state(|s| {
            s.purge_expired_entries(now);
            s.by_sequence.len()
        })
    }

    async fn queue_position(&self, request_id: &RequestId) -> Result<Option<usize>, StoreError> {
        let now = Instant::now();
        self.with_state(|s| {
            s.purge_expired_entries(now);
            let (sequence, _) = *s.by_request.get(request_id)?;
            Some(s.by_sequence.range(..sequence).count())
        })
    }

    async fn permit_acquire(
        &self,
        max: u32,
        ttl: Duration,
    ) -> Result<Option<PermitId>, StoreError> {
        let now = Instant::now();
        self.with_state(|s| {
            s.purge_expired_leases(now);
            if s.leases.len() >= max as usize {
                return None;
            }
            let permit = PermitId::new();
            s.leases.insert(permit, expiry_after(now, ttl));
            Some(permit)
        })
    }

    async fn permit_release(&self, permit: PermitId) -> Result<bool, StoreError> {
        let now = Instant::now();
        self.with_state(|s| {
            s.purge_expired_leases(now);
            s.leases.remove(&permit).is_some()
        })
    }

    async fn permits_live(&self) -> Result<u32, StoreError> {
        let now = Instant::now();
        self.with_state(|s| {
            s.purge_expired_leases(now);
            s.leases.len() as u32
        })
    }

    async fn publish(&self) -> Result<(), StoreError> {
        if !self.available.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        // No subscribers is not an error: nobody is waiting.
        let _ = self.signals.send(CapacitySignal);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CapacitySignal> {
        self.signals.subscribe()
    }
}
