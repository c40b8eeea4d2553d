//! Coordination store: the only state shared between processes.
//!
//! Each method is one indivisible operation on the backing store. A networked backend must
//! implement them with a server-side atomic facility (script or transaction). Independent
//! read-then-write calls are never acceptable: two processes could both win the same slot.

mod memory;

pub use memory::MemoryStore;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::ticket::{PermitId, RequestId};

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
    #[error("coordination store state corrupted: {0}")]
    Corrupted(String),
}

/// Result of an atomic claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimOutcome {
    pub claimed: bool,
    /// Sequence of the entry, if it was in the queue.
    pub sequence: Option<u64>,
}

impl ClaimOutcome {
    pub fn missed(sequence: Option<u64>) -> Self {
        Self {
            claimed: false,
            sequence,
        }
    }

    pub fn won(sequence: u64) -> Self {
        Self {
            claimed: true,
            sequence: Some(sequence),
        }
    }
}

/// Broadcast payload for "capacity may have changed".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacitySignal;

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Atomically increment and return the global sequence.
    async fn next_sequence(&self) -> Result<u64, StoreError>;

    /// Insert `(sequence, request_id)`. An existing entry for `request_id` is replaced.
    ///
    /// The entry disappears on its own after `ttl`, so a process that dies while waiting
    /// cannot block the head of the queue forever.
    async fn queue_insert(
        &self,
        request_id: &RequestId,
        sequence: u64,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Remove `request_id` if it is among the `available` lowest sequences.
    async fn queue_claim(
        &self,
        request_id: &RequestId,
        available: u32,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Returns whether an entry was removed.
    async fn queue_remove(&self, request_id: &RequestId) -> Result<bool, StoreError>;

    async fn queue_len(&self) -> Result<usize, StoreError>;

    /// Zero-based rank of `request_id`, lowest sequence first.
    async fn queue_position(&self, request_id: &RequestId) -> Result<Option<usize>, StoreError>;

    /// Lease a permit if fewer than `max` unexpired leases exist.
    async fn permit_acquire(
        &self,
        max: u32,
        ttl: Duration,
    ) -> Result<Option<PermitId>, StoreError>;

    /// Returns whether `permit` was live and is now released.
    async fn permit_release(&self, permit: PermitId) -> Result<bool, StoreError>;

    /// Unexpired leases right now.
    async fn permits_live(&self) -> Result<u32, StoreError>;

    /// Best-effort broadcast to every subscriber.
    async fn publish(&self) -> Result<(), StoreError>;

    fn subscribe(&self) -> broadcast::Receiver<CapacitySignal>;
}
