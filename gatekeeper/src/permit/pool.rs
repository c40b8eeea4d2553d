//! Lease permit pool: bounded, cluster-shared concurrency capacity.
//!
//! Permits are leases. A holder that crashes without releasing loses the capacity for at
//! most one TTL window, after which the store reclaims it passively.

use std::sync::Arc;
use std::time::Duration;

use crate::config::ConfigHandle;
use crate::store::{CoordinationStore, StoreError};
use crate::ticket::PermitId;

#[derive(Clone)]
pub struct LeasePermitPool {
    store: Arc<dyn CoordinationStore>,
    config: ConfigHandle,
}

impl LeasePermitPool {
    pub fn new(store: Arc<dyn CoordinationStore>, config: ConfigHandle) -> Self {
        Self { store, config }
    }

    /// Lease a permit for `ttl`. Never waits: returns `None` when the pool is exhausted.
    pub async fn acquire(&self, ttl: Duration) -> Result<Option<PermitId>, StoreError> {
        let max = self.config.snapshot().max_concurrent;
        let permit = self.store.permit_acquire(max, ttl).await?;
        match permit {
            Some(id) => tracing::debug!(permit = %id, ttl = ?ttl, "Permit acquired"),
            None => tracing::trace!(max, "Permit pool exhausted"),
        }
        Ok(permit)
    }

    /// Release `permit` if it is still live.
    ///
    /// Unknown, already released and expired ids are no-ops and return `false`.
    pub async fn release(&self, permit: PermitId) -> Result<bool, StoreError> {
        let released = self.store.permit_release(permit).await?;
        if released {
            tracing::debug!(permit = %permit, "Permit released");
        } else {
            tracing::trace!(permit = %permit, "Release of unknown or expired permit ignored");
        }
        Ok(released)
    }

    /// Snapshot hint of free capacity. Claims re-validate, so staleness is harmless.
    pub async fn available_count(&self) -> Result<u32, StoreError> {
        let max = self.config.snapshot().max_concurrent;
        let live = self.store.permits_live().await?;
        Ok(max.saturating_sub(live))
    }
}
