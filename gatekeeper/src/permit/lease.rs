//! Admission lease: the permit handed to admitted work, with an exactly-once release.
//!
//! Every exit path (completion, error, caller cancel, drop) funnels into
//! [`AdmissionLease::release`]. The first call releases the permit and publishes a capacity
//! signal. Later calls return `false` and touch nothing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

use super::LeasePermitPool;
use crate::notify::NotificationCoordinator;
use crate::ticket::{PermitId, RequestId};

#[derive(Clone)]
struct Metered {
    permit: PermitId,
    pool: LeasePermitPool,
    coordinator: NotificationCoordinator,
}

impl Metered {
    async fn release_and_publish(&self) -> bool {
        match self.pool.release(self.permit).await {
            Ok(true) => {
                // Publish failures are logged by the coordinator; the fallback sweep covers them.
                let _ = self.coordinator.publish().await;
                true
            }
            Ok(false) => {
                tracing::debug!(permit = %self.permit, "Lease already expired at release");
                false
            }
            Err(e) => {
                tracing::error!(permit = %self.permit, error = %e, "Failed to release permit, lease will expire");
                false
            }
        }
    }
}

struct ReleaseOnce {
    /// `None` when admission control is bypassed.
    metered: Option<Metered>,
    fired: AtomicBool,
}

impl ReleaseOnce {
    async fn release(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        match &self.metered {
            Some(m) => m.release_and_publish().await,
            None => true,
        }
    }
}

impl Drop for ReleaseOnce {
    fn drop(&mut self) {
        if self.fired.load(Ordering::Acquire) {
            return;
        }
        let Some(metered) = self.metered.take() else {
            return;
        };
        tracing::warn!(permit = %metered.permit, "Lease dropped without release, releasing in background");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                metered.release_and_publish().await;
            });
        }
    }
}

/// Capacity held by an admitted request.
#[derive(Clone)]
pub struct AdmissionLease {
    request_id: RequestId,
    cancel: CancellationToken,
    inner: Arc<ReleaseOnce>,
}

impl AdmissionLease {
    pub(crate) fn new(
        request_id: RequestId,
        permit: PermitId,
        pool: LeasePermitPool,
        coordinator: NotificationCoordinator,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            request_id,
            cancel,
            inner: Arc::new(ReleaseOnce {
                metered: Some(Metered {
                    permit,
                    pool,
                    coordinator,
                }),
                fired: AtomicBool::new(false),
            }),
        }
    }

    /// Lease backed by no permit, for bypassed admission.
    pub(crate) fn unmetered(request_id: RequestId, cancel: CancellationToken) -> Self {
        Self {
            request_id,
            cancel,
            inner: Arc::new(ReleaseOnce {
                metered: None,
                fired: AtomicBool::new(false),
            }),
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn permit_id(&self) -> Option<PermitId> {
        self.inner.metered.as_ref().map(|m| m.permit)
    }

    /// Fires when the caller goes away.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_released(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    /// Give the capacity back. Returns `true` only for the call that actually released it.
    pub async fn release(&self) -> bool {
        self.inner.release().await
    }
}

impl std::fmt::Debug for AdmissionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionLease")
            .field("request_id", &self.request_id)
            .field("permit", &self.permit_id())
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::{AdmissionConfig, ConfigHandle};
    use crate::notify::LocalPollRegistry;
    use crate::store::{CoordinationStore, MemoryStore};

    struct Fixture {
        store: Arc<MemoryStore>,
        pool: LeasePermitPool,
        coordinator: NotificationCoordinator,
    }

    fn fixture(max: u32) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let config = ConfigHandle::new(AdmissionConfig::default().with_max_concurrent(max));
        let dyn_store: Arc<dyn CoordinationStore> = store.clone();
        Fixture {
            pool: LeasePermitPool::new(Arc::clone(&dyn_store), config),
            coordinator: NotificationCoordinator::new(dyn_store, LocalPollRegistry::new()),
            store,
        }
    }

    async fn lease(f: &Fixture) -> AdmissionLease {
        let permit = f
            .pool
            .acquire(Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        AdmissionLease::new(
            "r1".into(),
            permit,
            f.pool.clone(),
            f.coordinator.clone(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn second_release_is_noop() {
        let f = fixture(2);
        let lease = lease(&f).await;
        f.pool.acquire(Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(f.pool.available_count().await.unwrap(), 0);

        let clone = lease.clone();
        assert!(lease.release().await);
        assert!(!clone.release().await);
        assert_eq!(f.pool.available_count().await.unwrap(), 1);
        assert!(clone.is_released());
    }

    #[tokio::test]
    async fn concurrent_releases_fire_once() {
        let f = fixture(1);
        let lease = lease(&f).await;

        let other = lease.clone();
        let (a, b) = tokio::join!(lease.release(), other.release());
        assert!(a ^ b);
        assert_eq!(f.pool.available_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn release_publishes_capacity_signal() {
        let f = fixture(1);
        let mut rx = f.store.subscribe();
        let lease = lease(&f).await;

        lease.release().await;
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn dropped_lease_releases_in_background() {
        let f = fixture(1);
        drop(lease(&f).await);

        tokio::time::timeout(Duration::from_secs(5), async {
            while f.pool.available_count().await.unwrap() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("dropped lease never released");
    }

    #[tokio::test]
    async fn unmetered_lease_touches_no_store() {
        let f = fixture(1);
        let lease = AdmissionLease::unmetered("r2".into(), CancellationToken::new());
        assert!(lease.permit_id().is_none());
        assert!(lease.release().await);
        assert!(!lease.release().await);
        assert_eq!(f.pool.available_count().await.unwrap(), 1);
    }
}
