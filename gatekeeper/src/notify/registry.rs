//! Local poll registry: this process's waiting tickets and the coalescing sweep.
//!
//! Signals never run callbacks directly. They bump `pending` and, if no sweep is running,
//! start one. The sweeper keeps going while `pending` is non-zero, so at most one sweep runs
//! at a time and every signal is folded into a sweep that starts after it.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::time::Instant;

use crate::ticket::RequestId;

/// Retry hook for a waiting ticket. Runs once per sweep.
pub type RetryFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Registration {
    sequence: u64,
    retry: RetryFn,
    /// Whatever drives the ticket. Once it is gone nothing will deregister the entry.
    owner: Weak<dyn Send + Sync>,
    registered_at: Instant,
}

impl Registration {
    fn is_orphaned(&self) -> bool {
        self.owner.strong_count() == 0
    }
}

pub struct LocalPollRegistry {
    waiters: DashMap<RequestId, Registration>,
    pending: AtomicUsize,
    sweeping: AtomicBool,
    sweeps: AtomicU64,
}

impl LocalPollRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            waiters: DashMap::new(),
            pending: AtomicUsize::new(0),
            sweeping: AtomicBool::new(false),
            sweeps: AtomicU64::new(0),
        })
    }

    pub fn register(
        &self,
        request_id: RequestId,
        sequence: u64,
        retry: RetryFn,
        owner: Weak<dyn Send + Sync>,
    ) {
        self.waiters.insert(
            request_id,
            Registration {
                sequence,
                retry,
                owner,
                registered_at: Instant::now(),
            },
        );
    }

    /// Re-sort a waiter after it was re-enqueued under a new sequence.
    pub fn update_sequence(&self, request_id: &RequestId, sequence: u64) {
        if let Some(mut entry) = self.waiters.get_mut(request_id) {
            entry.sequence = sequence;
        }
    }

    pub fn deregister(&self, request_id: &RequestId) -> bool {
        self.waiters.remove(request_id).is_some()
    }

    pub fn is_registered(&self, request_id: &RequestId) -> bool {
        self.waiters.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Completed sweep passes since startup.
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Acquire)
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeping.load(Ordering::SeqCst)
    }

    /// Capacity may have changed. Starts a sweep or folds into the running one.
    pub fn signal(self: &Arc<Self>) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tokio::spawn(Arc::clone(self).drain());
        }
    }

    async fn drain(self: Arc<Self>) {
        loop {
            if self.pending.swap(0, Ordering::SeqCst) == 0 {
                self.sweeping.store(false, Ordering::SeqCst);
                // A signal may have landed between the swap and the store. Whoever wins
                // the flag back owns the next sweep.
                if self.pending.load(Ordering::SeqCst) == 0
                    || self
                        .sweeping
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_err()
                {
                    return;
                }
                continue;
            }
            self.sweep_once().await;
        }
    }

    /// Run every registered retry once, oldest sequence first.
    ///
    /// Retries run one after another so that, within a process, an older ticket's claim and
    /// permit acquisition finish before a younger ticket looks at the capacity hint.
    pub async fn sweep_once(&self) {
        let mut batch: Vec<(u64, RequestId, RetryFn)> = self
            .waiters
            .iter()
            .map(|e| (e.sequence, e.key().clone(), Arc::clone(&e.retry)))
            .collect();
        batch.sort_by_key(|(sequence, _, _)| *sequence);

        tracing::trace!(waiters = batch.len(), "Sweep started");
        for (_, request_id, retry) in batch {
            if AssertUnwindSafe(retry()).catch_unwind().await.is_err() {
                tracing::error!(%request_id, "Retry panicked during sweep");
            }
        }
        self.sweeps.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop registrations older than `horizon` whose owner is gone. Returns how many were
    /// purged. A live waiter is never purged, however long it has been waiting.
    pub fn purge_stale(&self, horizon: Duration) -> usize {
        let now = Instant::now();
        let before = self.waiters.len();
        self.waiters.retain(|_, r| {
            !r.is_orphaned() || now.saturating_duration_since(r.registered_at) < horizon
        });
        let purged = before.saturating_sub(self.waiters.len());
        if purged > 0 {
            tracing::warn!(purged, "Purged stale waiter registrations");
        }
        purged
    }

    pub fn clear(&self) {
        self.waiters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn owned_by(owner: &Arc<()>) -> Weak<dyn Send + Sync> {
        Arc::downgrade(owner) as Weak<dyn Send + Sync>
    }

    fn counting_retry(counter: Arc<AtomicUsize>) -> RetryFn {
        Arc::new(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    async fn wait_idle(registry: &LocalPollRegistry) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.is_sweeping() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("sweeper never went idle");
    }

    #[tokio::test]
    async fn sweep_runs_every_registration_once() {
        let registry = LocalPollRegistry::new();
        let owner = Arc::new(());
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..3 {
            registry.register(
                format!("r{i}").into(),
                i,
                counting_retry(Arc::clone(&counter)),
                owned_by(&owner),
            );
        }

        registry.sweep_once().await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(registry.sweeps(), 1);
    }

    #[tokio::test]
    async fn sweep_order_follows_sequence() {
        let registry = LocalPollRegistry::new();
        let owner = Arc::new(());
        let order = Arc::new(Mutex::new(Vec::new()));
        for (id, seq) in [("c", 30), ("a", 10), ("b", 20)] {
            let order = Arc::clone(&order);
            registry.register(
                id.into(),
                seq,
                Arc::new(move || {
                    let order = Arc::clone(&order);
                    async move { order.lock().unwrap().push(id) }.boxed()
                }),
                owned_by(&owner),
            );
        }
        registry.update_sequence(&"c".into(), 5);

        registry.sweep_once().await;
        assert_eq!(*order.lock().unwrap(), vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn burst_of_signals_coalesces() {
        let registry = LocalPollRegistry::new();
        let owner = Arc::new(());
        let counter = Arc::new(AtomicUsize::new(0));
        registry.register("r".into(), 1, counting_retry(Arc::clone(&counter)), owned_by(&owner));

        for _ in 0..50 {
            registry.signal();
        }
        wait_idle(&registry).await;

        let sweeps = registry.sweeps();
        assert!(sweeps >= 1);
        assert!(sweeps < 50, "expected coalescing, got {sweeps} sweeps");
        assert_eq!(counter.load(Ordering::SeqCst) as u64, sweeps);
    }

    #[tokio::test]
    async fn signal_after_idle_starts_new_sweep() {
        let registry = LocalPollRegistry::new();
        registry.signal();
        wait_idle(&registry).await;
        let first = registry.sweeps();

        registry.signal();
        wait_idle(&registry).await;
        assert_eq!(registry.sweeps(), first + 1);
    }

    #[tokio::test]
    async fn panicking_retry_does_not_wedge_sweeper() {
        let registry = LocalPollRegistry::new();
        let owner = Arc::new(());
        registry.register(
            "bad".into(),
            1,
            Arc::new(|| {
                async {
                    panic!("boom");
                }
                .boxed()
            }),
            owned_by(&owner),
        );
        let counter = Arc::new(AtomicUsize::new(0));
        registry.register(
            "good".into(),
            2,
            counting_retry(Arc::clone(&counter)),
            owned_by(&owner),
        );

        registry.signal();
        wait_idle(&registry).await;
        registry.signal();
        wait_idle(&registry).await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_removes_only_old_orphaned_registrations() {
        let registry = LocalPollRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let gone = Arc::new(());
        registry.register(
            "old".into(),
            1,
            counting_retry(Arc::clone(&counter)),
            owned_by(&gone),
        );
        drop(gone);
        tokio::time::advance(Duration::from_secs(120)).await;
        let fresh = Arc::new(());
        registry.register("new".into(), 2, counting_retry(counter), owned_by(&fresh));
        drop(fresh);

        assert_eq!(registry.purge_stale(Duration::from_secs(60)), 1);
        assert!(!registry.is_registered(&"old".into()));
        assert!(registry.is_registered(&"new".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_keeps_long_waiting_live_registrations() {
        let registry = LocalPollRegistry::new();
        let owner = Arc::new(());
        registry.register(
            "patient".into(),
            1,
            counting_retry(Arc::new(AtomicUsize::new(0))),
            owned_by(&owner),
        );
        tokio::time::advance(Duration::from_secs(600)).await;

        assert_eq!(registry.purge_stale(Duration::from_secs(60)), 0);
        assert!(registry.is_registered(&"patient".into()));
    }

    #[tokio::test]
    async fn deregister_is_idempotent() {
        let registry = LocalPollRegistry::new();
        let owner = Arc::new(());
        registry.register(
            "r".into(),
            1,
            counting_retry(Arc::new(AtomicUsize::new(0))),
            owned_by(&owner),
        );
        assert!(registry.deregister(&"r".into()));
        assert!(!registry.deregister(&"r".into()));
        assert!(registry.is_empty());
    }
}
