//! Downstream execution seam.
//!
//! Once a ticket holds a permit it is wrapped in a [`DispatchJob`] and offered to an
//! [`Executor`]. Rejection is not an error: the orchestrator releases the permit and puts the
//! ticket back in the queue.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Semaphore;

use crate::permit::AdmissionLease;
use crate::ticket::RequestId;

/// Work to run once admitted. Receives the lease; releasing it early is allowed.
pub type AdmittedTask = Box<dyn FnOnce(AdmissionLease) -> BoxFuture<'static, ()> + Send>;

pub struct DispatchJob {
    lease: AdmissionLease,
    task: AdmittedTask,
}

impl DispatchJob {
    pub(crate) fn new(lease: AdmissionLease, task: AdmittedTask) -> Self {
        Self { lease, task }
    }

    pub fn request_id(&self) -> &RequestId {
        self.lease.request_id()
    }

    pub fn lease(&self) -> &AdmissionLease {
        &self.lease
    }

    pub(crate) fn into_parts(self) -> (AdmissionLease, AdmittedTask) {
        (self.lease, self.task)
    }

    /// Run the task to completion or caller cancellation, then release the lease.
    pub async fn run(self) {
        let Self { lease, task } = self;
        let cancel = lease.cancel_token();
        let work = task(lease.clone());
        tokio::select! {
            _ = work => {}
            _ = cancel.cancelled() => {
                tracing::debug!(request_id = %lease.request_id(), "Admitted work cancelled by caller");
            }
        }
        lease.release().await;
    }
}

pub enum Submission {
    Accepted,
    /// Downstream is saturated. The job comes back untouched.
    Rejected(DispatchJob),
}

pub trait Executor: Send + Sync {
    /// Hand off `job` without blocking.
    fn submit(&self, job: DispatchJob) -> Submission;
}

/// Spawns each job on the tokio runtime, optionally bounded by an in-flight limit.
#[derive(Clone, Default)]
pub struct SpawnExecutor {
    limit: Option<Arc<Semaphore>>,
}

impl SpawnExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject submissions while `max_in_flight` jobs are running.
    pub fn bounded(max_in_flight: usize) -> Self {
        Self {
            limit: Some(Arc::new(Semaphore::new(max_in_flight))),
        }
    }
}

impl Executor for SpawnExecutor {
    fn submit(&self, job: DispatchJob) -> Submission {
        let slot = match &self.limit {
            Some(sem) => match Arc::clone(sem).try_acquire_owned() {
                Ok(slot) => Some(slot),
                Err(_) => return Submission::Rejected(job),
            },
            None => None,
        };
        tokio::spawn(async move {
            job.run().await;
            drop(slot);
        });
        Submission::Accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use futures::FutureExt;
    use tokio_util::sync::CancellationToken;

    use crate::config::{AdmissionConfig, ConfigHandle};
    use crate::notify::{LocalPollRegistry, NotificationCoordinator};
    use crate::permit::LeasePermitPool;
    use crate::store::{CoordinationStore, MemoryStore};

    async fn job_with(
        pool: &LeasePermitPool,
        coordinator: &NotificationCoordinator,
        cancel: CancellationToken,
        task: AdmittedTask,
    ) -> DispatchJob {
        let permit = pool.acquire(Duration::from_secs(60)).await.unwrap().unwrap();
        let lease = AdmissionLease::new("r1".into(), permit, pool.clone(), coordinator.clone(), cancel);
        DispatchJob::new(lease, task)
    }

    fn parts(max: u32) -> (LeasePermitPool, NotificationCoordinator) {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let config = ConfigHandle::new(AdmissionConfig::default().with_max_concurrent(max));
        (
            LeasePermitPool::new(Arc::clone(&store), config),
            NotificationCoordinator::new(store, LocalPollRegistry::new()),
        )
    }

    #[tokio::test]
    async fn run_releases_after_completion() {
        let (pool, coord) = parts(1);
        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);
        let job = job_with(
            &pool,
            &coord,
            CancellationToken::new(),
            Box::new(move |_lease| {
                async move {
                    r.store(true, Ordering::SeqCst);
                }
                .boxed()
            }),
        )
        .await;

        job.run().await;
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(pool.available_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cancel_stops_work_and_releases() {
        let (pool, coord) = parts(1);
        let cancel = CancellationToken::new();
        let job = job_with(
            &pool,
            &coord,
            cancel.clone(),
            Box::new(|_lease| std::future::pending::<()>().boxed()),
        )
        .await;

        cancel.cancel();
        job.run().await;
        assert_eq!(pool.available_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn early_release_inside_task_is_not_doubled() {
        let (pool, coord) = parts(2);
        let _other = pool.acquire(Duration::from_secs(60)).await.unwrap().unwrap();
        let job = job_with(
            &pool,
            &coord,
            CancellationToken::new(),
            Box::new(|lease| {
                async move {
                    lease.release().await;
                }
                .boxed()
            }),
        )
        .await;

        job.run().await;
        assert_eq!(pool.available_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn bounded_executor_rejects_when_full() {
        let (pool, coord) = parts(2);
        let executor = SpawnExecutor::bounded(1);
        let hold = CancellationToken::new();

        let h = hold.clone();
        let first = job_with(
            &pool,
            &coord,
            CancellationToken::new(),
            Box::new(move |_| async move { h.cancelled().await }.boxed()),
        )
        .await;
        assert!(matches!(executor.submit(first), Submission::Accepted));

        let second = job_with(
            &pool,
            &coord,
            CancellationToken::new(),
            Box::new(|_| async {}.boxed()),
        )
        .await;
        match executor.submit(second) {
            Submission::Rejected(job) => assert_eq!(job.request_id().as_str(), "r1"),
            Submission::Accepted => panic!("expected rejection"),
        }
        hold.cancel();
    }
}
