//! AdmissionNode: per-process wiring of the admission layer.
//!
//! The node owns the background tasks (signal listener, fallback sweep, stale purge) and the
//! orchestrator. Build it once per process with [`NodeBuilder`], share it behind an `Arc`, and
//! call [`AdmissionNode::shutdown`] before exit.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigHandle;
use crate::error::AdmissionError;
use crate::executor::{AdmittedTask, Executor, SpawnExecutor};
use crate::notify::{LocalPollRegistry, NotificationCoordinator};
use crate::orchestrator::{AdmissionHandle, AdmissionOrchestrator, AdmissionRequest};
use crate::permit::LeasePermitPool;
use crate::queue::FairQueue;
use crate::rejection::{MemoryRejectionLog, RejectionRecorder};
use crate::store::{CoordinationStore, StoreError};
use crate::ticket::RequestId;

/// Point-in-time view for health endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionSnapshot {
    pub enabled: bool,
    pub max_concurrent: u32,
    pub available_permits: u32,
    /// Cluster-wide.
    pub queue_depth: usize,
    /// This process only.
    pub local_waiters: usize,
    pub active_tickets: usize,
    pub sweeps: u64,
}

impl AdmissionSnapshot {
    /// Every permit is leased.
    pub fn is_saturated(&self) -> bool {
        self.enabled && self.available_permits == 0
    }
}

pub struct NodeBuilder {
    store: Arc<dyn CoordinationStore>,
    config: ConfigHandle,
    executor: Arc<dyn Executor>,
    recorder: Arc<dyn RejectionRecorder>,
}

impl NodeBuilder {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            config: ConfigHandle::default(),
            executor: Arc::new(SpawnExecutor::new()),
            recorder: Arc::new(MemoryRejectionLog::new()),
        }
    }

    pub fn with_config(mut self, config: ConfigHandle) -> Self {
        self.config = config;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn RejectionRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Subscribe to capacity signals and start the background timers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> Arc<AdmissionNode> {
        let shutdown = CancellationToken::new();
        let coordinator =
            NotificationCoordinator::new(Arc::clone(&self.store), LocalPollRegistry::new());
        let queue = FairQueue::new(Arc::clone(&self.store));
        let pool = LeasePermitPool::new(Arc::clone(&self.store), self.config.clone());

        let tasks = vec![
            coordinator.spawn_listener(shutdown.clone()),
            coordinator.spawn_fallback_sweep(self.config.clone(), shutdown.clone()),
            coordinator.spawn_stale_purge(self.config.clone(), shutdown.clone()),
        ];

        let orchestrator = AdmissionOrchestrator::new(
            self.config.clone(),
            queue.clone(),
            pool.clone(),
            coordinator.clone(),
            self.executor,
            self.recorder,
            shutdown.clone(),
        );

        let snapshot = self.config.snapshot();
        tracing::info!(
            enabled = snapshot.global_enabled,
            max_concurrent = snapshot.max_concurrent,
            max_wait_secs = snapshot.max_wait.as_secs(),
            lease_secs = snapshot.lease.as_secs(),
            "Admission node started"
        );

        Arc::new(AdmissionNode {
            config: self.config,
            queue,
            pool,
            coordinator,
            orchestrator,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }
}

pub struct AdmissionNode {
    config: ConfigHandle,
    queue: FairQueue,
    pool: LeasePermitPool,
    coordinator: NotificationCoordinator,
    orchestrator: Arc<AdmissionOrchestrator>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AdmissionNode {
    pub fn builder(store: Arc<dyn CoordinationStore>) -> NodeBuilder {
        NodeBuilder::new(store)
    }

    /// Start a node with the default executor and recorder.
    pub fn start(store: Arc<dyn CoordinationStore>, config: ConfigHandle) -> Arc<Self> {
        NodeBuilder::new(store).with_config(config).start()
    }

    pub async fn admit(
        &self,
        request: AdmissionRequest,
        task: AdmittedTask,
    ) -> Result<AdmissionHandle, AdmissionError> {
        self.orchestrator.admit(request, task).await
    }

    pub fn cancel(&self, request_id: &RequestId) -> bool {
        self.orchestrator.cancel(request_id)
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn queue(&self) -> &FairQueue {
        &self.queue
    }

    pub fn pool(&self) -> &LeasePermitPool {
        &self.pool
    }

    pub fn coordinator(&self) -> &NotificationCoordinator {
        &self.coordinator
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub async fn snapshot(&self) -> Result<AdmissionSnapshot, StoreError> {
        let config = self.config.snapshot();
        let registry = self.coordinator.registry();
        Ok(AdmissionSnapshot {
            enabled: config.global_enabled,
            max_concurrent: config.max_concurrent,
            available_permits: self.pool.available_count().await?,
            queue_depth: self.queue.len().await?,
            local_waiters: registry.len(),
            active_tickets: self.orchestrator.active_count(),
            sweeps: registry.sweeps(),
        })
    }

    /// Stop accepting tickets, cancel the waiting ones and stop the background tasks.
    ///
    /// Idempotent. Dispatched work is cancelled through its lease token and releases its
    /// permit on the way out.
    pub async fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!("Admission node shutting down");
        }
        self.shutdown.cancel();
        self.orchestrator.drain().await;

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.coordinator.registry().clear();
        tracing::debug!("Admission node stopped");
    }
}
