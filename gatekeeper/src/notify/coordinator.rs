//! Notification coordinator: cluster-wide "capacity changed" broadcast.
//!
//! Delivery is best-effort. A missed or lagged message is covered by the fallback sweep,
//! which signals the local registry every `poll_interval`.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::LocalPollRegistry;
use crate::config::ConfigHandle;
use crate::store::{CoordinationStore, StoreError};

/// Stale registrations are checked this often.
const STALE_PURGE_PERIOD: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Clone)]
pub struct NotificationCoordinator {
    store: Arc<dyn CoordinationStore>,
    registry: Arc<LocalPollRegistry>,
}

impl NotificationCoordinator {
    pub fn new(store: Arc<dyn CoordinationStore>, registry: Arc<LocalPollRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &Arc<LocalPollRegistry> {
        &self.registry
    }

    /// Tell every process that capacity may have changed.
    pub async fn publish(&self) -> Result<(), StoreError> {
        self.store.publish().await.inspect_err(|e| {
            tracing::error!(error = %e, "Failed to publish capacity signal");
        })
    }

    /// Forward broadcast signals into the local registry until `shutdown` fires.
    pub fn spawn_listener(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut rx = self.store.subscribe();
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(_) => registry.signal(),
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "Capacity signals lagged, sweeping once");
                            registry.signal();
                        }
                        Err(RecvError::Closed) => {
                            tracing::warn!("Capacity signal channel closed");
                            break;
                        }
                    },
                }
            }
            tracing::debug!("Capacity signal listener stopped");
        })
    }

    /// Periodic safety-net sweep. The period is re-read from config on every tick.
    pub fn spawn_fallback_sweep(
        &self,
        config: ConfigHandle,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            loop {
                let period = config.snapshot().effective_poll_interval();
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(period) => {
                        if !registry.is_empty() {
                            registry.signal();
                        }
                    }
                }
            }
        })
    }

    /// Background purge of registrations whose owner left through another path.
    pub fn spawn_stale_purge(
        &self,
        config: ConfigHandle,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STALE_PURGE_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.purge_stale(config.snapshot().stale_after);
                    }
                }
            }
        })
    }
}
