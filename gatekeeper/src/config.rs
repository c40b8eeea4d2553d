//! Admission configuration.
//!
//! Every option can change at runtime. Components hold a [`ConfigHandle`] and take a fresh
//! [`AdmissionConfig`] snapshot for each operation instead of caching values at startup.

use std::time::Duration;

use tokio::sync::watch;

const DEFAULT_REJECTION_MESSAGE: &str =
    "The assistant is handling too many conversations right now. Please try again shortly.";

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionConfig {
    /// When false, requests skip the queue and run immediately.
    pub global_enabled: bool,
    pub max_concurrent: u32,
    /// Default wait budget for a ticket that does not bring its own.
    pub max_wait: Duration,
    /// Permit TTL. A crashed holder loses capacity for at most this long.
    pub lease: Duration,
    /// Fallback sweep period.
    pub poll_interval: Duration,
    /// Local registrations older than this are purged.
    pub stale_after: Duration,
    pub rejection_message: String,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            global_enabled: env_or("GATEKEEPER_ENABLED", true),
            max_concurrent: env_or("GATEKEEPER_MAX_CONCURRENT", 8),
            max_wait: Duration::from_secs(env_or("GATEKEEPER_MAX_WAIT_SECONDS", 60)),
            lease: Duration::from_secs(env_or("GATEKEEPER_LEASE_SECONDS", 300)),
            poll_interval: Duration::from_millis(env_or("GATEKEEPER_POLL_INTERVAL_MS", 5000)),
            stale_after: Duration::from_secs(env_or("GATEKEEPER_STALE_SECONDS", 300)),
            rejection_message: std::env::var("GATEKEEPER_REJECTION_MESSAGE")
                .unwrap_or_else(|_| DEFAULT_REJECTION_MESSAGE.to_string()),
        }
    }
}

impl AdmissionConfig {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.global_enabled = enabled;
        self
    }

    pub fn with_max_concurrent(mut self, n: u32) -> Self {
        self.max_concurrent = n;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_rejection_message(mut self, message: impl Into<String>) -> Self {
        self.rejection_message = message.into();
        self
    }

    /// Zero would spin the fallback loop.
    pub(crate) fn effective_poll_interval(&self) -> Duration {
        self.poll_interval.max(Duration::from_millis(10))
    }
}

/// Shared, hot-reloadable view of [`AdmissionConfig`].
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    tx: std::sync::Arc<watch::Sender<AdmissionConfig>>,
}

impl ConfigHandle {
    pub fn new(config: AdmissionConfig) -> Self {
        let (tx, _rx) = watch::channel(config);
        Self {
            tx: std::sync::Arc::new(tx),
        }
    }

    pub fn snapshot(&self) -> AdmissionConfig {
        self.tx.borrow().clone()
    }

    /// Replace the whole configuration.
    pub fn replace(&self, config: AdmissionConfig) {
        self.tx.send_replace(config);
    }

    pub fn update(&self, f: impl FnOnce(&mut AdmissionConfig)) {
        self.tx.send_modify(f);
        tracing::info!(config = ?*self.tx.borrow(), "Admission config updated");
    }

    pub fn subscribe(&self) -> watch::Receiver<AdmissionConfig> {
        self.tx.subscribe()
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(AdmissionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_override_defaults() {
        let config = AdmissionConfig::default()
            .with_enabled(false)
            .with_max_concurrent(3)
            .with_max_wait(Duration::ZERO)
            .with_lease(Duration::from_secs(9))
            .with_poll_interval(Duration::from_millis(250));

        assert!(!config.global_enabled);
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.max_wait, Duration::ZERO);
        assert_eq!(config.lease, Duration::from_secs(9));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn zero_poll_interval_is_clamped() {
        let config = AdmissionConfig::default().with_poll_interval(Duration::ZERO);
        assert_eq!(config.effective_poll_interval(), Duration::from_millis(10));
    }

    #[test]
    fn handle_sees_updates() {
        let handle = ConfigHandle::new(AdmissionConfig::default().with_max_concurrent(1));
        let clone = handle.clone();

        handle.update(|c| c.max_concurrent = 4);
        assert_eq!(clone.snapshot().max_concurrent, 4);

        clone.replace(AdmissionConfig::default().with_max_concurrent(2));
        assert_eq!(handle.snapshot().max_concurrent, 2);
    }

    #[tokio::test]
    async fn subscribers_observe_changes() {
        let handle = ConfigHandle::default();
        let mut rx = handle.subscribe();

        handle.update(|c| c.global_enabled = false);
        rx.changed().await.unwrap();
        assert!(!rx.borrow().global_enabled);
    }
}
