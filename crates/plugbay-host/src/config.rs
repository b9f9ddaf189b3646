//! Host configuration.

use plugbay_manifest::HostCeilings;
use plugbay_sandbox::PoolConfig;

/// How the scheduler handles a failed load attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts before the task is dropped and `LoadFailed` emitted.
    pub max_attempts: u32,
    /// Degrade the task one priority tier on each retry.
    pub degrade_priority: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            degrade_priority: true,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_degrade_priority(mut self, degrade: bool) -> Self {
        self.degrade_priority = degrade;
        self
    }
}

/// Tuning knobs for the plugin host.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// How many loads may be in flight at once.
    pub max_concurrent_loads: usize,
    /// How long a caller waits on a lazy resolve or `load_now` before
    /// `LoadTimeout`.  The dispatched load itself is not cancelled.
    pub load_timeout_ms: u64,
    /// Load queue capacity; enqueueing beyond it fails with `QueueFull`.
    pub queue_capacity: usize,
    /// Per-instance delivery queue depth for events and jobs.
    pub delivery_capacity: usize,
    /// Host event bus capacity.
    pub event_capacity: usize,
    /// Retry behavior for failed loads.
    pub retry: RetryPolicy,
    /// Ceilings that manifests are validated against.
    pub ceilings: HostCeilings,
    /// Worker pool sizing.
    pub pool: PoolConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_concurrent_loads: 2,
            load_timeout_ms: 30_000,
            queue_capacity: 256,
            delivery_capacity: 64,
            event_capacity: 64,
            retry: RetryPolicy::default(),
            ceilings: HostCeilings::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl HostConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_concurrent_loads(mut self, n: usize) -> Self {
        self.max_concurrent_loads = n.max(1);
        self
    }

    #[must_use]
    pub fn with_load_timeout_ms(mut self, ms: u64) -> Self {
        self.load_timeout_ms = ms;
        self
    }

    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_ceilings(mut self, ceilings: HostCeilings) -> Self {
        self.ceilings = ceilings;
        self
    }

    #[must_use]
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = HostConfig::default();
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.retry.degrade_priority);
        assert!(config.max_concurrent_loads >= 1);
    }

    #[test]
    fn builders_clamp_to_minimums() {
        let config = HostConfig::new()
            .with_max_concurrent_loads(0)
            .with_queue_capacity(0)
            .with_retry(RetryPolicy::new().with_max_attempts(0));
        assert_eq!(config.max_concurrent_loads, 1);
        assert_eq!(config.queue_capacity, 1);
        assert_eq!(config.retry.max_attempts, 1);
    }
}
