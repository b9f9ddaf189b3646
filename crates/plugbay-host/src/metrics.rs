//! Host metrics.
//!
//! Counters live inside the coordinator (single writer); external readers
//! only ever see value snapshots.

/// Pollable snapshot of the host's load activity.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct HostMetrics {
    /// Live plugin instances.
    pub loaded_count: usize,
    /// Tasks waiting in the load queue.
    pub queued_count: usize,
    /// Loads currently in flight.
    pub loading_count: usize,
    /// Load attempts dispatched since startup, successful or not.
    pub total_loads: u64,
    pub successful_loads: u64,
    /// Tasks dropped after exhausting their attempts.
    pub failed_loads: u64,
    /// Mean wall-clock duration of successful loads, in milliseconds.
    pub average_load_time_ms: u64,
}

/// Coordinator-owned counter state behind [`HostMetrics`] snapshots.
#[derive(Debug, Default)]
pub(crate) struct MetricsState {
    pub total_loads: u64,
    pub successful_loads: u64,
    pub failed_loads: u64,
    load_time_total_ms: u64,
}

impl MetricsState {
    pub fn record_success(&mut self, load_time_ms: u64) {
        self.successful_loads += 1;
        self.load_time_total_ms += load_time_ms;
    }

    pub fn snapshot(&self, loaded: usize, queued: usize, loading: usize) -> HostMetrics {
        let average_load_time_ms = if self.successful_loads == 0 {
            0
        } else {
            self.load_time_total_ms / self.successful_loads
        };
        HostMetrics {
            loaded_count: loaded,
            queued_count: queued,
            loading_count: loading,
            total_loads: self.total_loads,
            successful_loads: self.successful_loads,
            failed_loads: self.failed_loads,
            average_load_time_ms,
        }
    }
}
