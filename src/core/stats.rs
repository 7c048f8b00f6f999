//! Pool statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Point-in-time view of the service pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Configured capacity.
    pub capacity: usize,
    /// Handles currently tracked by the pool (idle + in use).
    pub total_instances: usize,
    /// Tracked handles sitting in the idle queue.
    pub available: usize,
    /// Tracked handles checked out to callers.
    pub in_use: usize,
    /// Operations that held a permit, successful or not.
    pub total_operations: u64,
    /// Operations that returned an error or were abandoned. A failed handle
    /// creation counts here too.
    pub failed_operations: u64,
    /// Mean time from call entry to holding a handle.
    pub average_wait_time: Duration,
    /// Unpooled handles created because the pool was saturated.
    pub temporary_handles_created: u64,
    /// Handles discarded because they were corrupted.
    pub corrupted_evictions: u64,
    /// Handles discarded by the idle sweep.
    pub idle_evictions: u64,
}

/// Internal counters for pool statistics (thread-safe).
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub total_operations: AtomicU64,
    pub failed_operations: AtomicU64,
    pub wait_time_micros: AtomicU64,
    pub acquisitions: AtomicU64,
    pub temporary_handles: AtomicU64,
    pub corrupted_evictions: AtomicU64,
    pub idle_evictions: AtomicU64,
}

impl PoolCounters {
    /// Record the time a caller waited for a handle.
    pub fn record_wait(&self, waited: Duration) {
        let micros = u64::try_from(waited.as_micros()).unwrap_or(u64::MAX);
        self.wait_time_micros.fetch_add(micros, Ordering::Relaxed);
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished operation.
    pub fn record_operation(&self, failed: bool) {
        self.total_operations.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.failed_operations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Mean wait across all acquisitions.
    pub fn average_wait(&self) -> Duration {
        let count = self.acquisitions.load(Ordering::Relaxed);
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.wait_time_micros.load(Ordering::Relaxed) / count)
    }

    /// Get a snapshot of current statistics.
    pub fn snapshot(&self, capacity: usize, total_instances: usize, available: usize) -> PoolStats {
        PoolStats {
            capacity,
            total_instances,
            available,
            in_use: total_instances.saturating_sub(available),
            total_operations: self.total_operations.load(Ordering::Relaxed),
            failed_operations: self.failed_operations.load(Ordering::Relaxed),
            average_wait_time: self.average_wait(),
            temporary_handles_created: self.temporary_handles.load(Ordering::Relaxed),
            corrupted_evictions: self.corrupted_evictions.load(Ordering::Relaxed),
            idle_evictions: self.idle_evictions.load(Ordering::Relaxed),
        }
    }
}
