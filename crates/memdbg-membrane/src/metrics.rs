//! Atomic counters for tracker observability.
//!
//! All counters use relaxed ordering. They are diagnostic only and never used
//! for synchronization.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Per-context operation counters.
#[derive(Debug)]
pub struct TrackerMetrics {
    /// Successful allocations (including string duplicates).
    pub allocations: AtomicU64,
    /// Successful reallocations that moved a block.
    pub reallocations: AtomicU64,
    /// Successful releases.
    pub releases: AtomicU64,
    /// Releases of a null pointer, ignored.
    pub null_releases: AtomicU64,
    pub string_duplicates: AtomicU64,
    /// Validator walks that completed without error.
    pub validations: AtomicU64,
    /// Guard checks that found a damaged sentinel.
    pub guard_failures: AtomicU64,
    /// Sum of requested payload sizes.
    pub bytes_requested: AtomicU64,
    /// High-water mark of live payload bytes.
    pub peak_live_bytes: AtomicU64,
}

impl TrackerMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allocations: AtomicU64::new(0),
            reallocations: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            null_releases: AtomicU64::new(0),
            string_duplicates: AtomicU64::new(0),
            validations: AtomicU64::new(0),
            guard_failures: AtomicU64::new(0),
            bytes_requested: AtomicU64::new(0),
            peak_live_bytes: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, amount: usize) {
        counter.fetch_add(amount as u64, Ordering::Relaxed);
    }

    /// Raise the live-bytes high-water mark.
    pub fn observe_live(&self, live_bytes: usize) {
        self.peak_live_bytes
            .fetch_max(live_bytes as u64, Ordering::Relaxed);
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            allocations: Self::get(&self.allocations),
            reallocations: Self::get(&self.reallocations),
            releases: Self::get(&self.releases),
            null_releases: Self::get(&self.null_releases),
            string_duplicates: Self::get(&self.string_duplicates),
            validations: Self::get(&self.validations),
            guard_failures: Self::get(&self.guard_failures),
            bytes_requested: Self::get(&self.bytes_requested),
            peak_live_bytes: Self::get(&self.peak_live_bytes),
        }
    }
}

impl Default for TrackerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of all tracker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub allocations: u64,
    pub reallocations: u64,
    pub releases: u64,
    pub null_releases: u64,
    pub string_duplicates: u64,
    pub validations: u64,
    pub guard_failures: u64,
    pub bytes_requested: u64,
    pub peak_live_bytes: u64,
}
