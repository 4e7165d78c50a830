//! Metrics collection for the subscription cache
//!
//! Thread-safe counters updated by the cache manager, its refresh tasks and the
//! snapshot writer.

use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics collector for the cache manager
///
/// All operations are thread-safe using atomic operations.
#[derive(Debug, Default)]
pub struct ManagerMetrics {
    // Registration statistics
    registrations: AtomicU64,
    replacements: AtomicU64,

    // Refresh statistics
    refresh_successes: AtomicU64,
    refresh_failures: AtomicU64,
    on_demand_fetches: AtomicU64,
    conversion_failures: AtomicU64,

    // Live background refresh tasks
    active_refresh_tasks: AtomicU64,

    // Snapshot statistics
    snapshot_writes: AtomicU64,
    snapshot_failures: AtomicU64,
    snapshot_restored_entries: AtomicU64,
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub registrations: u64,
    pub replacements: u64,
    pub refresh_successes: u64,
    pub refresh_failures: u64,
    pub on_demand_fetches: u64,
    pub conversion_failures: u64,
    pub active_refresh_tasks: u64,
    pub snapshot_writes: u64,
    pub snapshot_failures: u64,
    pub snapshot_restored_entries: u64,
}

impl ManagerMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a registration, `replaced` when an entry of the same name existed
    pub fn record_registration(&self, replaced: bool) {
        self.registrations.fetch_add(1, Ordering::Relaxed);
        if replaced {
            self.replacements.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record the outcome of a scheduled refresh
    pub fn record_refresh(&self, success: bool) {
        if success {
            self.refresh_successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.refresh_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_on_demand_fetch(&self) {
        self.on_demand_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conversion_failure(&self) {
        self.conversion_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn refresh_task_started(&self) {
        self.active_refresh_tasks.fetch_add(1, Ordering::SeqCst);
    }

    pub fn refresh_task_stopped(&self) {
        self.active_refresh_tasks.fetch_sub(1, Ordering::SeqCst);
    }

    /// Number of refresh tasks currently running
    pub fn active_refresh_tasks(&self) -> u64 {
        self.active_refresh_tasks.load(Ordering::SeqCst)
    }

    /// Record the outcome of a snapshot write
    pub fn record_snapshot_write(&self, success: bool) {
        if success {
            self.snapshot_writes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.snapshot_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_restored_entries(&self, count: u64) {
        self.snapshot_restored_entries.fetch_add(count, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    pub fn get_stats(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            registrations: self.registrations.load(Ordering::Relaxed),
            replacements: self.replacements.load(Ordering::Relaxed),
            refresh_successes: self.refresh_successes.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
            on_demand_fetches: self.on_demand_fetches.load(Ordering::Relaxed),
            conversion_failures: self.conversion_failures.load(Ordering::Relaxed),
            active_refresh_tasks: self.active_refresh_tasks.load(Ordering::SeqCst),
            snapshot_writes: self.snapshot_writes.load(Ordering::Relaxed),
            snapshot_failures: self.snapshot_failures.load(Ordering::Relaxed),
            snapshot_restored_entries: self.snapshot_restored_entries.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    /// Scheduled refresh failure rate as a percentage (0-100)
    pub fn refresh_failure_rate(&self) -> f64 {
        let total = self.refresh_successes + self.refresh_failures;
        if total == 0 {
            0.0
        } else {
            (self.refresh_failures as f64 / total as f64) * 100.0
        }
    }
}
