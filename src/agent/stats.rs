//! Agent counters with atomic, lock-free updates. Snapshots serialise for
//! the diagnostics surface and the periodic summary log line.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct AgentStats {
    /// Completed slow optimisation cycles.
    pub slow_cycles: AtomicU64,
    /// Completed fast scan cycles.
    pub fast_cycles: AtomicU64,
    /// Boosts published by the fast path.
    pub fast_boosts: AtomicU64,
    /// Successful desired-state writes.
    pub writes_ok: AtomicU64,
    /// Failed desired-state writes.
    pub writes_failed: AtomicU64,
    /// Writes withheld by the hysteresis gate.
    pub writes_skipped_hysteresis: AtomicU64,
    /// Writes withheld by cooldown.
    pub writes_skipped_cooldown: AtomicU64,
    /// Samples dropped for insufficient usage or counter resets.
    pub samples_dropped: AtomicU64,
    /// Workloads skipped this lifetime because their cgroup was unreadable.
    pub sample_errors: AtomicU64,
    /// Back-off sleeps triggered by failing write cycles.
    pub backoffs: AtomicU64,
}

impl AgentStats {
    #[inline]
    pub fn inc_slow_cycles(&self) {
        self.slow_cycles.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_fast_cycles(&self) {
        self.fast_cycles.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_fast_boosts(&self) {
        self.fast_boosts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_writes_ok(&self) {
        self.writes_ok.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_writes_failed(&self) {
        self.writes_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_skipped_hysteresis(&self) {
        self.writes_skipped_hysteresis.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_skipped_cooldown(&self) {
        self.writes_skipped_cooldown.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_samples_dropped(&self) {
        self.samples_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_sample_errors(&self) {
        self.sample_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_backoffs(&self) {
        self.backoffs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AgentStatsSnapshot {
        AgentStatsSnapshot {
            slow_cycles: self.slow_cycles.load(Ordering::Relaxed),
            fast_cycles: self.fast_cycles.load(Ordering::Relaxed),
            fast_boosts: self.fast_boosts.load(Ordering::Relaxed),
            writes_ok: self.writes_ok.load(Ordering::Relaxed),
            writes_failed: self.writes_failed.load(Ordering::Relaxed),
            writes_skipped_hysteresis: self.writes_skipped_hysteresis.load(Ordering::Relaxed),
            writes_skipped_cooldown: self.writes_skipped_cooldown.load(Ordering::Relaxed),
            samples_dropped: self.samples_dropped.load(Ordering::Relaxed),
            sample_errors: self.sample_errors.load(Ordering::Relaxed),
            backoffs: self.backoffs.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters for serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatsSnapshot {
    pub slow_cycles: u64,
    pub fast_cycles: u64,
    pub fast_boosts: u64,
    pub writes_ok: u64,
    pub writes_failed: u64,
    pub writes_skipped_hysteresis: u64,
    pub writes_skipped_cooldown: u64,
    pub samples_dropped: u64,
    pub sample_errors: u64,
    pub backoffs: u64,
}
