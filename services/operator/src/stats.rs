//! Controller counters.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

/// Process-wide controller counters, shared by the dispatcher and actors.
#[derive(Debug, Default)]
pub struct ControllerStats {
    clusters_created: AtomicU64,
    clusters_modified: AtomicU64,
    clusters_deleted: AtomicU64,
    clusters_failed: AtomicU64,
    clusters_total: AtomicI64,
    reconcile_ticks: AtomicU64,
    reconcile_failures: AtomicU64,
}

/// Point-in-time copy of [`ControllerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub clusters_created: u64,
    pub clusters_modified: u64,
    pub clusters_deleted: u64,
    pub clusters_failed: u64,
    pub clusters_total: i64,
    pub reconcile_ticks: u64,
    pub reconcile_failures: u64,
}

impl ControllerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn cluster_created(&self) {
        self.clusters_created.fetch_add(1, Ordering::Relaxed);
        self.clusters_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn cluster_modified(&self) {
        self.clusters_modified.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn cluster_deleted(&self) {
        self.clusters_deleted.fetch_add(1, Ordering::Relaxed);
        self.clusters_total.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn cluster_failed(&self) {
        self.clusters_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reconcile_tick(&self) {
        self.reconcile_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reconcile_failure(&self) {
        self.reconcile_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            clusters_created: self.clusters_created.load(Ordering::Relaxed),
            clusters_modified: self.clusters_modified.load(Ordering::Relaxed),
            clusters_deleted: self.clusters_deleted.load(Ordering::Relaxed),
            clusters_failed: self.clusters_failed.load(Ordering::Relaxed),
            clusters_total: self.clusters_total.load(Ordering::Relaxed),
            reconcile_ticks: self.reconcile_ticks.load(Ordering::Relaxed),
            reconcile_failures: self.reconcile_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_follows_create_and_delete() {
        let stats = ControllerStats::new();
        stats.cluster_created();
        stats.cluster_created();
        stats.cluster_deleted();

        let snap = stats.snapshot();
        assert_eq!(snap.clusters_created, 2);
        assert_eq!(snap.clusters_deleted, 1);
        assert_eq!(snap.clusters_total, 1);
    }
}
