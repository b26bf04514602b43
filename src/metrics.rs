use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Counters and meters of the update path. Window counters cover the
/// current commit interval and reset when it ends; cumulative counters and
/// meters are process-lifetime.
#[derive(Default)]
pub struct UpdateMetrics {
    adds: AtomicU64,
    deletes_by_id: AtomicU64,
    deletes_by_query: AtomicU64,
    errors: AtomicU64,
    cumulative_adds: AtomicU64,
    cumulative_deletes_by_id: AtomicU64,
    cumulative_deletes_by_query: AtomicU64,
    cumulative_errors: AtomicU64,
    commits: AtomicU64,
    soft_commits: AtomicU64,
    optimizes: AtomicU64,
    expunge_deletes: AtomicU64,
    rollbacks: AtomicU64,
    splits: AtomicU64,
    merge_indexes: AtomicU64,
    docs_pending: AtomicI64,
}

impl UpdateMetrics {
    pub fn inc_adds(&self) {
        self.adds.fetch_add(1, Ordering::Relaxed);
        self.cumulative_adds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_deletes_by_id(&self) {
        self.deletes_by_id.fetch_add(1, Ordering::Relaxed);
        self.cumulative_deletes_by_id.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_deletes_by_query(&self) {
        self.deletes_by_query.fetch_add(1, Ordering::Relaxed);
        self.cumulative_deletes_by_query
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.cumulative_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_docs_pending(&self) {
        self.docs_pending.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset_docs_pending(&self) {
        self.docs_pending.store(0, Ordering::Relaxed);
    }

    pub fn docs_pending(&self) -> i64 {
        self.docs_pending.load(Ordering::Relaxed)
    }

    pub fn mark_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_soft_commit(&self) {
        self.soft_commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_optimize(&self) {
        self.optimizes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_expunge_deletes(&self) {
        self.expunge_deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_split(&self) {
        self.splits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_merge_indexes(&self) {
        self.merge_indexes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn adds(&self) -> u64 {
        self.adds.load(Ordering::Relaxed)
    }

    /// End of a commit interval: the window counters start over. Errors are
    /// not reset; they track the process lifetime alongside the cumulative
    /// counter.
    pub fn reset_window(&self) {
        self.adds.store(0, Ordering::Relaxed);
        self.deletes_by_id.store(0, Ordering::Relaxed);
        self.deletes_by_query.store(0, Ordering::Relaxed);
    }

    /// A rollback undoes the uncommitted window: the cumulative counters
    /// are rewound by the window amounts before the window resets.
    pub fn rollback_window(&self) {
        let adds = self.adds.swap(0, Ordering::Relaxed);
        let dels = self.deletes_by_id.swap(0, Ordering::Relaxed);
        let dbqs = self.deletes_by_query.swap(0, Ordering::Relaxed);
        self.cumulative_adds.fetch_sub(adds, Ordering::Relaxed);
        self.cumulative_deletes_by_id.fetch_sub(dels, Ordering::Relaxed);
        self.cumulative_deletes_by_query
            .fetch_sub(dbqs, Ordering::Relaxed);
    }

    pub fn snapshot(
        &self,
        auto_commits: u64,
        soft_auto_commits: u64,
        txn_logs_total_size: u64,
        txn_logs_total_number: usize,
    ) -> MetricsSnapshot {
        MetricsSnapshot {
            adds: self.adds.load(Ordering::Relaxed),
            deletes_by_id: self.deletes_by_id.load(Ordering::Relaxed),
            deletes_by_query: self.deletes_by_query.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            cumulative_adds: self.cumulative_adds.load(Ordering::Relaxed),
            cumulative_deletes_by_id: self.cumulative_deletes_by_id.load(Ordering::Relaxed),
            cumulative_deletes_by_query: self.cumulative_deletes_by_query.load(Ordering::Relaxed),
            cumulative_errors: self.cumulative_errors.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            soft_commits: self.soft_commits.load(Ordering::Relaxed),
            optimizes: self.optimizes.load(Ordering::Relaxed),
            expunge_deletes: self.expunge_deletes.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            splits: self.splits.load(Ordering::Relaxed),
            merge_indexes: self.merge_indexes.load(Ordering::Relaxed),
            docs_pending: self.docs_pending.load(Ordering::Relaxed),
            auto_commits,
            soft_auto_commits,
            txn_logs_total_size,
            txn_logs_total_number,
        }
    }
}

/// A point-in-time view of [`UpdateMetrics`] plus the gauges owned by the
/// commit trackers and the update log.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub adds: u64,
    pub deletes_by_id: u64,
    pub deletes_by_query: u64,
    pub errors: u64,
    pub cumulative_adds: u64,
    pub cumulative_deletes_by_id: u64,
    pub cumulative_deletes_by_query: u64,
    pub cumulative_errors: u64,
    pub commits: u64,
    pub soft_commits: u64,
    pub optimizes: u64,
    pub expunge_deletes: u64,
    pub rollbacks: u64,
    pub splits: u64,
    pub merge_indexes: u64,
    pub docs_pending: i64,
    pub auto_commits: u64,
    pub soft_auto_commits: u64,
    pub txn_logs_total_size: u64,
    pub txn_logs_total_number: usize,
}
