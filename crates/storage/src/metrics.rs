//! Store counters
//!
//! Counters are purely observational and use Relaxed ordering. They do not
//! synchronize any other memory operations.

use aggregator_core::RaceWarning;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters owned by a store
#[derive(Debug, Default)]
pub struct StoreMetrics {
    items_appended: AtomicU64,
    groups_created: AtomicU64,
    completions: AtomicU64,
    duplicate_creates: AtomicU64,
    lost_completions: AtomicU64,
    corrupt_items: AtomicU64,
    rollbacks: AtomicU64,
    rollback_failures: AtomicU64,
}

/// Point-in-time copy of [`StoreMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreMetricsSnapshot {
    /// Items committed
    pub items_appended: u64,
    /// Group rows created
    pub groups_created: u64,
    /// Successful `mark_complete` transitions
    pub completions: u64,
    /// Create attempts that found the group already created concurrently
    pub duplicate_creates: u64,
    /// `mark_complete` calls that affected zero rows
    pub lost_completions: u64,
    /// Item rows skipped during fetch
    pub corrupt_items: u64,
    /// Transactions rolled back after an error
    pub rollbacks: u64,
    /// Rollbacks that themselves failed
    pub rollback_failures: u64,
}

impl StoreMetrics {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a committed item append
    pub fn record_append(&self, created_group: bool) {
        self.items_appended.fetch_add(1, Ordering::Relaxed);
        if created_group {
            self.groups_created.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a winning completion
    pub fn record_completion(&self) {
        self.completions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a rolled back transaction
    pub fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an absorbed race condition
    pub fn record_warning(&self, warning: &RaceWarning) {
        let counter = match warning {
            RaceWarning::DuplicateCreate { .. } => &self.duplicate_creates,
            RaceWarning::CompletionAlreadyApplied { .. } => &self.lost_completions,
            RaceWarning::CorruptItem { .. } => &self.corrupt_items,
            RaceWarning::RollbackFailed { .. } => &self.rollback_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current values
    pub fn snapshot(&self) -> StoreMetricsSnapshot {
        StoreMetricsSnapshot {
            items_appended: self.items_appended.load(Ordering::Relaxed),
            groups_created: self.groups_created.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
            duplicate_creates: self.duplicate_creates.load(Ordering::Relaxed),
            lost_completions: self.lost_completions.load(Ordering::Relaxed),
            corrupt_items: self.corrupt_items.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            rollback_failures: self.rollback_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aggregator_core::GroupKey;

    #[test]
    fn test_warnings_map_to_counters() {
        let metrics = StoreMetrics::new();
        let group = GroupKey::new("a", "g");

        metrics.record_warning(&RaceWarning::DuplicateCreate {
            group: group.clone(),
        });
        metrics.record_warning(&RaceWarning::CompletionAlreadyApplied {
            group: group.clone(),
        });
        metrics.record_warning(&RaceWarning::CompletionAlreadyApplied { group });
        metrics.record_warning(&RaceWarning::RollbackFailed {
            operation: "add_item",
            reason: "disk I/O error".to_string(),
        });

        let snap = metrics.snapshot();
        assert_eq!(snap.duplicate_creates, 1);
        assert_eq!(snap.lost_completions, 2);
        assert_eq!(snap.rollback_failures, 1);
        assert_eq!(snap.corrupt_items, 0);
    }

    #[test]
    fn test_append_counts_created_groups() {
        let metrics = StoreMetrics::new();
        metrics.record_append(true);
        metrics.record_append(false);
        metrics.record_append(false);

        let snap = metrics.snapshot();
        assert_eq!(snap.items_appended, 3);
        assert_eq!(snap.groups_created, 1);
    }
}
