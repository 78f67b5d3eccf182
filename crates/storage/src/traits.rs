//! The storage contract required by the aggregation strategies
//!
//! [`AggregationStore`] is the only seam between the engine and persistent
//! storage. Implementations must provide the transactional guarantees below
//! using the backend's own transaction and uniqueness mechanisms; no
//! in-process lock is sufficient when several processes share one backend.

use aggregator_core::{
    AddedItem, GroupKey, GroupSettings, GroupStatus, Result, StoredItem, Timestamp,
};

use crate::metrics::StoreMetricsSnapshot;

/// Durable storage of groups and their items
///
/// Thread safety: all methods must be safe to call concurrently from multiple
/// threads (requires Send + Sync).
///
/// Group lifecycle: `Absent -> Open -> Complete`. A group is created by the
/// first `add_item` for its key and becomes complete exactly once through
/// `mark_complete`. Complete is terminal.
pub trait AggregationStore: Send + Sync {
    /// Append an item, creating the group if it does not exist
    ///
    /// Runs as one transaction: create-or-fetch group, assign the next
    /// sequence number, insert the item, commit. On any failure the whole
    /// transaction is rolled back.
    ///
    /// `settings` are recorded only when this call creates the group.
    ///
    /// # Errors
    ///
    /// - `Validation` for a blank aggregator name or group id, or an empty payload
    /// - `GroupClosed` if the group already completed
    /// - `Storage` on transaction or connection failure
    fn add_item(&self, key: &GroupKey, settings: GroupSettings, payload: &[u8]) -> Result<AddedItem>;

    /// Current state of a group, or `None` if it does not exist
    ///
    /// Reflects at least every `add_item` previously completed by the caller.
    fn get_status(&self, key: &GroupKey) -> Result<Option<GroupStatus>>;

    /// Items of a group in ascending sequence order
    ///
    /// Rows that cannot be decoded are skipped with a warning. Returns an
    /// empty vector for a missing or empty group.
    fn fetch_ordered_items(&self, key: &GroupKey) -> Result<Vec<StoredItem>>;

    /// Transition the group to complete
    ///
    /// Returns `true` only for the call that performed the transition;
    /// `false` if the group was already complete or does not exist.
    fn mark_complete(&self, key: &GroupKey) -> Result<bool>;

    /// Most recently created group under an aggregator name
    fn latest_group(&self, aggregator_name: &str) -> Result<Option<GroupStatus>>;

    /// Open groups whose eviction timeout has passed as of `now`
    fn open_groups_due(&self, now: Timestamp) -> Result<Vec<GroupStatus>>;

    /// Remove a group and its items. Returns whether a group was removed.
    ///
    /// Not used by the completion protocol; provided for external cleanup.
    fn delete_group(&self, key: &GroupKey) -> Result<bool>;

    /// Remove complete groups (and their items) completed before `cutoff`
    ///
    /// Returns the number of groups removed.
    fn purge_completed(&self, cutoff: Timestamp) -> Result<usize>;

    /// Current time according to the store's clock
    ///
    /// Strategies evaluate elapsed time against this so that event times and
    /// "now" come from the same source.
    fn now(&self) -> Timestamp;

    /// Operation and race counters
    fn metrics(&self) -> StoreMetricsSnapshot;
}
