//! Domain types for groups, items and completed batches
//!
//! - [`GroupKey`]: `(aggregator_name, group_id)`, unique per group
//! - [`GroupSettings`]: thresholds recorded when a group is created
//! - [`AddedItem`]: result of appending an item
//! - [`GroupStatus`]: snapshot of a group row
//! - [`StoredItem`]: an item as read back, in sequence order
//! - [`AggregationAttributes`] / [`AggregationBatch`]: what a consumer receives

use crate::error::{AggregatorError, Result};
use crate::timestamp::Timestamp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identity of a group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    /// Logical aggregator / stream identifier
    pub aggregator_name: String,
    /// Group identifier, unique within the aggregator
    pub group_id: String,
}

impl GroupKey {
    /// Create a key without validation
    pub fn new(aggregator_name: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            aggregator_name: aggregator_name.into(),
            group_id: group_id.into(),
        }
    }

    /// Reject blank components
    pub fn validate(&self) -> Result<()> {
        require_identifier("aggregator_name", &self.aggregator_name)?;
        require_identifier("group_id", &self.group_id)
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.aggregator_name, self.group_id)
    }
}

/// Completion thresholds stored on the group row when it is created
///
/// Later calls for an existing group do not change the stored settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GroupSettings {
    /// Item count that completes the group; 0 means no size limit
    pub target_size: u32,
    /// Eviction timeout or window period measured from the first item; zero disables it
    pub eviction: Duration,
}

impl GroupSettings {
    /// Settings with a size threshold and optional eviction
    pub fn new(target_size: u32, eviction: Duration) -> Self {
        Self {
            target_size,
            eviction,
        }
    }

    /// Whether an eviction timeout is configured
    pub fn has_eviction(&self) -> bool {
        !self.eviction.is_zero()
    }
}

/// Outcome of appending one item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddedItem {
    /// Row identity of the owning group
    pub reference_id: i64,
    /// Sequence number assigned to the new item (1-based)
    pub sequence_number: u64,
    /// Items in the group after this append
    pub item_count: u64,
    /// Whether this call created the group row
    pub created_group: bool,
}

/// Snapshot of a group row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStatus {
    /// Group identity
    pub key: GroupKey,
    /// Row identity
    pub reference_id: i64,
    /// Number of items appended
    pub item_count: u64,
    /// Whether the group has completed
    pub is_complete: bool,
    /// Thresholds recorded at creation
    pub settings: GroupSettings,
    /// Time of the first item
    pub first_event_time: Timestamp,
    /// Time of the most recent item
    pub last_event_time: Timestamp,
    /// Row creation time
    pub created_at: Timestamp,
    /// Time of the winning completion, if any
    pub completed_at: Option<Timestamp>,
}

impl GroupStatus {
    /// Time elapsed since the first item, as of `now`
    pub fn age(&self, now: Timestamp) -> Duration {
        now.saturating_duration_since(self.first_event_time)
    }

    /// Whether the stored eviction timeout has passed as of `now`
    pub fn is_overdue(&self, now: Timestamp) -> bool {
        self.settings.has_eviction() && self.age(now) >= self.settings.eviction
    }
}

/// An item as read back from the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredItem {
    /// Position within the group, strictly increasing
    pub sequence_number: u64,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
    /// Time the item was accepted
    pub event_time: Timestamp,
}

/// Metadata delivered alongside a completed batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationAttributes {
    /// Identifier of the completed group; for time windows, the window id
    pub aggregation_id: String,
    /// Aggregator the group belongs to
    pub aggregator_name: String,
    /// Arrival time of the earliest item
    pub first_item_arrival_time: Timestamp,
    /// Arrival time of the latest item
    pub last_item_arrival_time: Timestamp,
    /// Always true for a delivered batch
    pub is_aggregation_complete: bool,
    /// Number of payloads delivered
    pub item_count: usize,
}

impl AggregationAttributes {
    /// Build attributes for the items of `group`; an empty batch uses
    /// `fallback` for both times
    pub fn for_items(group: &GroupKey, items: &[StoredItem], fallback: Timestamp) -> Self {
        let first = items.iter().map(|i| i.event_time).min().unwrap_or(fallback);
        let last = items.iter().map(|i| i.event_time).max().unwrap_or(fallback);
        Self {
            aggregation_id: group.group_id.clone(),
            aggregator_name: group.aggregator_name.clone(),
            first_item_arrival_time: first,
            last_item_arrival_time: last,
            is_aggregation_complete: true,
            item_count: items.len(),
        }
    }

    /// First arrival as calendar time
    pub fn first_item_arrival(&self) -> DateTime<Utc> {
        self.first_item_arrival_time.to_datetime()
    }

    /// Last arrival as calendar time
    pub fn last_item_arrival(&self) -> DateTime<Utc> {
        self.last_item_arrival_time.to_datetime()
    }
}

/// A completed group handed to the downstream consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationBatch {
    /// Group that completed
    pub group: GroupKey,
    /// Batch metadata
    pub attributes: AggregationAttributes,
    /// Items in sequence order
    pub items: Vec<StoredItem>,
}

impl AggregationBatch {
    /// Payloads in sequence order
    pub fn payloads(&self) -> impl Iterator<Item = &[u8]> {
        self.items.iter().map(|i| i.payload.as_slice())
    }

    /// Consume the batch, keeping only the payloads
    pub fn into_payloads(self) -> Vec<Vec<u8>> {
        self.items.into_iter().map(|i| i.payload).collect()
    }

    /// Number of items in the batch
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the batch has no items
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// ============================================================================
// Input validation
// ============================================================================

/// Reject empty or whitespace-only identifiers
pub fn require_identifier(field: &'static str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(AggregatorError::validation(field, "must not be null or empty"));
    }
    Ok(())
}

/// Reject empty payloads
pub fn require_payload(payload: &[u8]) -> Result<()> {
    if payload.is_empty() {
        return Err(AggregatorError::validation("payload", "must not be empty"));
    }
    Ok(())
}

/// Reject zero where a positive value is required
pub fn require_positive(field: &'static str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(AggregatorError::validation(
            field,
            format!("must be positive, got [{}]", value),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(seq: u64, at: u64, payload: &[u8]) -> StoredItem {
        StoredItem {
            sequence_number: seq,
            payload: payload.to_vec(),
            event_time: Timestamp::from_millis(at),
        }
    }

    #[test]
    fn test_group_key_validation() {
        assert!(GroupKey::new("orders", "o-1").validate().is_ok());

        let err = GroupKey::new("orders", "   ").validate().unwrap_err();
        assert!(matches!(
            err,
            AggregatorError::Validation {
                field: "group_id",
                ..
            }
        ));

        let err = GroupKey::new("", "o-1").validate().unwrap_err();
        assert!(matches!(
            err,
            AggregatorError::Validation {
                field: "aggregator_name",
                ..
            }
        ));
    }

    #[test]
    fn test_require_payload_and_positive() {
        assert!(require_payload(b"x").is_ok());
        assert!(require_payload(b"").unwrap_err().is_validation());
        assert!(require_positive("group_size", 1).is_ok());
        let err = require_positive("group_size", 0).unwrap_err();
        assert!(err.to_string().contains("[0]"));
    }

    fn order() -> GroupKey {
        GroupKey::new("orders", "o-1")
    }

    #[test]
    fn test_attributes_from_items() {
        let items = vec![item(1, 100, b"a"), item(2, 250, b"b"), item(3, 180, b"c")];
        let attrs = AggregationAttributes::for_items(&order(), &items, Timestamp::from_millis(999));
        assert_eq!(attrs.item_count, 3);
        assert_eq!(attrs.first_item_arrival_time, Timestamp::from_millis(100));
        assert_eq!(attrs.last_item_arrival_time, Timestamp::from_millis(250));
        assert!(attrs.is_aggregation_complete);
    }

    #[test]
    fn test_attributes_empty_batch_uses_fallback() {
        let attrs = AggregationAttributes::for_items(&order(), &[], Timestamp::from_millis(42));
        assert_eq!(attrs.item_count, 0);
        assert_eq!(attrs.first_item_arrival_time, Timestamp::from_millis(42));
        assert_eq!(attrs.last_item_arrival_time, Timestamp::from_millis(42));
    }

    #[test]
    fn test_attributes_serialize_camel_case() {
        let attrs = AggregationAttributes::for_items(&order(), &[item(1, 5, b"a")], Timestamp::EPOCH);
        let json = serde_json::to_value(&attrs).unwrap();
        assert_eq!(json["aggregationId"], "o-1");
        assert_eq!(json["aggregatorName"], "orders");
        assert_eq!(json["itemCount"], 1);
        assert_eq!(json["isAggregationComplete"], true);
    }

    #[test]
    fn test_status_overdue() {
        let status = GroupStatus {
            key: GroupKey::new("orders", "o-1"),
            reference_id: 1,
            item_count: 2,
            is_complete: false,
            settings: GroupSettings::new(5, Duration::from_secs(30)),
            first_event_time: Timestamp::from_secs(100),
            last_event_time: Timestamp::from_secs(110),
            created_at: Timestamp::from_secs(100),
            completed_at: None,
        };
        assert!(!status.is_overdue(Timestamp::from_secs(129)));
        assert!(status.is_overdue(Timestamp::from_secs(130)));

        let no_eviction = GroupStatus {
            settings: GroupSettings::new(5, Duration::ZERO),
            ..status
        };
        assert!(!no_eviction.is_overdue(Timestamp::from_secs(10_000)));
    }

    #[test]
    fn test_batch_payloads_in_order() {
        let batch = AggregationBatch {
            group: GroupKey::new("orders", "o-1"),
            attributes: AggregationAttributes::for_items(&order(), &[], Timestamp::EPOCH),
            items: vec![item(1, 1, b"A"), item(2, 2, b"B")],
        };
        let payloads: Vec<&[u8]> = batch.payloads().collect();
        assert_eq!(payloads, vec![b"A".as_slice(), b"B".as_slice()]);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.into_payloads(), vec![b"A".to_vec(), b"B".to_vec()]);
    }
}
