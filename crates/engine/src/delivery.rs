//! Completion protocol shared by every strategy
//!
//! Once a strategy decides a group is complete, [`CompletionDelivery`] reads
//! the group's items in sequence order, builds the [`AggregationBatch`],
//! transitions the group to complete and hands the batch to the downstream
//! [`CompletionConsumer`].
//!
//! # Ordering
//!
//! Under [`DeliveryGuarantee::ExactlyOnce`] the conditional completion update
//! runs first and decides which evaluator delivers. Only the winner fetches
//! and delivers; everyone else gets [`AggregationOutcome::CompletedElsewhere`].
//! Since the store refuses appends to a complete group, the winner's fetch
//! sees every item counted toward the group and nothing more.
//!
//! Under [`DeliveryGuarantee::AtLeastOnce`] the batch is fetched and built
//! first, the completion update is attempted, and delivery happens whether or
//! not the update won. Two racing evaluators can both deliver.

use std::sync::Arc;

use aggregator_core::{
    AddedItem, AggregationAttributes, AggregationBatch, AggregatorError, BoxError, GroupKey,
    Result,
};
use aggregator_storage::AggregationStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// ============================================================================
// Downstream Interfaces
// ============================================================================

/// Receives completed batches
///
/// Implemented for any `Fn(AggregationBatch) -> Result<T, BoxError>`.
pub trait CompletionConsumer: Send + Sync {
    /// Value handed back to the caller that triggered delivery
    type Output;

    /// Accept a completed batch
    fn consume(&self, batch: AggregationBatch) -> std::result::Result<Self::Output, BoxError>;
}

impl<F, T> CompletionConsumer for F
where
    F: Fn(AggregationBatch) -> std::result::Result<T, BoxError> + Send + Sync,
{
    type Output = T;

    fn consume(&self, batch: AggregationBatch) -> std::result::Result<T, BoxError> {
        self(batch)
    }
}

/// Told about every accepted item before completion is evaluated
///
/// Best effort: a failure is logged and otherwise ignored.
pub trait IncrementalObserver: Send + Sync {
    /// Called once per accepted item
    fn on_item(&self, group: &GroupKey, added: &AddedItem) -> std::result::Result<(), BoxError>;
}

impl<F> IncrementalObserver for F
where
    F: Fn(&GroupKey, &AddedItem) -> std::result::Result<(), BoxError> + Send + Sync,
{
    fn on_item(&self, group: &GroupKey, added: &AddedItem) -> std::result::Result<(), BoxError> {
        self(group, added)
    }
}

/// Run the observer, logging and discarding any failure
pub(crate) fn notify_observer(
    observer: Option<&dyn IncrementalObserver>,
    group: &GroupKey,
    added: &AddedItem,
) {
    if let Some(observer) = observer {
        if let Err(e) = observer.on_item(group, added) {
            warn!(
                target: "aggregator::engine",
                group = %group,
                sequence = added.sequence_number,
                error = %e,
                "Incremental observer failed"
            );
        }
    }
}

// ============================================================================
// Guarantee and Outcome
// ============================================================================

/// How completion and delivery are ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryGuarantee {
    /// Complete first, deliver only if this caller won the transition
    #[default]
    ExactlyOnce,
    /// Fetch, complete, then deliver regardless of who won
    AtLeastOnce,
}

impl DeliveryGuarantee {
    /// Configuration spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryGuarantee::ExactlyOnce => "exactly_once",
            DeliveryGuarantee::AtLeastOnce => "at_least_once",
        }
    }
}

/// Result of offering one item to a strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregationOutcome<T> {
    /// Item accepted, group still open
    Pending {
        /// Group the item joined
        group: GroupKey,
        /// Items in the group after this one
        item_count: u64,
    },
    /// This call delivered the group's batch
    Completed {
        /// Metadata of the delivered batch
        attributes: AggregationAttributes,
        /// What the consumer returned
        output: T,
    },
    /// Item accepted, but another evaluator completed the group
    CompletedElsewhere {
        /// Group that completed
        group: GroupKey,
    },
}

impl<T> AggregationOutcome<T> {
    /// Whether this call delivered a batch
    pub fn is_completed(&self) -> bool {
        matches!(self, AggregationOutcome::Completed { .. })
    }

    /// Whether the group is still open
    pub fn is_pending(&self) -> bool {
        matches!(self, AggregationOutcome::Pending { .. })
    }

    /// Attributes of the delivered batch, if any
    pub fn attributes(&self) -> Option<&AggregationAttributes> {
        match self {
            AggregationOutcome::Completed { attributes, .. } => Some(attributes),
            _ => None,
        }
    }

    /// Consumer output, if this call delivered
    pub fn into_output(self) -> Option<T> {
        match self {
            AggregationOutcome::Completed { output, .. } => Some(output),
            _ => None,
        }
    }
}

// ============================================================================
// CompletionDelivery
// ============================================================================

/// Fetch, finalize and deliver a completed group
#[derive(Clone)]
pub struct CompletionDelivery {
    store: Arc<dyn AggregationStore>,
    guarantee: DeliveryGuarantee,
}

impl CompletionDelivery {
    /// Create a delivery handle over `store`
    pub fn new(store: Arc<dyn AggregationStore>, guarantee: DeliveryGuarantee) -> Self {
        Self { store, guarantee }
    }

    /// Configured guarantee
    pub fn guarantee(&self) -> DeliveryGuarantee {
        self.guarantee
    }

    /// Run the completion protocol for `group`
    ///
    /// # Errors
    ///
    /// - `Storage` if the items cannot be read, or (exactly-once only) if the
    ///   completion update fails
    /// - `Delivery` if the consumer fails
    pub fn complete<C>(&self, group: &GroupKey, consumer: &C) -> Result<AggregationOutcome<C::Output>>
    where
        C: CompletionConsumer + ?Sized,
    {
        match self.guarantee {
            DeliveryGuarantee::ExactlyOnce => self.complete_exactly_once(group, consumer),
            DeliveryGuarantee::AtLeastOnce => self.complete_at_least_once(group, consumer),
        }
    }

    fn complete_exactly_once<C>(&self, group: &GroupKey, consumer: &C) -> Result<AggregationOutcome<C::Output>>
    where
        C: CompletionConsumer + ?Sized,
    {
        if !self.store.mark_complete(group)? {
            debug!(target: "aggregator::engine", group = %group, "Completion won elsewhere");
            return Ok(AggregationOutcome::CompletedElsewhere {
                group: group.clone(),
            });
        }

        let batch = self.build_batch(group)?;
        self.deliver(batch, consumer)
    }

    fn complete_at_least_once<C>(&self, group: &GroupKey, consumer: &C) -> Result<AggregationOutcome<C::Output>>
    where
        C: CompletionConsumer + ?Sized,
    {
        let batch = self.build_batch(group)?;

        match self.store.mark_complete(group) {
            Ok(true) => {}
            Ok(false) => debug!(
                target: "aggregator::engine",
                group = %group,
                "Group was already complete, delivering anyway"
            ),
            Err(e) => warn!(
                target: "aggregator::engine",
                group = %group,
                error = %e,
                "Failed to mark group complete, delivering anyway"
            ),
        }

        self.deliver(batch, consumer)
    }

    fn build_batch(&self, group: &GroupKey) -> Result<AggregationBatch> {
        let items = self.store.fetch_ordered_items(group)?;
        if items.is_empty() {
            warn!(target: "aggregator::engine", group = %group, "Completing group with no items");
        }

        let attributes = AggregationAttributes::for_items(group, &items, self.store.now());
        Ok(AggregationBatch {
            group: group.clone(),
            attributes,
            items,
        })
    }

    fn deliver<C>(&self, batch: AggregationBatch, consumer: &C) -> Result<AggregationOutcome<C::Output>>
    where
        C: CompletionConsumer + ?Sized,
    {
        let group = batch.group.clone();
        let attributes = batch.attributes.clone();

        let output = consumer
            .consume(batch)
            .map_err(|source| AggregatorError::delivery(group.clone(), source))?;

        info!(
            target: "aggregator::engine",
            group = %group,
            items = attributes.item_count,
            guarantee = self.guarantee.as_str(),
            "Aggregation delivered"
        );
        Ok(AggregationOutcome::Completed { attributes, output })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aggregator_core::GroupSettings;
    use aggregator_storage::SqliteStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn store_with(key: &GroupKey, payloads: &[&[u8]]) -> Arc<dyn AggregationStore> {
        let store = SqliteStore::open_in_memory().unwrap();
        for payload in payloads {
            store
                .add_item(key, GroupSettings::new(10, Duration::ZERO), payload)
                .unwrap();
        }
        Arc::new(store)
    }

    fn collect(batch: AggregationBatch) -> std::result::Result<Vec<Vec<u8>>, BoxError> {
        Ok(batch.into_payloads())
    }

    #[test]
    fn test_exactly_once_delivers_once() {
        let key = GroupKey::new("orders", "o-1");
        let store = store_with(&key, &[b"A", b"B"]);
        let delivery = CompletionDelivery::new(store.clone(), DeliveryGuarantee::ExactlyOnce);

        let first = delivery.complete(&key, &collect).unwrap();
        let attributes = first.attributes().unwrap().clone();
        assert_eq!(attributes.item_count, 2);
        assert!(attributes.is_aggregation_complete);
        assert_eq!(attributes.aggregation_id, "o-1");
        assert_eq!(first.into_output().unwrap(), vec![b"A".to_vec(), b"B".to_vec()]);

        let second = delivery.complete(&key, &collect).unwrap();
        assert_eq!(second, AggregationOutcome::CompletedElsewhere { group: key.clone() });
        assert!(store.get_status(&key).unwrap().unwrap().is_complete);
    }

    #[test]
    fn test_at_least_once_delivers_every_time() {
        let key = GroupKey::new("orders", "o-1");
        let store = store_with(&key, &[b"A"]);
        let delivery = CompletionDelivery::new(store.clone(), DeliveryGuarantee::AtLeastOnce);

        assert!(delivery.complete(&key, &collect).unwrap().is_completed());
        assert!(delivery.complete(&key, &collect).unwrap().is_completed());
        assert_eq!(store.metrics().completions, 1);
    }

    #[test]
    fn test_consumer_failure_surfaces_as_delivery() {
        crate::init_test_tracing();
        let key = GroupKey::new("orders", "o-1");
        let store = store_with(&key, &[b"A"]);
        let delivery = CompletionDelivery::new(store.clone(), DeliveryGuarantee::ExactlyOnce);

        let failing = |_batch: AggregationBatch| -> std::result::Result<(), BoxError> {
            Err("downstream unavailable".into())
        };
        let err = delivery.complete(&key, &failing).unwrap_err();
        match err {
            AggregatorError::Delivery { group, source } => {
                assert_eq!(group, key);
                assert_eq!(source.to_string(), "downstream unavailable");
            }
            other => panic!("expected delivery error, got {other:?}"),
        }
        // Items stay stored
        assert_eq!(store.fetch_ordered_items(&key).unwrap().len(), 1);
    }

    #[test]
    fn test_empty_group_still_completes() {
        let key = GroupKey::new("orders", "missing");
        let store: Arc<dyn AggregationStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let delivery = CompletionDelivery::new(store, DeliveryGuarantee::AtLeastOnce);

        let outcome = delivery.complete(&key, &collect).unwrap();
        assert_eq!(outcome.attributes().unwrap().item_count, 0);
        assert_eq!(outcome.into_output().unwrap(), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn test_struct_consumer() {
        struct Counting(AtomicUsize);

        impl CompletionConsumer for Counting {
            type Output = usize;

            fn consume(&self, batch: AggregationBatch) -> std::result::Result<usize, BoxError> {
                self.0.fetch_add(batch.len(), Ordering::SeqCst);
                Ok(batch.len())
            }
        }

        let key = GroupKey::new("orders", "o-1");
        let store = store_with(&key, &[b"A", b"B", b"C"]);
        let delivery = CompletionDelivery::new(store, DeliveryGuarantee::default());
        let consumer = Counting(AtomicUsize::new(0));

        let outcome = delivery.complete(&key, &consumer).unwrap();
        assert_eq!(outcome.into_output(), Some(3));
        assert_eq!(consumer.0.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_observer_failure_is_swallowed() {
        let key = GroupKey::new("orders", "o-1");
        let added = AddedItem {
            reference_id: 1,
            sequence_number: 1,
            item_count: 1,
            created_group: true,
        };
        let calls = AtomicUsize::new(0);
        let observer = |_: &GroupKey, _: &AddedItem| -> std::result::Result<(), BoxError> {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("observer down".into())
        };

        notify_observer(Some(&observer), &key, &added);
        notify_observer(None, &key, &added);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_guarantee_serde() {
        let parsed: DeliveryGuarantee = serde_json::from_str("\"at_least_once\"").unwrap();
        assert_eq!(parsed, DeliveryGuarantee::AtLeastOnce);
        assert_eq!(DeliveryGuarantee::default().as_str(), "exactly_once");
    }
}
