//! Size and eviction based aggregation
//!
//! A [`GroupAggregator`] collects items under caller-chosen group ids. A group
//! completes when it reaches its target size, or when an item arrives after
//! the group's eviction timeout has elapsed since its first item.

use std::sync::Arc;

use aggregator_core::{
    require_identifier, require_payload, require_positive, AggregatorError, GroupKey,
    GroupSettings, Result, TimeUnit,
};
use aggregator_storage::AggregationStore;
use tracing::debug;

use crate::delivery::{
    notify_observer, AggregationOutcome, CompletionConsumer, CompletionDelivery,
    DeliveryGuarantee, IncrementalObserver,
};

/// One item offered to a [`GroupAggregator`]
#[derive(Debug, Clone, Copy)]
pub struct GroupRequest<'a> {
    /// Group to add to
    pub group_id: &'a str,
    /// Item count at which the group completes
    pub group_size: u32,
    /// Eviction timeout amount; zero disables eviction
    pub eviction_time: u64,
    /// Unit of `eviction_time`
    pub eviction_unit: TimeUnit,
    /// Item payload
    pub payload: &'a [u8],
}

impl<'a> GroupRequest<'a> {
    /// A request with eviction disabled
    pub fn new(group_id: &'a str, group_size: u32, payload: &'a [u8]) -> Self {
        Self {
            group_id,
            group_size,
            eviction_time: 0,
            eviction_unit: TimeUnit::default(),
            payload,
        }
    }

    /// Complete the group once `amount` of `unit` has passed since its first item
    pub fn evict_after(mut self, amount: u64, unit: TimeUnit) -> Self {
        self.eviction_time = amount;
        self.eviction_unit = unit;
        self
    }

    fn validate(&self) -> Result<()> {
        require_identifier("groupId", self.group_id)?;
        require_positive("groupSize", u64::from(self.group_size))?;
        require_payload(self.payload)
    }
}

/// Aggregates items into explicitly named groups
///
/// Stateless apart from its configuration: every decision is made from what
/// the store returns, so any number of aggregators (in any number of
/// processes) may share one store.
pub struct GroupAggregator<C> {
    aggregator_name: String,
    store: Arc<dyn AggregationStore>,
    delivery: CompletionDelivery,
    consumer: C,
    observer: Option<Arc<dyn IncrementalObserver>>,
}

impl<C: CompletionConsumer> GroupAggregator<C> {
    /// Create an aggregator delivering completed groups to `consumer`
    ///
    /// # Errors
    ///
    /// `Validation` if `aggregator_name` is blank.
    pub fn new(
        store: Arc<dyn AggregationStore>,
        aggregator_name: impl Into<String>,
        consumer: C,
    ) -> Result<Self> {
        let aggregator_name = aggregator_name.into();
        require_identifier("aggregatorName", &aggregator_name)?;
        Ok(Self {
            aggregator_name,
            delivery: CompletionDelivery::new(Arc::clone(&store), DeliveryGuarantee::default()),
            store,
            consumer,
            observer: None,
        })
    }

    /// Choose how completion and delivery are ordered
    pub fn with_guarantee(mut self, guarantee: DeliveryGuarantee) -> Self {
        self.delivery = CompletionDelivery::new(Arc::clone(&self.store), guarantee);
        self
    }

    /// Observe every accepted item
    pub fn with_observer(mut self, observer: Arc<dyn IncrementalObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Aggregator name all groups are stored under
    pub fn aggregator_name(&self) -> &str {
        &self.aggregator_name
    }

    /// Offer one item
    ///
    /// # Errors
    ///
    /// - `Validation` for a blank group id, zero group size or empty payload;
    ///   nothing is written
    /// - `GroupClosed` if the group already completed
    /// - `Storage` on store failure
    /// - `Delivery` if this call completed the group and the consumer failed
    pub fn add(&self, request: GroupRequest<'_>) -> Result<AggregationOutcome<C::Output>> {
        request.validate()?;

        let key = GroupKey::new(self.aggregator_name.as_str(), request.group_id);
        let eviction = request.eviction_unit.to_duration(request.eviction_time);
        let settings = GroupSettings::new(request.group_size, eviction);

        let added = self.store.add_item(&key, settings, request.payload)?;
        notify_observer(self.observer.as_deref(), &key, &added);

        let status = self.store.get_status(&key)?.ok_or_else(|| {
            AggregatorError::storage("get_status", format!("group {} missing after append", key))
        })?;

        let now = self.store.now();
        let full = status.item_count >= u64::from(request.group_size);
        let evicted = settings.has_eviction() && status.age(now) >= eviction;

        if !(full || evicted) {
            debug!(
                target: "aggregator::engine",
                group = %key,
                items = status.item_count,
                group_size = request.group_size,
                "Group pending"
            );
            return Ok(AggregationOutcome::Pending {
                group: key,
                item_count: status.item_count,
            });
        }

        debug!(
            target: "aggregator::engine",
            group = %key,
            items = status.item_count,
            full,
            evicted,
            "Group complete"
        );
        self.delivery.complete(&key, &self.consumer)
    }
}
