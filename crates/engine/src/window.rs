//! Time-window aggregation
//!
//! A [`TimeAggregator`] keeps one open window per aggregator name. Windows are
//! numbered: the group id of generation `n` is `"{aggregator_name}_window_{n}"`.
//! The current window is the most recently created group under the name. Once
//! it completes, the next item opens generation `n + 1`, so a completed window
//! is never reused.
//!
//! A window completes when it holds `max_size` items (if `max_size > 0`) or
//! when an item arrives `period` or later after the window's first item.

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

/// Attempts at appending before a window that keeps closing underneath us is
/// reported as `GroupClosed`
pub const MAX_WINDOW_ATTEMPTS: usize = 3;

/// Separator between the aggregator name and the generation number
const WINDOW_MARKER: &str = "_window_";

/// Group id of window generation `generation`
pub fn window_id(aggregator_name: &str, generation: u64) -> String {
    format!("{}{}{}", aggregator_name, WINDOW_MARKER, generation)
}

/// Generation number encoded in `group_id`, if it is a window of `aggregator_name`
pub fn window_generation(aggregator_name: &str, group_id: &str) -> Option<u64> {
    group_id
        .strip_prefix(aggregator_name)?
        .strip_prefix(WINDOW_MARKER)?
        .parse()
        .ok()
}

/// One item offered to a [`TimeAggregator`]
#[derive(Debug, Clone, Copy)]
pub struct WindowRequest<'a> {
    /// Stream the item belongs to
    pub aggregator_name: &'a str,
    /// Window length amount, must be positive
    pub period: u64,
    /// Unit of `period`
    pub period_unit: TimeUnit,
    /// Item count at which a window completes early; zero means unbounded
    pub max_size: u32,
    /// Item payload
    pub payload: &'a [u8],
}

impl<'a> WindowRequest<'a> {
    /// An unbounded window of `period` `unit`s
    pub fn new(aggregator_name: &'a str, period: u64, period_unit: TimeUnit, payload: &'a [u8]) -> Self {
        Self {
            aggregator_name,
            period,
            period_unit,
            max_size: 0,
            payload,
        }
    }

    /// Also complete once the window holds `max_size` items
    pub fn max_size(mut self, max_size: u32) -> Self {
        self.max_size = max_size;
        self
    }

    fn validate(&self) -> Result<()> {
        require_identifier("aggregatorName", self.aggregator_name)?;
        require_positive("period", self.period)?;
        require_payload(self.payload)
    }
}

/// Aggregates items into consecutive time windows
pub struct TimeAggregator<C> {
    store: Arc<dyn AggregationStore>,
    delivery: CompletionDelivery,
    consumer: C,
    observer: Option<Arc<dyn IncrementalObserver>>,
}

impl<C: CompletionConsumer> TimeAggregator<C> {
    /// Create an aggregator delivering completed windows to `consumer`
    pub fn new(store: Arc<dyn AggregationStore>, consumer: C) -> Self {
        Self {
            delivery: CompletionDelivery::new(Arc::clone(&store), DeliveryGuarantee::default()),
            store,
            consumer,
            observer: None,
        }
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

    /// Window the next item for `aggregator_name` would join
    ///
    /// # Errors
    ///
    /// `Configuration` if the latest group under the name is not a window,
    /// which happens when a [`GroupAggregator`](crate::GroupAggregator) shares
    /// the name.
    pub fn current_window(&self, aggregator_name: &str) -> Result<GroupKey> {
        let generation = match self.store.latest_group(aggregator_name)? {
            None => 1,
            Some(latest) => {
                let generation = window_generation(aggregator_name, &latest.key.group_id)
                    .ok_or_else(|| {
                        AggregatorError::configuration(format!(
                            "aggregator '{}' has non-window group '{}'",
                            aggregator_name, latest.key.group_id
                        ))
                    })?;
                if latest.is_complete {
                    generation.saturating_add(1)
                } else {
                    generation
                }
            }
        };
        Ok(GroupKey::new(aggregator_name, window_id(aggregator_name, generation)))
    }

    /// Offer one item
    ///
    /// # Errors
    ///
    /// - `Validation` for a blank aggregator name, zero period or empty
    ///   payload; nothing is written
    /// - `GroupClosed` if windows kept completing between lookup and append
    ///   for [`MAX_WINDOW_ATTEMPTS`] attempts
    /// - `Storage` on store failure
    /// - `Delivery` if this call completed the window and the consumer failed
    pub fn add(&self, request: WindowRequest<'_>) -> Result<AggregationOutcome<C::Output>> {
        request.validate()?;

        let period = request.period_unit.to_duration(request.period);
        let settings = GroupSettings::new(request.max_size, period);

        let mut attempt = 0;
        let (key, added) = loop {
            attempt += 1;
            let key = self.current_window(request.aggregator_name)?;
            match self.store.add_item(&key, settings, request.payload) {
                Ok(added) => break (key, added),
                Err(AggregatorError::GroupClosed { group }) if attempt < MAX_WINDOW_ATTEMPTS => {
                    debug!(
                        target: "aggregator::engine",
                        group = %group,
                        attempt,
                        "Window closed before append, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        };
        notify_observer(self.observer.as_deref(), &key, &added);

        let status = self.store.get_status(&key)?.ok_or_else(|| {
            AggregatorError::storage("get_status", format!("window {} missing after append", key))
        })?;

        let now = self.store.now();
        let full = request.max_size > 0 && status.item_count >= u64::from(request.max_size);
        let expired = status.age(now) >= period;

        if !(full || expired) {
            debug!(
                target: "aggregator::engine",
                group = %key,
                items = status.item_count,
                "Window pending"
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
            expired,
            "Window complete"
        );
        self.delivery.complete(&key, &self.consumer)
    }
}
