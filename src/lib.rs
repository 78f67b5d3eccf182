//! Durable message aggregator
//!
//! Collects individual messages under a logical group and, once a completion
//! condition holds, delivers every collected message as one ordered batch and
//! marks the group done. Completion happens exactly once per group even with
//! many concurrent producers across threads and processes.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use strata_aggregator::{
//!     AggregationBatch, AggregationStore, BoxError, GroupAggregator, GroupRequest, SqliteStore,
//! };
//!
//! let store: Arc<dyn AggregationStore> = Arc::new(SqliteStore::open("orders.db")?);
//! let consumer = |batch: AggregationBatch| -> Result<(), BoxError> {
//!     println!("{} items", batch.len());
//!     Ok(())
//! };
//! let orders = GroupAggregator::new(store, "orders", consumer)?;
//!
//! orders.add(GroupRequest::new("order-17", 3, b"line A"))?;
//! ```
//!
//! # Architecture
//!
//! - `aggregator-core`: domain types, time handling and the error taxonomy
//! - `aggregator-storage`: the [`AggregationStore`] contract and [`SqliteStore`]
//! - `aggregator-engine`: strategies, the completion protocol, the sweeper and
//!   configuration

pub use aggregator_core::{
    system_clock, AddedItem, AggregationAttributes, AggregationBatch, AggregatorError, BoxError,
    Clock, GroupKey, GroupSettings, GroupStatus, ManualClock, RaceWarning, Result, StoredItem,
    SystemClock, TableName, TableNameError, TimeUnit, Timestamp,
};
pub use aggregator_engine::{
    AggregationOutcome, AggregatorConfig, CompletionConsumer, CompletionDelivery,
    DeliveryGuarantee, EvictionSweeper, GroupAggregator, GroupRequest, IncrementalObserver,
    SweepReport, SweeperConfig, TimeAggregator, WindowRequest,
};
pub use aggregator_storage::{
    AggregationStore, SqliteStore, SqliteStoreBuilder, StoreMetricsSnapshot, TableConfig,
};
