//! Aggregation engine
//!
//! This crate turns the storage contract into complete aggregation strategies:
//! - GroupAggregator: size and eviction based completion
//! - TimeAggregator: consecutive time windows with size cap
//! - CompletionDelivery: the shared fetch, complete, deliver protocol
//! - EvictionSweeper: background completion of idle overdue groups
//! - AggregatorConfig: `aggregator.toml` loading and store opening
//!
//! Strategies keep no state of their own. Everything they decide comes from
//! the store, so they can run in any number of threads or processes over one
//! shared database.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod delivery;
pub mod group;
pub mod sweeper;
pub mod window;

pub use config::{AggregatorConfig, SweeperConfig, CONFIG_FILE_NAME, IN_MEMORY_DATABASE};
pub use delivery::{
    AggregationOutcome, CompletionConsumer, CompletionDelivery, DeliveryGuarantee,
    IncrementalObserver,
};
pub use group::{GroupAggregator, GroupRequest};
pub use sweeper::{EvictionSweeper, SweepReport, MIN_CHECK_INTERVAL};
pub use window::{window_generation, window_id, TimeAggregator, WindowRequest, MAX_WINDOW_ATTEMPTS};

/// Route engine logs to the test harness output
#[cfg(test)]
pub(crate) fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
