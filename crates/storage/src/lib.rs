//! Storage layer for the aggregator
//!
//! This crate implements durable group and item storage:
//! - AggregationStore: the transactional contract the strategies rely on
//! - SqliteStore: rusqlite-backed implementation (WAL, immediate transactions)
//! - TableConfig: validated, configurable table names
//! - StoreMetrics: relaxed counters for appends, completions and races
//!
//! # Concurrency
//!
//! Correctness does not depend on any in-process lock. Group creation is
//! arbitrated by a UNIQUE constraint, sequence assignment by an atomic
//! increment inside a write transaction, and completion by a conditional
//! UPDATE whose affected-row count names the winner.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod metrics;
pub mod schema;
pub mod sqlite;
pub mod traits;

pub use metrics::{StoreMetrics, StoreMetricsSnapshot};
pub use schema::{TableConfig, DEFAULT_GROUPS_TABLE, DEFAULT_ITEMS_TABLE};
pub use sqlite::{is_unique_violation, SqliteStore, SqliteStoreBuilder, DEFAULT_BUSY_TIMEOUT};
pub use traits::AggregationStore;
