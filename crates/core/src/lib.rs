//! Core types for the aggregator
//!
//! This crate defines the foundational types shared by the storage and engine
//! layers:
//! - GroupKey / GroupSettings / GroupStatus: the group entity
//! - StoredItem: an item read back in sequence order
//! - AggregationAttributes / AggregationBatch: what a consumer receives
//! - Timestamp, TimeUnit, Clock: time handling
//! - TableName: validated storage object names
//! - AggregatorError / RaceWarning: error taxonomy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod error;
pub mod table_name;
pub mod time_unit;
pub mod timestamp;
pub mod types;

pub use clock::{system_clock, Clock, ManualClock, SystemClock};
pub use error::{AggregatorError, BoxError, RaceWarning, Result};
pub use table_name::{TableName, TableNameError, MAX_TABLE_NAME_LENGTH};
pub use time_unit::TimeUnit;
pub use timestamp::Timestamp;
pub use types::{
    require_identifier, require_payload, require_positive, AddedItem, AggregationAttributes,
    AggregationBatch, GroupKey, GroupSettings, GroupStatus, StoredItem,
};
