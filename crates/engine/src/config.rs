//! Aggregator configuration via `aggregator.toml`
//!
//! One file describes one aggregator deployment: the aggregator name, the
//! SQLite database it shares with its peers, table names, delivery ordering
//! and the optional eviction sweeper. Table names are validated when the file
//! is loaded, so a bad name fails at startup rather than at the first query.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use aggregator_core::{require_identifier, AggregatorError, Clock, Result};
use aggregator_storage::{AggregationStore, SqliteStore, SqliteStoreBuilder, TableConfig};

use crate::delivery::{CompletionConsumer, CompletionDelivery, DeliveryGuarantee};
use crate::sweeper::EvictionSweeper;

/// Config file name placed next to the database
pub const CONFIG_FILE_NAME: &str = "aggregator.toml";

/// Database value that selects a private in-memory database
pub const IN_MEMORY_DATABASE: &str = ":memory:";

/// Eviction sweeper settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweeperConfig {
    /// Run the background sweeper
    #[serde(default)]
    pub enabled: bool,
    /// Time between sweeps in milliseconds (default: 1000)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn default_interval_ms() -> u64 {
    1000
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: default_interval_ms(),
        }
    }
}

impl SweeperConfig {
    /// Sweep interval as a duration
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Aggregator configuration loaded from `aggregator.toml`.
///
/// # Example
///
/// ```toml
/// name = "orders"
/// database = "aggregator.db"
/// delivery = "exactly_once"
///
/// [tables]
/// groups = "aggregator_groups"
/// items = "aggregator_items"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AggregatorConfig {
    /// Aggregator name groups are stored under
    #[serde(default = "default_name")]
    pub name: String,
    /// SQLite database path, or `":memory:"`
    #[serde(default = "default_database")]
    pub database: String,
    /// Delivery ordering: `"exactly_once"` or `"at_least_once"`
    #[serde(default)]
    pub delivery: DeliveryGuarantee,
    /// Wait for a competing writer this long before failing (default: 5000)
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Table names
    #[serde(default)]
    pub tables: TableConfig,
    /// Background eviction sweeper
    #[serde(default)]
    pub sweeper: SweeperConfig,
}

fn default_name() -> String {
    "default".to_string()
}

fn default_database() -> String {
    "aggregator.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            database: default_database(),
            delivery: DeliveryGuarantee::default(),
            busy_timeout_ms: default_busy_timeout_ms(),
            tables: TableConfig::default(),
            sweeper: SweeperConfig::default(),
        }
    }
}

impl AggregatorConfig {
    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Aggregator configuration
#
# Aggregator name that groups are stored under
name = "default"

# SQLite database shared by every process of this aggregator.
# Use ":memory:" for a private, non-durable database.
database = "aggregator.db"

# Delivery ordering: "exactly_once" (default) or "at_least_once"
#   "exactly_once"  = only the caller that completes the group delivers it
#   "at_least_once" = racing evaluators may each deliver the batch
delivery = "exactly_once"

# How long a writer waits for a competing write lock, in milliseconds
busy_timeout_ms = 5000

[tables]
groups = "aggregator_groups"
items = "aggregator_items"

# Complete idle groups whose eviction timeout passed without new items
[sweeper]
enabled = false
interval_ms = 1000
"#
    }

    /// Parse and validate config text
    ///
    /// # Errors
    ///
    /// `Configuration` if the text does not parse or a value is invalid.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: AggregatorConfig = toml::from_str(content).map_err(|e| {
            AggregatorError::configuration(format!("Failed to parse config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AggregatorError::configuration(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content).map_err(|e| {
            AggregatorError::configuration(format!("In '{}': {}", path.display(), e))
        })
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                AggregatorError::configuration(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            AggregatorError::configuration(format!("Failed to serialize config: {}", e))
        })?;
        std::fs::write(path, content).map_err(|e| {
            AggregatorError::configuration(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Check values serde cannot
    pub fn validate(&self) -> Result<()> {
        require_identifier("name", &self.name)?;
        if self.database.trim().is_empty() {
            return Err(AggregatorError::configuration("database must not be empty"));
        }
        if self.sweeper.enabled && self.sweeper.interval_ms == 0 {
            return Err(AggregatorError::configuration(
                "sweeper.interval_ms must be positive when the sweeper is enabled",
            ));
        }
        self.tables.validate()
    }

    /// Busy timeout as a duration
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Whether the database is in-memory
    pub fn is_in_memory(&self) -> bool {
        self.database == IN_MEMORY_DATABASE
    }

    /// Store builder carrying this config's tables and busy timeout
    pub fn store_builder(&self) -> SqliteStoreBuilder {
        SqliteStore::builder()
            .tables(self.tables.clone())
            .busy_timeout(self.busy_timeout())
    }

    /// Open the configured store
    pub fn open_store(&self) -> Result<SqliteStore> {
        self.open(self.store_builder())
    }

    /// Open the configured store with an explicit clock
    pub fn open_store_with_clock(&self, clock: Arc<dyn Clock>) -> Result<SqliteStore> {
        self.open(self.store_builder().clock(clock))
    }

    /// Eviction sweeper for `store`, or `None` when `[sweeper]` is disabled
    ///
    /// The sweeper delivers with this config's delivery ordering and sweeps
    /// every `sweeper.interval_ms`. The caller starts it.
    pub fn sweeper<C: CompletionConsumer>(
        &self,
        store: Arc<dyn AggregationStore>,
        consumer: C,
    ) -> Option<EvictionSweeper<C>> {
        if !self.sweeper.enabled {
            return None;
        }
        let delivery = CompletionDelivery::new(Arc::clone(&store), self.delivery);
        Some(EvictionSweeper::new(
            store,
            delivery,
            consumer,
            self.sweeper.interval(),
        ))
    }

    fn open(&self, builder: SqliteStoreBuilder) -> Result<SqliteStore> {
        self.validate()?;
        if self.is_in_memory() {
            builder.open_in_memory()
        } else {
            builder.open(&self.database)
        }
    }
}
