//! Table layout and SQL text
//!
//! Table names are configurable and validated as [`TableName`]s before they
//! are interpolated. All values travel as bound parameters.
//!
//! # Tables
//!
//! - **groups**: one row per `(aggregator_name, group_id)`, enforced by a
//!   UNIQUE constraint. `item_count` doubles as the last assigned sequence
//!   number. `is_complete` only ever moves from 0 to 1.
//! - **items**: one immutable row per accepted payload, UNIQUE on
//!   `(reference_id, sequence_number)`, with a CRC32 of the payload.

use aggregator_core::{AggregatorError, Result, TableName};
use serde::{Deserialize, Serialize};

/// Default name of the groups table
pub const DEFAULT_GROUPS_TABLE: &str = "aggregator_groups";
/// Default name of the items table
pub const DEFAULT_ITEMS_TABLE: &str = "aggregator_items";

/// Names of the storage objects used by the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    /// Groups table
    #[serde(default = "default_groups")]
    pub groups: TableName,
    /// Items table
    #[serde(default = "default_items")]
    pub items: TableName,
}

fn default_groups() -> TableName {
    TableName::new_unchecked(DEFAULT_GROUPS_TABLE)
}

fn default_items() -> TableName {
    TableName::new_unchecked(DEFAULT_ITEMS_TABLE)
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            groups: default_groups(),
            items: default_items(),
        }
    }
}

impl TableConfig {
    /// Validate and build a table configuration
    ///
    /// # Errors
    ///
    /// `Configuration` if either name is invalid or both name the same table.
    pub fn new(groups: &str, items: &str) -> Result<Self> {
        let config = Self {
            groups: TableName::parse(groups)?,
            items: TableName::parse(items)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.groups == self.items {
            return Err(AggregatorError::configuration(format!(
                "groups and items tables must differ, both are '{}'",
                self.groups
            )));
        }
        Ok(())
    }
}

/// Column list shared by every group query
const GROUP_COLUMNS: &str = "id, aggregator_name, group_id, target_size, eviction_ms, item_count, \
     is_complete, first_event_time, last_event_time, created_at, completed_at";

/// SQL text rendered once per store for the configured tables
#[derive(Debug, Clone)]
pub(crate) struct Statements {
    pub create_tables: String,
    pub select_group_by_key: String,
    pub insert_group: String,
    pub bump_group: String,
    pub insert_item: String,
    pub select_items: String,
    pub mark_complete: String,
    pub select_latest_group: String,
    pub select_due_groups: String,
    pub delete_items_of_group: String,
    pub delete_group: String,
    pub delete_items_of_completed: String,
    pub delete_completed_groups: String,
}

impl Statements {
    pub fn render(tables: &TableConfig) -> Self {
        let groups = tables.groups.as_str();
        let items = tables.items.as_str();
        // A REFERENCES clause may not carry a schema qualifier.
        let groups_ref = tables.groups.unqualified();

        Self {
            create_tables: format!(
                "CREATE TABLE IF NOT EXISTS {groups} (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     aggregator_name TEXT NOT NULL,
                     group_id TEXT NOT NULL,
                     target_size INTEGER NOT NULL DEFAULT 0,
                     eviction_ms INTEGER NOT NULL DEFAULT 0,
                     item_count INTEGER NOT NULL DEFAULT 0,
                     is_complete INTEGER NOT NULL DEFAULT 0,
                     first_event_time INTEGER NOT NULL,
                     last_event_time INTEGER NOT NULL,
                     created_at INTEGER NOT NULL,
                     completed_at INTEGER,
                     UNIQUE (aggregator_name, group_id)
                 );
                 CREATE TABLE IF NOT EXISTS {items} (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     reference_id INTEGER NOT NULL REFERENCES {groups_ref}(id) ON DELETE CASCADE,
                     sequence_number INTEGER NOT NULL,
                     payload BLOB NOT NULL,
                     checksum INTEGER NOT NULL,
                     event_time INTEGER NOT NULL,
                     UNIQUE (reference_id, sequence_number)
                 );"
            ),
            select_group_by_key: format!(
                "SELECT {GROUP_COLUMNS} FROM {groups} WHERE aggregator_name = ?1 AND group_id = ?2"
            ),
            insert_group: format!(
                "INSERT INTO {groups}
                     (aggregator_name, group_id, target_size, eviction_ms, item_count,
                      is_complete, first_event_time, last_event_time, created_at)
                 VALUES (?1, ?2, ?3, ?4, 0, 0, ?5, ?5, ?5)"
            ),
            bump_group: format!(
                "UPDATE {groups}
                 SET item_count = item_count + 1, last_event_time = ?1
                 WHERE id = ?2 AND is_complete = 0
                 RETURNING item_count"
            ),
            insert_item: format!(
                "INSERT INTO {items} (reference_id, sequence_number, payload, checksum, event_time)
                 VALUES (?1, ?2, ?3, ?4, ?5)"
            ),
            select_items: format!(
                "SELECT i.sequence_number, i.payload, i.checksum, i.event_time
                 FROM {items} i
                 JOIN {groups} g ON g.id = i.reference_id
                 WHERE g.aggregator_name = ?1 AND g.group_id = ?2
                 ORDER BY i.sequence_number ASC"
            ),
            mark_complete: format!(
                "UPDATE {groups}
                 SET is_complete = 1, completed_at = ?1
                 WHERE aggregator_name = ?2 AND group_id = ?3 AND is_complete = 0"
            ),
            select_latest_group: format!(
                "SELECT {GROUP_COLUMNS} FROM {groups}
                 WHERE aggregator_name = ?1
                 ORDER BY id DESC
                 LIMIT 1"
            ),
            select_due_groups: format!(
                "SELECT {GROUP_COLUMNS} FROM {groups}
                 WHERE is_complete = 0 AND eviction_ms > 0 AND first_event_time + eviction_ms <= ?1
                 ORDER BY id ASC"
            ),
            delete_items_of_group: format!("DELETE FROM {items} WHERE reference_id = ?1"),
            delete_group: format!("DELETE FROM {groups} WHERE id = ?1"),
            delete_items_of_completed: format!(
                "DELETE FROM {items} WHERE reference_id IN
                     (SELECT id FROM {groups} WHERE is_complete = 1 AND completed_at < ?1)"
            ),
            delete_completed_groups: format!(
                "DELETE FROM {groups} WHERE is_complete = 1 AND completed_at < ?1"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tables() {
        let config = TableConfig::default();
        assert_eq!(config.groups.as_str(), DEFAULT_GROUPS_TABLE);
        assert_eq!(config.items.as_str(), DEFAULT_ITEMS_TABLE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_new_rejects_bad_names() {
        let err = TableConfig::new("groups; --", "items").unwrap_err();
        assert!(matches!(err, AggregatorError::Configuration(_)));

        let err = TableConfig::new("same", "same").unwrap_err();
        assert!(err.to_string().contains("must differ"));

        // Names that would only fail once rendered into SQL
        for groups in ["x.", "a.b.c", "main.1groups"] {
            let err = TableConfig::new(groups, "items").unwrap_err();
            assert!(matches!(err, AggregatorError::Configuration(_)), "{}", groups);
        }
    }

    #[test]
    fn test_render_uses_configured_names() {
        let tables = TableConfig::new("main.agg_groups", "main.agg_items").unwrap();
        let sql = Statements::render(&tables);
        assert!(sql.create_tables.contains("CREATE TABLE IF NOT EXISTS main.agg_groups"));
        assert!(sql.create_tables.contains("REFERENCES agg_groups(id)"));
        assert!(sql.insert_item.contains("INSERT INTO main.agg_items"));
        assert!(sql.mark_complete.contains("is_complete = 0"));
    }
}
