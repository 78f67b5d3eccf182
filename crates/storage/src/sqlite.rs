//! SQLite-backed aggregation store
//!
//! ## Design
//!
//! `SqliteStore` owns one connection guarded by a `parking_lot::Mutex`. Within
//! a process that serializes callers sharing one store; across stores or
//! processes opened on the same file, coordination happens only through
//! SQLite: `BEGIN IMMEDIATE` write transactions, WAL journaling, a busy
//! timeout, and the UNIQUE constraints on both tables.
//!
//! ## Append protocol
//!
//! `add_item` runs one immediate transaction:
//! 1. look the group up by `(aggregator_name, group_id)`; if absent, insert it.
//!    A uniqueness violation on that insert means another writer created it
//!    first: the row is re-read and the race is logged, not surfaced.
//! 2. bump `item_count` and `last_event_time` with `WHERE is_complete = 0`.
//!    The returned count is the item's sequence number. Zero rows means the
//!    group already completed.
//! 3. insert the item with a CRC32 of its payload.
//! 4. commit. Any failure rolls the whole transaction back.
//!
//! ## Completion
//!
//! `mark_complete` is a single conditional UPDATE in its own transaction. The
//! affected-row count decides the winner.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use aggregator_core::{
    require_payload, system_clock, AddedItem, AggregatorError, Clock, GroupKey, GroupSettings,
    GroupStatus, RaceWarning, Result, StoredItem, Timestamp,
};
use parking_lot::Mutex;
use rusqlite::{
    ffi, params, Connection, ErrorCode, OpenFlags, OptionalExtension, Row, Transaction,
    TransactionBehavior,
};
use tracing::{debug, info, warn};

use crate::metrics::{StoreMetrics, StoreMetricsSnapshot};
use crate::schema::{Statements, TableConfig};
use crate::traits::AggregationStore;

/// Default time a writer waits for a competing write lock
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Aggregation store on top of SQLite
///
/// # Example
///
/// ```ignore
/// use aggregator_storage::{AggregationStore, SqliteStore};
/// use aggregator_core::{GroupKey, GroupSettings};
///
/// let store = SqliteStore::open("/var/lib/aggregator/agg.db")?;
/// let key = GroupKey::new("orders", "o-1");
/// let added = store.add_item(&key, GroupSettings::new(3, Duration::ZERO), b"A")?;
/// assert_eq!(added.sequence_number, 1);
/// ```
pub struct SqliteStore {
    conn: Mutex<Connection>,
    tables: TableConfig,
    sql: Statements,
    clock: Arc<dyn Clock>,
    metrics: StoreMetrics,
}

/// Builder for [`SqliteStore`]
#[derive(Debug, Clone)]
pub struct SqliteStoreBuilder {
    tables: TableConfig,
    busy_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl Default for SqliteStoreBuilder {
    fn default() -> Self {
        Self {
            tables: TableConfig::default(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            clock: system_clock(),
        }
    }
}

impl SqliteStoreBuilder {
    /// Create a builder with default tables, busy timeout and system clock
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the given table names
    pub fn tables(mut self, tables: TableConfig) -> Self {
        self.tables = tables;
        self
    }

    /// How long a writer waits for the write lock before failing
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Time source for event, creation and completion times
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Open (or create) a database file
    ///
    /// # Errors
    ///
    /// `Configuration` for invalid table settings, `Storage` if the file
    /// cannot be opened or the schema cannot be created.
    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<SqliteStore> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| AggregatorError::storage("open", e))?;
        let store = self.finish(conn, true)?;
        info!(target: "aggregator::store", path = %path.display(), "SQLite aggregation store opened");
        Ok(store)
    }

    /// Open a private in-memory database
    ///
    /// Nothing survives the store being dropped. Intended for tests and
    /// single-process embedding.
    pub fn open_in_memory(self) -> Result<SqliteStore> {
        let conn =
            Connection::open_in_memory().map_err(|e| AggregatorError::storage("open", e))?;
        self.finish(conn, false)
    }

    fn finish(self, conn: Connection, wal: bool) -> Result<SqliteStore> {
        self.tables.validate()?;

        conn.busy_timeout(self.busy_timeout)
            .map_err(|e| AggregatorError::storage("open", e))?;
        if wal {
            let mode: String = conn
                .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
                .map_err(|e| AggregatorError::storage("open", e))?;
            debug!(target: "aggregator::store", journal_mode = %mode, "Journal mode set");
        }
        conn.pragma_update(None, "foreign_keys", true)
            .map_err(|e| AggregatorError::storage("open", e))?;

        let sql = Statements::render(&self.tables);
        conn.execute_batch(&sql.create_tables)
            .map_err(|e| AggregatorError::storage("create_schema", e))?;

        Ok(SqliteStore {
            conn: Mutex::new(conn),
            tables: self.tables,
            sql,
            clock: self.clock,
            metrics: StoreMetrics::new(),
        })
    }
}

impl SqliteStore {
    /// Builder for custom tables, clock or busy timeout
    pub fn builder() -> SqliteStoreBuilder {
        SqliteStoreBuilder::new()
    }

    /// Open (or create) a database file with default settings
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::builder().open(path)
    }

    /// Open a private in-memory database with default settings
    pub fn open_in_memory() -> Result<Self> {
        Self::builder().open_in_memory()
    }

    /// Table names in use
    pub fn tables(&self) -> &TableConfig {
        &self.tables
    }

    /// Log and count an absorbed race condition
    fn note(&self, warning: RaceWarning) {
        warn!(target: "aggregator::store", %warning, "Race warning");
        self.metrics.record_warning(&warning);
    }

    /// Roll back after `err` without letting a rollback failure replace it
    fn rollback_quietly(&self, tx: Transaction<'_>, operation: &'static str, err: &AggregatorError) {
        self.metrics.record_rollback();
        debug!(target: "aggregator::store", operation, error = %err, "Rolling back");
        if let Err(e) = tx.rollback() {
            self.note(RaceWarning::RollbackFailed {
                operation,
                reason: e.to_string(),
            });
        }
    }

    fn begin<'c>(&self, conn: &'c mut Connection, operation: &'static str) -> Result<Transaction<'c>> {
        conn.transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| AggregatorError::storage(operation, e))
    }

    /// Fetch or create the group row inside `tx`. Returns `(id, created)`.
    fn ensure_group(
        &self,
        tx: &Transaction<'_>,
        key: &GroupKey,
        settings: GroupSettings,
        now: Timestamp,
    ) -> Result<(i64, bool)> {
        if let Some(id) = self.group_id_in(tx, key)? {
            return Ok((id, false));
        }
        self.create_group(tx, key, settings, now)
    }

    /// Insert the group row. A uniqueness violation means another writer
    /// created it between our lookup and this insert; the existing row wins.
    fn create_group(
        &self,
        tx: &Transaction<'_>,
        key: &GroupKey,
        settings: GroupSettings,
        now: Timestamp,
    ) -> Result<(i64, bool)> {
        let inserted = tx.execute(
            &self.sql.insert_group,
            params![
                key.aggregator_name,
                key.group_id,
                i64::from(settings.target_size),
                duration_to_millis(settings.eviction),
                i64::from(now),
            ],
        );

        match inserted {
            Ok(_) => Ok((tx.last_insert_rowid(), true)),
            Err(e) if is_unique_violation(&e) => {
                self.note(RaceWarning::DuplicateCreate { group: key.clone() });
                self.group_id_in(tx, key)?.ok_or_else(|| {
                    AggregatorError::storage(
                        "add_item",
                        format!("group {} vanished after duplicate-key insert", key),
                    )
                })
                .map(|id| (id, false))
            }
            Err(e) => Err(AggregatorError::storage("add_item", e)),
        }
    }

    fn group_id_in(&self, tx: &Transaction<'_>, key: &GroupKey) -> Result<Option<i64>> {
        let mut stmt = tx
            .prepare_cached(&self.sql.select_group_by_key)
            .map_err(|e| AggregatorError::storage("add_item", e))?;
        stmt.query_row(params![key.aggregator_name, key.group_id], |row| row.get(0))
            .optional()
            .map_err(|e| AggregatorError::storage("add_item", e))
    }

    fn append_in(
        &self,
        tx: &Transaction<'_>,
        key: &GroupKey,
        settings: GroupSettings,
        payload: &[u8],
        now: Timestamp,
    ) -> Result<AddedItem> {
        let (reference_id, created_group) = self.ensure_group(tx, key, settings, now)?;

        let item_count: Option<i64> = tx
            .prepare_cached(&self.sql.bump_group)
            .and_then(|mut stmt| {
                stmt.query_row(params![i64::from(now), reference_id], |row| row.get(0))
                    .optional()
            })
            .map_err(|e| AggregatorError::storage("add_item", e))?;
        let item_count = match item_count {
            Some(count) => count,
            None => return Err(AggregatorError::GroupClosed { group: key.clone() }),
        };

        tx.prepare_cached(&self.sql.insert_item)
            .and_then(|mut stmt| {
                stmt.execute(params![
                    reference_id,
                    item_count,
                    payload,
                    i64::from(crc32fast::hash(payload)),
                    i64::from(now),
                ])
            })
            .map_err(|e| AggregatorError::storage("add_item", e))?;

        let item_count = u64::try_from(item_count).unwrap_or(0);
        Ok(AddedItem {
            reference_id,
            sequence_number: item_count,
            item_count,
            created_group,
        })
    }
}

impl AggregationStore for SqliteStore {
    fn add_item(&self, key: &GroupKey, settings: GroupSettings, payload: &[u8]) -> Result<AddedItem> {
        key.validate()?;
        require_payload(payload)?;

        let now = self.clock.now();
        let mut conn = self.conn.lock();
        let tx = self.begin(&mut conn, "add_item")?;

        let added = match self.append_in(&tx, key, settings, payload, now) {
            Ok(added) => added,
            Err(e) => {
                self.rollback_quietly(tx, "add_item", &e);
                return Err(e);
            }
        };
        tx.commit()
            .map_err(|e| AggregatorError::storage("add_item", e))?;

        self.metrics.record_append(added.created_group);
        debug!(
            target: "aggregator::store",
            group = %key,
            sequence = added.sequence_number,
            created = added.created_group,
            "Item appended"
        );
        Ok(added)
    }

    fn get_status(&self, key: &GroupKey) -> Result<Option<GroupStatus>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(&self.sql.select_group_by_key)
            .map_err(|e| AggregatorError::storage("get_status", e))?;
        stmt.query_row(params![key.aggregator_name, key.group_id], status_from_row)
            .optional()
            .map_err(|e| AggregatorError::storage("get_status", e))
    }

    fn fetch_ordered_items(&self, key: &GroupKey) -> Result<Vec<StoredItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(&self.sql.select_items)
            .map_err(|e| AggregatorError::storage("fetch_ordered_items", e))?;
        let mut rows = stmt
            .query(params![key.aggregator_name, key.group_id])
            .map_err(|e| AggregatorError::storage("fetch_ordered_items", e))?;

        let mut items = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|e| AggregatorError::storage("fetch_ordered_items", e))?
        {
            match item_from_row(row) {
                Ok(item) => items.push(item),
                Err((sequence_number, reason)) => self.note(RaceWarning::CorruptItem {
                    group: key.clone(),
                    sequence_number,
                    reason,
                }),
            }
        }
        Ok(items)
    }

    fn mark_complete(&self, key: &GroupKey) -> Result<bool> {
        let now = self.clock.now();
        let updated = {
            let conn = self.conn.lock();
            conn.execute(
                &self.sql.mark_complete,
                params![i64::from(now), key.aggregator_name, key.group_id],
            )
            .map_err(|e| AggregatorError::storage("mark_complete", e))?
        };

        if updated == 0 {
            self.note(RaceWarning::CompletionAlreadyApplied { group: key.clone() });
            return Ok(false);
        }
        self.metrics.record_completion();
        info!(target: "aggregator::store", group = %key, "Group marked complete");
        Ok(true)
    }

    fn latest_group(&self, aggregator_name: &str) -> Result<Option<GroupStatus>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(&self.sql.select_latest_group)
            .map_err(|e| AggregatorError::storage("latest_group", e))?;
        stmt.query_row(params![aggregator_name], status_from_row)
            .optional()
            .map_err(|e| AggregatorError::storage("latest_group", e))
    }

    fn open_groups_due(&self, now: Timestamp) -> Result<Vec<GroupStatus>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(&self.sql.select_due_groups)
            .map_err(|e| AggregatorError::storage("open_groups_due", e))?;
        let rows = stmt
            .query_map(params![i64::from(now)], status_from_row)
            .map_err(|e| AggregatorError::storage("open_groups_due", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| AggregatorError::storage("open_groups_due", e))
    }

    fn delete_group(&self, key: &GroupKey) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = self.begin(&mut conn, "delete_group")?;

        let result = (|| -> Result<bool> {
            let id: Option<i64> = tx
                .query_row(
                    &self.sql.select_group_by_key,
                    params![key.aggregator_name, key.group_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| AggregatorError::storage("delete_group", e))?;
            let Some(id) = id else {
                return Ok(false);
            };
            tx.execute(&self.sql.delete_items_of_group, params![id])
                .map_err(|e| AggregatorError::storage("delete_group", e))?;
            tx.execute(&self.sql.delete_group, params![id])
                .map_err(|e| AggregatorError::storage("delete_group", e))?;
            Ok(true)
        })();

        match result {
            Ok(removed) => {
                tx.commit()
                    .map_err(|e| AggregatorError::storage("delete_group", e))?;
                if removed {
                    debug!(target: "aggregator::store", group = %key, "Group deleted");
                }
                Ok(removed)
            }
            Err(e) => {
                self.rollback_quietly(tx, "delete_group", &e);
                Err(e)
            }
        }
    }

    fn purge_completed(&self, cutoff: Timestamp) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = self.begin(&mut conn, "purge_completed")?;

        let result = tx
            .execute(&self.sql.delete_items_of_completed, params![i64::from(cutoff)])
            .and_then(|_| tx.execute(&self.sql.delete_completed_groups, params![i64::from(cutoff)]))
            .map_err(|e| AggregatorError::storage("purge_completed", e));

        match result {
            Ok(removed) => {
                tx.commit()
                    .map_err(|e| AggregatorError::storage("purge_completed", e))?;
                if removed > 0 {
                    info!(target: "aggregator::store", removed, cutoff = %cutoff, "Purged completed groups");
                }
                Ok(removed)
            }
            Err(e) => {
                self.rollback_quietly(tx, "purge_completed", &e);
                Err(e)
            }
        }
    }

    fn now(&self) -> Timestamp {
        self.clock.now()
    }

    fn metrics(&self) -> StoreMetricsSnapshot {
        self.metrics.snapshot()
    }
}

// ============================================================================
// Row decoding
// ============================================================================

fn status_from_row(row: &Row<'_>) -> rusqlite::Result<GroupStatus> {
    let target_size: i64 = row.get(3)?;
    let eviction_ms: i64 = row.get(4)?;
    let item_count: i64 = row.get(5)?;
    let completed_at: Option<i64> = row.get(10)?;

    Ok(GroupStatus {
        reference_id: row.get(0)?,
        key: GroupKey::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?),
        settings: GroupSettings::new(
            u32::try_from(target_size).unwrap_or(0),
            Duration::from_millis(u64::try_from(eviction_ms).unwrap_or(0)),
        ),
        item_count: u64::try_from(item_count).unwrap_or(0),
        is_complete: row.get(6)?,
        first_event_time: Timestamp::from(row.get::<_, i64>(7)?),
        last_event_time: Timestamp::from(row.get::<_, i64>(8)?),
        created_at: Timestamp::from(row.get::<_, i64>(9)?),
        completed_at: completed_at.map(Timestamp::from),
    })
}

/// Decode one item row. On failure returns the sequence number (if readable)
/// and a reason.
fn item_from_row(row: &Row<'_>) -> std::result::Result<StoredItem, (Option<u64>, String)> {
    let sequence_number = row
        .get::<_, i64>(0)
        .ok()
        .and_then(|seq| u64::try_from(seq).ok());
    let corrupt = |reason: String| (sequence_number, reason);

    let Some(seq) = sequence_number else {
        return Err(corrupt("unreadable sequence number".to_string()));
    };
    let payload: Vec<u8> = row
        .get(1)
        .map_err(|e| corrupt(format!("unreadable payload: {}", e)))?;
    let checksum: i64 = row
        .get(2)
        .map_err(|e| corrupt(format!("unreadable checksum: {}", e)))?;
    let event_time: i64 = row
        .get(3)
        .map_err(|e| corrupt(format!("unreadable event time: {}", e)))?;

    let actual = i64::from(crc32fast::hash(&payload));
    if actual != checksum {
        return Err(corrupt(format!(
            "checksum mismatch: stored {:#010x}, computed {:#010x}",
            checksum, actual
        )));
    }
    if payload.is_empty() {
        return Err(corrupt("empty payload".to_string()));
    }

    Ok(StoredItem {
        sequence_number: seq,
        payload,
        event_time: Timestamp::from(event_time),
    })
}

/// Whether `err` is SQLite's duplicate-key signal
///
/// Matches the UNIQUE and PRIMARY KEY extended codes, and falls back to the
/// message text when only the primary constraint code is available.
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, message) => {
            e.code == ErrorCode::ConstraintViolation
                && (e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    || message
                        .as_deref()
                        .is_some_and(|m| m.contains("UNIQUE constraint failed")))
        }
        _ => false,
    }
}

fn duration_to_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
