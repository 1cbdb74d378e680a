//! # Change Tracker
//!
//! Durable log of local field-level mutations and their compression into
//! upload deltas.
//!
//! ## Overview
//!
//! Every local write appends a [`ChangeLogEntry`]. Before upload the pending
//! entries are compressed into one [`DeltaBatch`] per record:
//!
//! - `DELETE` discards earlier field state and leaves a single tombstone
//!   change (`__deleted__ = true`)
//! - `INSERT` records every field with a null `old_value`, and revives a
//!   tombstoned record
//! - `UPDATE` overwrites the pending value of a field but keeps the first-seen
//!   `old_value`; updates after a tombstone are ignored
//!
//! Batches are then ordered by table priority (payments, credit data,
//! clients, everything else) and timestamp, and cut into chunks.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let tracker = ChangeTracker::new(pool.clone(), records, clock);
//!
//! let mut changes = FieldMap::new();
//! changes.insert("monto".to_string(), json!(1000));
//! tracker.log_change("pagos", "pago-1", Operation::Insert, changes).await?;
//!
//! for chunk in tracker.create_upload_batches(50).await? {
//!     remote.upsert_batch(&chunk).await?;
//! }
//! ```

use crate::error::{Result, SyncError};
use bridge_traits::time::Clock;
use core_store::{upload_priority, CrdtRecord, FieldMap, RecordRepository, TableKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{query, sqlite::SqliteRow, Row, SqlitePool};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Field name of the deletion marker.
pub const TOMBSTONE_FIELD: &str = "__deleted__";

const MILLIS_PER_DAY: i64 = 86_400_000;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl FromStr for Operation {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(Operation::Insert),
            "UPDATE" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            other => Err(SyncError::invalid_input(
                "operation",
                format!("unknown operation '{}'", other),
            )),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One raw local mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub id: i64,
    /// Unix millis
    pub timestamp: i64,
    pub table_name: String,
    pub record_id: String,
    pub operation: Operation,
    pub changes: FieldMap,
    /// Values before the write, when the caller knew them
    pub previous: Option<FieldMap>,
    pub synced: bool,
}

/// Compressed delta of a single field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub field: String,
    pub old_value: Value,
    pub new_value: Value,
    pub timestamp: i64,
}

impl Change {
    pub fn is_tombstone(&self) -> bool {
        self.field == TOMBSTONE_FIELD
    }
}

/// All pending changes of one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaBatch {
    pub table_name: String,
    pub record_id: String,
    pub changes: Vec<Change>,
    pub compressed: bool,
    /// Latest timestamp among the contributing entries
    pub timestamp: i64,
}

impl DeltaBatch {
    pub fn is_tombstone(&self) -> bool {
        self.changes.iter().any(Change::is_tombstone)
    }

    pub fn operation(&self) -> Operation {
        if self.is_tombstone() {
            Operation::Delete
        } else if !self.changes.is_empty() && self.changes.iter().all(|c| c.old_value.is_null()) {
            Operation::Insert
        } else {
            Operation::Update
        }
    }

    /// Field values carried by the batch, tombstone excluded.
    pub fn field_values(&self) -> FieldMap {
        self.changes
            .iter()
            .filter(|change| !change.is_tombstone())
            .map(|change| (change.field.clone(), change.new_value.clone()))
            .collect()
    }
}

/// Change log counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogStats {
    pub total: u64,
    pub pending: u64,
    pub synced: u64,
    /// Entries per table, synced and pending
    pub by_table: BTreeMap<String, u64>,
}

// ============================================================================
// Compression
// ============================================================================

#[derive(Default)]
struct RecordDelta {
    changes: Vec<Change>,
    tombstoned: bool,
    timestamp: Option<i64>,
}

impl RecordDelta {
    fn touch(&mut self, timestamp: i64) {
        self.timestamp = Some(self.timestamp.map_or(timestamp, |t| t.max(timestamp)));
    }

    fn delete(&mut self, timestamp: i64) {
        self.changes.clear();
        self.changes.push(Change {
            field: TOMBSTONE_FIELD.to_string(),
            old_value: Value::Null,
            new_value: Value::Bool(true),
            timestamp,
        });
        self.tombstoned = true;
        self.touch(timestamp);
    }

    fn insert(&mut self, fields: &FieldMap, timestamp: i64) {
        if self.tombstoned {
            self.changes.clear();
            self.tombstoned = false;
        }
        for (field, value) in fields {
            let fresh = Change {
                field: field.clone(),
                old_value: Value::Null,
                new_value: value.clone(),
                timestamp,
            };
            match self.changes.iter_mut().find(|c| &c.field == field) {
                Some(existing) => *existing = fresh,
                None => self.changes.push(fresh),
            }
        }
        self.touch(timestamp);
    }

    /// Returns `false` when the update was superseded by a tombstone.
    fn update(&mut self, changes: impl Iterator<Item = Change>, timestamp: i64) -> bool {
        if self.tombstoned {
            return false;
        }
        for change in changes {
            match self.changes.iter_mut().find(|c| c.field == change.field) {
                Some(existing) => {
                    existing.new_value = change.new_value;
                    existing.timestamp = change.timestamp;
                }
                None => self.changes.push(change),
            }
        }
        self.touch(timestamp);
        true
    }
}

/// Groups keyed by `(table, record)` in first-appearance order.
#[derive(Default)]
struct Compressor {
    order: Vec<(String, String)>,
    groups: HashMap<(String, String), RecordDelta>,
}

impl Compressor {
    fn group(&mut self, table: &str, record_id: &str) -> &mut RecordDelta {
        let key = (table.to_string(), record_id.to_string());
        if !self.groups.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.groups.entry(key).or_default()
    }

    fn finish(mut self) -> Vec<DeltaBatch> {
        self.order
            .into_iter()
            .filter_map(|key| {
                let delta = self.groups.remove(&key)?;
                let timestamp = delta.timestamp?;
                let (table_name, record_id) = key;
                Some(DeltaBatch {
                    table_name,
                    record_id,
                    changes: delta.changes,
                    compressed: true,
                    timestamp,
                })
            })
            .collect()
    }
}

/// Compress raw entries into one delta per record.
///
/// Entries of a record are applied in timestamp order; equal timestamps keep
/// their input order.
pub fn compress_changes(entries: &[ChangeLogEntry]) -> Vec<DeltaBatch> {
    let mut sorted: Vec<&ChangeLogEntry> = entries.iter().collect();
    sorted.sort_by_key(|entry| entry.timestamp);

    let mut compressor = Compressor::default();
    // Register groups in first-appearance order of the input
    for entry in entries {
        compressor.group(&entry.table_name, &entry.record_id);
    }

    for entry in sorted {
        let group = compressor.group(&entry.table_name, &entry.record_id);
        match entry.operation {
            Operation::Delete => group.delete(entry.timestamp),
            Operation::Insert => group.insert(&entry.changes, entry.timestamp),
            Operation::Update => {
                let changes = entry.changes.iter().map(|(field, value)| Change {
                    field: field.clone(),
                    old_value: entry
                        .previous
                        .as_ref()
                        .and_then(|previous| previous.get(field))
                        .cloned()
                        .unwrap_or(Value::Null),
                    new_value: value.clone(),
                    timestamp: entry.timestamp,
                });
                group.update(changes, entry.timestamp);
            }
        }
    }

    compressor.finish()
}

/// Merge already compressed batches; batches of the same record collapse.
///
/// `compress_batches(&compress_changes(x)) == compress_changes(x)`.
pub fn compress_batches(batches: &[DeltaBatch]) -> Vec<DeltaBatch> {
    let mut compressor = Compressor::default();

    for batch in batches {
        let group = compressor.group(&batch.table_name, &batch.record_id);
        if let Some(tombstone) = batch.changes.iter().find(|c| c.is_tombstone()) {
            group.delete(tombstone.timestamp);
            group.touch(batch.timestamp);
        } else if group.update(batch.changes.iter().cloned(), batch.timestamp) {
            // applied
        } else if batch.operation() == Operation::Insert {
            group.insert(&batch.field_values(), batch.timestamp);
        }
    }

    compressor.finish()
}

/// Stable sort by `(table priority, timestamp)` and cut into chunks.
pub fn chunk_batches(
    mut batches: Vec<DeltaBatch>,
    max_batch_size: usize,
) -> Result<Vec<Vec<DeltaBatch>>> {
    if max_batch_size == 0 {
        return Err(SyncError::invalid_input(
            "max_batch_size",
            "must be greater than 0",
        ));
    }

    batches.sort_by_key(|batch| (upload_priority(&batch.table_name), batch.timestamp));

    Ok(batches
        .chunks(max_batch_size)
        .map(<[DeltaBatch]>::to_vec)
        .collect())
}

// ============================================================================
// Change Tracker
// ============================================================================

pub struct ChangeTracker {
    pool: SqlitePool,
    records: Arc<dyn RecordRepository>,
    clock: Arc<dyn Clock>,
    tenant_id: Option<String>,
}

impl ChangeTracker {
    pub fn new(pool: SqlitePool, records: Arc<dyn RecordRepository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            records,
            clock,
            tenant_id: None,
        }
    }

    /// Tenant stamped on records created by [`ChangeTracker::apply_deltas`]
    pub fn with_tenant(mut self, tenant_id: Option<String>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    /// Append a mutation to the log.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an empty table name or record id, or an
    /// `INSERT`/`UPDATE` without fields.
    pub async fn log_change(
        &self,
        table_name: &str,
        record_id: &str,
        operation: Operation,
        changes: FieldMap,
    ) -> Result<i64> {
        self.append(table_name, record_id, operation, changes, None)
            .await
    }

    /// Like [`ChangeTracker::log_change`], with the values the fields had
    /// before the write; they become the `old_value` of the compressed change.
    pub async fn log_change_with_previous(
        &self,
        table_name: &str,
        record_id: &str,
        operation: Operation,
        changes: FieldMap,
        previous: FieldMap,
    ) -> Result<i64> {
        self.append(table_name, record_id, operation, changes, Some(previous))
            .await
    }

    async fn append(
        &self,
        table_name: &str,
        record_id: &str,
        operation: Operation,
        changes: FieldMap,
        previous: Option<FieldMap>,
    ) -> Result<i64> {
        validate_change(table_name, record_id, operation, &changes)?;

        let timestamp = self.clock.unix_timestamp_millis();
        let previous = previous.map(|p| serde_json::to_string(&p)).transpose()?;

        let result = query(
            r#"
            INSERT INTO change_log (timestamp, table_name, record_id, operation, changes, previous, synced)
            VALUES (?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(timestamp)
        .bind(table_name)
        .bind(record_id)
        .bind(operation.as_str())
        .bind(serde_json::to_string(&changes)?)
        .bind(previous)
        .execute(&self.pool)
        .await?;

        debug!(
            table = %table_name,
            record_id = %record_id,
            operation = %operation,
            fields = changes.len(),
            "Logged change"
        );

        Ok(result.last_insert_rowid())
    }

    /// Unsynced entries of one record, oldest first.
    pub async fn get_pending_changes(
        &self,
        table_name: &str,
        record_id: &str,
    ) -> Result<Vec<ChangeLogEntry>> {
        let rows = query(
            r#"
            SELECT * FROM change_log
            WHERE synced = 0 AND table_name = ? AND record_id = ?
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(table_name)
        .bind(record_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_entry).collect()
    }

    /// All unsynced entries, oldest first.
    pub async fn get_all_pending_changes(&self) -> Result<Vec<ChangeLogEntry>> {
        let rows = query("SELECT * FROM change_log WHERE synced = 0 ORDER BY timestamp ASC, id ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(decode_entry).collect()
    }

    /// Compress everything pending and cut it into upload chunks.
    ///
    /// # Errors
    ///
    /// `InvalidInput` when `max_batch_size` is zero.
    pub async fn create_upload_batches(&self, max_batch_size: usize) -> Result<Vec<Vec<DeltaBatch>>> {
        if max_batch_size == 0 {
            return Err(SyncError::invalid_input(
                "max_batch_size",
                "must be greater than 0",
            ));
        }

        let pending = self.get_all_pending_changes().await?;
        let compressed = compress_changes(&pending);
        let chunks = chunk_batches(compressed, max_batch_size)?;

        debug!(
            entries = pending.len(),
            chunks = chunks.len(),
            "Prepared upload batches"
        );

        Ok(chunks)
    }

    /// Apply deltas to the local record store.
    ///
    /// A batch that fails (unknown table, store error) is logged and skipped.
    /// Returns the number of batches applied.
    #[instrument(skip(self, batches), fields(batches = batches.len()))]
    pub async fn apply_deltas(&self, batches: &[DeltaBatch]) -> Result<usize> {
        let mut applied = 0;

        for batch in batches {
            match self.apply_delta(batch).await {
                Ok(()) => applied += 1,
                Err(e) => warn!(
                    table = %batch.table_name,
                    record_id = %batch.record_id,
                    error = %e,
                    "Failed to apply delta"
                ),
            }
        }

        info!(applied, total = batches.len(), "Applied deltas");
        Ok(applied)
    }

    async fn apply_delta(&self, batch: &DeltaBatch) -> Result<()> {
        let table: TableKind = batch.table_name.parse()?;

        if batch.is_tombstone() {
            self.records.delete(table, &batch.record_id).await?;
            return Ok(());
        }

        let mut record = match self.records.find(table, &batch.record_id).await? {
            Some(existing) => existing,
            None => CrdtRecord::new(batch.record_id.clone()).with_tenant(self.tenant_id.clone()),
        };

        for change in &batch.changes {
            if change.field == "id" {
                continue;
            }
            record
                .fields
                .insert(change.field.clone(), change.new_value.clone());
            if let Some(version) = record.field_versions.get_mut(&change.field) {
                version.value = change.new_value.clone();
                version.timestamp = version.timestamp.max(change.timestamp);
            }
        }

        record.updated_at = record.updated_at.max(batch.timestamp);
        record.synced = true;

        self.records.upsert(table, &record).await?;
        Ok(())
    }

    /// Flag a record's pending entries as uploaded. Idempotent.
    pub async fn mark_changes_synced(&self, table_name: &str, record_id: &str) -> Result<u64> {
        self.mark_changes_synced_through(table_name, record_id, i64::MAX)
            .await
    }

    /// Flag pending entries up to and including `timestamp`; later writes
    /// stay pending for the next pass.
    pub async fn mark_changes_synced_through(
        &self,
        table_name: &str,
        record_id: &str,
        timestamp: i64,
    ) -> Result<u64> {
        let result = query(
            r#"
            UPDATE change_log SET synced = 1
            WHERE synced = 0 AND table_name = ? AND record_id = ? AND timestamp <= ?
            "#,
        )
        .bind(table_name)
        .bind(record_id)
        .bind(timestamp)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Retention sweep: delete synced entries older than `days_old` days.
    pub async fn clear_old_synced_changes(&self, days_old: u32) -> Result<u64> {
        let cutoff = self.clock.unix_timestamp_millis() - i64::from(days_old) * MILLIS_PER_DAY;

        let result = query("DELETE FROM change_log WHERE synced = 1 AND timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            info!(deleted = result.rows_affected(), days_old, "Cleared old synced changes");
        }

        Ok(result.rows_affected())
    }

    pub async fn get_stats(&self) -> Result<ChangeLogStats> {
        let rows = query(
            "SELECT table_name, synced, COUNT(*) AS n FROM change_log GROUP BY table_name, synced",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = ChangeLogStats::default();
        for row in rows {
            let table: String = row.try_get("table_name")?;
            let synced: i64 = row.try_get("synced")?;
            let count = row.try_get::<i64, _>("n")? as u64;

            stats.total += count;
            if synced != 0 {
                stats.synced += count;
            } else {
                stats.pending += count;
            }
            *stats.by_table.entry(table).or_insert(0) += count;
        }

        Ok(stats)
    }
}

fn validate_change(
    table_name: &str,
    record_id: &str,
    operation: Operation,
    changes: &FieldMap,
) -> Result<()> {
    if table_name.trim().is_empty() {
        return Err(SyncError::invalid_input("table_name", "cannot be empty"));
    }
    if record_id.trim().is_empty() {
        return Err(SyncError::invalid_input("record_id", "cannot be empty"));
    }
    if operation != Operation::Delete && changes.is_empty() {
        return Err(SyncError::invalid_input(
            "changes",
            format!("{} requires at least one field", operation),
        ));
    }
    if changes.contains_key(TOMBSTONE_FIELD) {
        return Err(SyncError::invalid_input(
            "changes",
            format!("'{}' is reserved", TOMBSTONE_FIELD),
        ));
    }
    Ok(())
}

fn decode_entry(row: &SqliteRow) -> Result<ChangeLogEntry> {
    let operation: String = row.try_get("operation")?;
    let changes: String = row.try_get("changes")?;
    let previous: Option<String> = row.try_get("previous")?;

    Ok(ChangeLogEntry {
        id: row.try_get("id")?,
        timestamp: row.try_get("timestamp")?,
        table_name: row.try_get("table_name")?,
        record_id: row.try_get("record_id")?,
        operation: operation.parse()?,
        changes: serde_json::from_str(&changes)?,
        previous: previous.map(|p| serde_json::from_str(&p)).transpose()?,
        synced: row.try_get::<i64, _>("synced")? != 0,
    })
}
