//! Dead-letter log of queue items that exhausted their retries.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use sqlx::{query, sqlite::SqliteRow, Row, SqlitePool};
use tracing::info;

/// One dead-lettered operation with the context needed to triage it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncErrorEntry {
    pub id: i64,
    pub queue_item_id: String,
    pub table_name: String,
    pub record_id: String,
    pub operation: String,
    pub retry_count: u32,
    pub error: String,
    /// Unix millis
    pub failed_at: i64,
}

#[derive(Clone)]
pub struct ErrorLog {
    pool: SqlitePool,
}

impl ErrorLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Most recent entries first. `None` returns everything.
    pub async fn recent_errors(&self, limit: Option<usize>) -> Result<Vec<SyncErrorEntry>> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);

        let rows = query("SELECT * FROM sync_error_log ORDER BY failed_at DESC, id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(decode_entry).collect()
    }

    pub async fn count(&self) -> Result<u64> {
        let count: i64 = query("SELECT COUNT(*) FROM sync_error_log")
            .fetch_one(&self.pool)
            .await?
            .try_get(0)?;
        Ok(count as u64)
    }

    /// Whether a record has a dead-lettered operation
    pub async fn has_entry(&self, table_name: &str, record_id: &str) -> Result<bool> {
        let row = query("SELECT 1 FROM sync_error_log WHERE table_name = ? AND record_id = ? LIMIT 1")
            .bind(table_name)
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Drop every entry. Records they referenced become eligible for upload again.
    pub async fn clear(&self) -> Result<u64> {
        let result = query("DELETE FROM sync_error_log")
            .execute(&self.pool)
            .await?;

        info!(cleared = result.rows_affected(), "Cleared sync error log");
        Ok(result.rows_affected())
    }
}

fn decode_entry(row: &SqliteRow) -> Result<SyncErrorEntry> {
    Ok(SyncErrorEntry {
        id: row.try_get("id")?,
        queue_item_id: row.try_get("queue_item_id")?,
        table_name: row.try_get("table_name")?,
        record_id: row.try_get("record_id")?,
        operation: row.try_get("operation")?,
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
        error: row.try_get("error")?,
        failed_at: row.try_get("failed_at")?,
    })
}
