//! # Sync Queue
//!
//! Durable outbox of record operations awaiting upload.
//!
//! ## Overview
//!
//! Every local write enqueues one item. The orchestrator drains items whose
//! `next_retry` has passed, ordered by priority, timestamp and insertion order.
//!
//! ## Retry Logic
//!
//! A failed upload bumps `retry_count` and pushes `next_retry` out by
//! `min(base * 2^retry_count + jitter, cap)`, with jitter drawn uniformly from
//! `[0, base)`. Once `retry_count` reaches the retry limit the item leaves the
//! live queue and is written to the dead-letter [`ErrorLog`].
//!
//! ## Usage
//!
//! ```ignore
//! let queue = SyncQueue::new(pool.clone(), clock);
//!
//! let id = queue
//!     .add_to_queue("pagos", "pago-1", Operation::Insert, QueueOptions::high())
//!     .await?;
//!
//! for item in queue.get_ready_operations(clock.unix_timestamp_millis(), Some(50)).await? {
//!     match upload(&item).await {
//!         Ok(_) => queue.mark_as_synced(&item.id).await?,
//!         Err(e) => { queue.record_failure(&item.id, &e.to_string()).await?; }
//!     }
//! }
//! ```

use crate::change_tracker::Operation;
use crate::error::{Result, SyncError};
use crate::error_log::{ErrorLog, SyncErrorEntry};
use bridge_traits::time::Clock;
use core_runtime::config::SyncEngineConfig;
use core_runtime::events::{CoreEvent, EventBus, QueueEvent};
use core_store::TableKind;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::{query, sqlite::SqliteRow, Row, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Failures tolerated before an item is dead-lettered
pub const MAX_RETRIES: u32 = 5;

const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Queue priority; lower values drain first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum Priority {
    High = 1,
    #[default]
    Normal = 2,
    Low = 3,
}

impl Priority {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }
}

/// Options for [`SyncQueue::add_to_queue`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Defaults to [`Priority::Normal`]
    pub priority: Option<Priority>,
}

impl QueueOptions {
    pub fn high() -> Self {
        Self {
            priority: Some(Priority::High),
        }
    }

    pub fn with_priority(priority: Priority) -> Self {
        Self {
            priority: Some(priority),
        }
    }

    /// Payments jump the queue; everything else is normal priority.
    pub fn for_table(table_name: &str) -> Self {
        match TableKind::parse(table_name) {
            Some(TableKind::Pagos) => Self::high(),
            _ => Self::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub id: String,
    pub table_name: String,
    pub record_id: String,
    pub operation: Operation,
    pub priority: i32,
    /// Unix millis when the item was enqueued
    pub timestamp: i64,
    pub synced: bool,
    pub retry_count: u32,
    /// Unix millis before which the item is not retried
    pub next_retry: i64,
    pub last_error: Option<String>,
}

impl SyncQueueItem {
    pub fn is_ready(&self, now: i64) -> bool {
        !self.synced && self.next_retry <= now
    }
}

/// What [`SyncQueue::record_failure`] did with the item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying { retry_count: u32, next_retry: i64 },
    DeadLettered { retry_count: u32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub ready: u64,
    pub waiting_retry: u64,
    pub dead_lettered: u64,
}

/// Retry limit and backoff window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            base: DEFAULT_BACKOFF_BASE,
            cap: DEFAULT_BACKOFF_CAP,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SyncEngineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base: config.backoff_base,
            cap: config.backoff_cap,
        }
    }

    /// Delay before attempt `retry_count + 1`, with explicit jitter.
    pub fn delay(&self, retry_count: u32, jitter: Duration) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        let exponential = self.base.saturating_mul(factor);
        exponential.saturating_add(jitter).min(self.cap)
    }

    /// Delay with jitter drawn uniformly from `[0, base)`.
    pub fn jittered_delay(&self, retry_count: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let jitter_ms = if base_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..base_ms)
        };
        self.delay(retry_count, Duration::from_millis(jitter_ms))
    }
}

pub struct SyncQueue {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    error_log: ErrorLog,
    events: Option<EventBus>,
}

impl SyncQueue {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self {
            error_log: ErrorLog::new(pool.clone()),
            pool,
            clock,
            policy: RetryPolicy::default(),
            events: None,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Publish dead-letter events on `events`
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn error_log(&self) -> &ErrorLog {
        &self.error_log
    }

    /// Enqueue an operation. The item is ready immediately.
    pub async fn add_to_queue(
        &self,
        table_name: &str,
        record_id: &str,
        operation: Operation,
        options: QueueOptions,
    ) -> Result<String> {
        if table_name.trim().is_empty() {
            return Err(SyncError::invalid_input("table_name", "cannot be empty"));
        }
        if record_id.trim().is_empty() {
            return Err(SyncError::invalid_input("record_id", "cannot be empty"));
        }

        let id = Uuid::new_v4().to_string();
        let now = self.clock.unix_timestamp_millis();
        let priority = options.priority.unwrap_or_default();

        query(
            r#"
            INSERT INTO sync_queue (id, table_name, record_id, operation, priority, timestamp, synced, retry_count, next_retry)
            VALUES (?, ?, ?, ?, ?, ?, 0, 0, ?)
            "#,
        )
        .bind(&id)
        .bind(table_name)
        .bind(record_id)
        .bind(operation.as_str())
        .bind(priority.as_i32())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        debug!(
            item_id = %id,
            table = %table_name,
            record_id = %record_id,
            priority = priority.as_i32(),
            "Enqueued operation"
        );

        Ok(id)
    }

    /// Unsynced items by `(priority, timestamp, insertion)`. `limit` only truncates.
    pub async fn get_pending_operations(&self, limit: Option<usize>) -> Result<Vec<SyncQueueItem>> {
        let rows = query(
            r#"
            SELECT * FROM sync_queue
            WHERE synced = 0
            ORDER BY priority ASC, timestamp ASC, seq ASC
            LIMIT ?
            "#,
        )
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_item).collect()
    }

    /// Pull every backoff deadline to at most `now + cap`.
    ///
    /// Deadlines are wall-clock stamps; after the clock is set back they would
    /// otherwise hold retries until it catches up. Returns how many moved.
    pub async fn clamp_backoff(&self, now: i64) -> Result<u64> {
        let ceiling = now.saturating_add(self.policy.cap.as_millis() as i64);
        let result = query("UPDATE sync_queue SET next_retry = ? WHERE synced = 0 AND next_retry > ?")
            .bind(ceiling)
            .bind(ceiling)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            warn!(
                items = result.rows_affected(),
                "Clock moved backwards, clamped retry deadlines"
            );
        }
        Ok(result.rows_affected())
    }

    /// Pending items whose backoff window has passed at `now`.
    pub async fn get_ready_operations(
        &self,
        now: i64,
        limit: Option<usize>,
    ) -> Result<Vec<SyncQueueItem>> {
        self.clamp_backoff(now).await?;
        let rows = query(
            r#"
            SELECT * FROM sync_queue
            WHERE synced = 0 AND next_retry <= ?
            ORDER BY priority ASC, timestamp ASC, seq ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_item).collect()
    }

    /// Live items of one record, in drain order
    pub async fn items_for_record(
        &self,
        table_name: &str,
        record_id: &str,
    ) -> Result<Vec<SyncQueueItem>> {
        let rows = query(
            r#"
            SELECT * FROM sync_queue
            WHERE synced = 0 AND table_name = ? AND record_id = ?
            ORDER BY priority ASC, timestamp ASC, seq ASC
            "#,
        )
        .bind(table_name)
        .bind(record_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_item).collect()
    }

    /// Remove a delivered item. Unknown ids are ignored.
    pub async fn mark_as_synced(&self, id: &str) -> Result<()> {
        query("DELETE FROM sync_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove every live item of one record. Returns how many were removed.
    pub async fn remove_record(&self, table_name: &str, record_id: &str) -> Result<u64> {
        let result = query("DELETE FROM sync_queue WHERE synced = 0 AND table_name = ? AND record_id = ?")
            .bind(table_name)
            .bind(record_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Register a failed attempt, scheduling a retry or dead-lettering the item.
    ///
    /// # Errors
    ///
    /// `QueueItemNotFound` when no live item has this id.
    pub async fn record_failure(&self, id: &str, error: &str) -> Result<FailureOutcome> {
        let row = query("SELECT * FROM sync_queue WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| SyncError::QueueItemNotFound { id: id.to_string() })?;
        let item = decode_item(&row)?;

        let retry_count = item.retry_count.saturating_add(1);
        let now = self.clock.unix_timestamp_millis();

        if retry_count >= self.policy.max_retries {
            self.dead_letter(&item, retry_count, error, now).await?;
            return Ok(FailureOutcome::DeadLettered { retry_count });
        }

        let delay = self.policy.jittered_delay(retry_count);
        let next_retry = now.saturating_add(delay.as_millis() as i64);

        query("UPDATE sync_queue SET retry_count = ?, next_retry = ?, last_error = ? WHERE id = ?")
            .bind(i64::from(retry_count))
            .bind(next_retry)
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await?;

        debug!(
            item_id = %id,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            "Scheduled retry"
        );

        Ok(FailureOutcome::Retrying {
            retry_count,
            next_retry,
        })
    }

    async fn dead_letter(
        &self,
        item: &SyncQueueItem,
        retry_count: u32,
        error: &str,
        now: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        query(
            r#"
            INSERT INTO sync_error_log (queue_item_id, table_name, record_id, operation, retry_count, error, failed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&item.id)
        .bind(&item.table_name)
        .bind(&item.record_id)
        .bind(item.operation.as_str())
        .bind(i64::from(retry_count))
        .bind(error)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        query("DELETE FROM sync_queue WHERE id = ?")
            .bind(&item.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        warn!(
            item_id = %item.id,
            table = %item.table_name,
            record_id = %item.record_id,
            retry_count,
            error = %error,
            "Operation moved to error log"
        );

        if let Some(events) = &self.events {
            let _ = events.emit(CoreEvent::Queue(QueueEvent::DeadLettered {
                item_id: item.id.clone(),
                table_name: item.table_name.clone(),
                record_id: item.record_id.clone(),
                retry_count,
            }));
        }

        Ok(())
    }

    pub async fn queue_size(&self) -> Result<u64> {
        let count: i64 = query("SELECT COUNT(*) FROM sync_queue WHERE synced = 0")
            .fetch_one(&self.pool)
            .await?
            .try_get(0)?;
        Ok(count as u64)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let now = self.clock.unix_timestamp_millis();
        let row = query(
            r#"
            SELECT
                COUNT(*) AS pending,
                COALESCE(SUM(CASE WHEN next_retry <= ? THEN 1 ELSE 0 END), 0) AS ready
            FROM sync_queue
            WHERE synced = 0
            "#,
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let pending = row.try_get::<i64, _>("pending")? as u64;
        let ready = row.try_get::<i64, _>("ready")? as u64;

        Ok(QueueStats {
            pending,
            ready,
            waiting_retry: pending.saturating_sub(ready),
            dead_lettered: self.error_log.count().await?,
        })
    }

    pub async fn dead_letters(&self) -> Result<Vec<SyncErrorEntry>> {
        self.error_log.recent_errors(None).await
    }

    /// Drop the dead-letter log so the affected records upload again.
    pub async fn clear_dead_letters(&self) -> Result<u64> {
        self.error_log.clear().await
    }
}

fn sql_limit(limit: Option<usize>) -> i64 {
    limit.map(|l| l as i64).unwrap_or(-1)
}

fn decode_item(row: &SqliteRow) -> Result<SyncQueueItem> {
    let operation: String = row.try_get("operation")?;

    Ok(SyncQueueItem {
        id: row.try_get("id")?,
        table_name: row.try_get("table_name")?,
        record_id: row.try_get("record_id")?,
        operation: operation.parse()?,
        priority: row.try_get::<i64, _>("priority")? as i32,
        timestamp: row.try_get("timestamp")?,
        synced: row.try_get::<i64, _>("synced")? != 0,
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
        next_retry: row.try_get("next_retry")?,
        last_error: row.try_get("last_error")?,
    })
}
