//! Lightweight local-store integrity probe
//!
//! Runs `PRAGMA quick_check`, compares table counts with the rows actually
//! readable, and decodes a sample of records. A failing probe means the local
//! copy should be rebuilt from the remote store.

use crate::error::Result;
use crate::models::TableKind;
use crate::repositories::record::decode_row;
use serde::Serialize;
use sqlx::{query, Row, SqlitePool};
use tracing::{debug, warn};

const DEFAULT_SAMPLE_SIZE: i64 = 500;

/// Outcome of an integrity probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    /// Messages returned by `PRAGMA quick_check` (`["ok"]` when healthy)
    pub quick_check: Vec<String>,
    /// `COUNT(*)` of the records table
    pub record_count: i64,
    /// Rows the count query reported but a full scan could not read
    pub unreadable_rows: i64,
    /// `table/id` of sampled records whose metadata failed to decode
    pub undecodable: Vec<String>,
    /// Rows whose table name is not a synchronized table
    pub unknown_tables: Vec<String>,
}

impl IntegrityReport {
    pub fn is_healthy(&self) -> bool {
        self.quick_check.len() == 1
            && self.quick_check[0].eq_ignore_ascii_case("ok")
            && self.unreadable_rows == 0
            && self.undecodable.is_empty()
            && self.unknown_tables.is_empty()
    }
}

pub struct IntegrityProbe {
    pool: SqlitePool,
    sample_size: i64,
}

impl IntegrityProbe {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            sample_size: DEFAULT_SAMPLE_SIZE,
        }
    }

    /// Limit how many records are decoded per run
    pub fn with_sample_size(mut self, sample_size: i64) -> Self {
        self.sample_size = sample_size.max(1);
        self
    }

    /// Run the probe.
    ///
    /// # Errors
    ///
    /// Only fails when the database cannot be queried at all; detected damage
    /// is reported through [`IntegrityReport`].
    pub async fn run(&self) -> Result<IntegrityReport> {
        let quick_check: Vec<String> = query("PRAGMA quick_check")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| row.try_get::<String, _>(0))
            .collect::<std::result::Result<_, _>>()?;

        let record_count: i64 = query("SELECT COUNT(*) FROM records")
            .fetch_one(&self.pool)
            .await?
            .try_get(0)?;

        // Full scan, so unreadable pages surface even when the count comes from an index
        let scanned = query("SELECT table_name, id FROM records")
            .fetch_all(&self.pool)
            .await?
            .len() as i64;

        let unknown_tables: Vec<String> = query("SELECT DISTINCT table_name FROM records")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .filter_map(|row| row.try_get::<String, _>(0).ok())
            .filter(|name| TableKind::parse(name).is_none())
            .collect();

        let sample = query("SELECT * FROM records ORDER BY updated_at DESC LIMIT ?")
            .bind(self.sample_size)
            .fetch_all(&self.pool)
            .await?;

        let mut undecodable = Vec::new();
        for row in &sample {
            if let Err(e) = decode_row(row) {
                let table: String = row.try_get("table_name").unwrap_or_default();
                let id: String = row.try_get("id").unwrap_or_default();
                warn!(table = %table, record_id = %id, error = %e, "Undecodable record");
                undecodable.push(format!("{}/{}", table, id));
            }
        }

        let report = IntegrityReport {
            quick_check,
            record_count,
            unreadable_rows: (record_count - scanned).abs(),
            undecodable,
            unknown_tables,
        };

        debug!(healthy = report.is_healthy(), records = record_count, "Integrity probe finished");
        Ok(report)
    }
}
