//! # Remote Store
//!
//! The engine treats the server as an opaque record store reached through
//! [`RemoteStore`]. Transport, authentication and wire format belong to the
//! host's implementation.
//!
//! [`InMemoryRemoteStore`] keeps everything in process. It resolves incoming
//! records against its own copy with the same merge rules the client uses,
//! which makes it a faithful stand-in for tests and offline diagnostics.

use crate::conflict_resolver::resolve_conflict;
use async_trait::async_trait;
use bridge_traits::time::Clock;
use core_store::{CrdtRecord, TableKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    #[error("Remote call timed out")]
    Timeout,

    #[error("Remote store rejected {table}: {message}")]
    Rejected { table: String, message: String },
}

impl RemoteError {
    /// Whether retrying the same request later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Unavailable(_) | RemoteError::Timeout)
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// One change reported by the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteChange {
    Upserted(CrdtRecord),
    Deleted { record_id: String },
}

impl RemoteChange {
    pub fn record_id(&self) -> &str {
        match self {
            RemoteChange::Upserted(record) => &record.id,
            RemoteChange::Deleted { record_id } => record_id,
        }
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create or merge records of one table
    async fn upsert_batch(&self, table: &str, records: &[CrdtRecord]) -> RemoteResult<()>;

    /// Delete a record. Unknown records are not an error.
    async fn delete(&self, table: &str, record_id: &str) -> RemoteResult<()>;

    /// Changes recorded at or after `since` (unix millis)
    async fn fetch_changes_since(&self, table: &str, since: i64) -> RemoteResult<Vec<RemoteChange>>;

    /// Every live record of a table
    async fn fetch_all(&self, table: &str) -> RemoteResult<Vec<CrdtRecord>>;
}

struct Entry {
    record: Option<CrdtRecord>,
    changed_at: i64,
}

#[derive(Default)]
struct State {
    tables: BTreeMap<TableKind, BTreeMap<String, Entry>>,
    offline: bool,
    scripted_failures: VecDeque<RemoteError>,
    upsert_calls: usize,
}

/// Process-local [`RemoteStore`]
#[derive(Clone)]
pub struct InMemoryRemoteStore {
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<State>>,
}

impl InMemoryRemoteStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// While offline every call fails with [`RemoteError::Unavailable`]
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Make the next call fail with `error`. Queued failures are consumed in order.
    pub fn fail_next(&self, error: RemoteError) {
        self.lock().scripted_failures.push_back(error);
    }

    /// Write a record as if another device had uploaded it.
    pub fn put(&self, table: TableKind, record: CrdtRecord) {
        let changed_at = self.clock.unix_timestamp_millis();
        self.lock().tables.entry(table).or_default().insert(
            record.id.clone(),
            Entry {
                record: Some(record),
                changed_at,
            },
        );
    }

    pub fn get(&self, table: TableKind, record_id: &str) -> Option<CrdtRecord> {
        self.lock()
            .tables
            .get(&table)
            .and_then(|records| records.get(record_id))
            .and_then(|entry| entry.record.clone())
    }

    pub fn len(&self, table: TableKind) -> usize {
        self.lock()
            .tables
            .get(&table)
            .map(|records| records.values().filter(|e| e.record.is_some()).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        TableKind::ALL.iter().all(|table| self.len(*table) == 0)
    }

    pub fn upsert_calls(&self) -> usize {
        self.lock().upsert_calls
    }

    fn check(&self, table: &str) -> RemoteResult<TableKind> {
        let mut state = self.lock();
        if state.offline {
            return Err(RemoteError::Unavailable("remote store is offline".to_string()));
        }
        if let Some(error) = state.scripted_failures.pop_front() {
            return Err(error);
        }
        TableKind::parse(table).ok_or_else(|| RemoteError::Rejected {
            table: table.to_string(),
            message: "unknown table".to_string(),
        })
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn upsert_batch(&self, table: &str, records: &[CrdtRecord]) -> RemoteResult<()> {
        let kind = self.check(table)?;
        let now = self.clock.unix_timestamp_millis();

        let mut state = self.lock();
        state.upsert_calls += 1;
        let stored = state.tables.entry(kind).or_default();

        for incoming in records {
            let merged = match stored.get(&incoming.id).and_then(|e| e.record.as_ref()) {
                Some(existing) => {
                    resolve_conflict(existing, incoming, kind.conflict_kind()).resolved
                }
                None => incoming.clone(),
            };
            stored.insert(
                incoming.id.clone(),
                Entry {
                    record: Some(CrdtRecord {
                        synced: true,
                        ..merged
                    }),
                    changed_at: now,
                },
            );
        }

        debug!(table = %table, count = records.len(), "Remote upsert");
        Ok(())
    }

    async fn delete(&self, table: &str, record_id: &str) -> RemoteResult<()> {
        let kind = self.check(table)?;
        let now = self.clock.unix_timestamp_millis();

        self.lock().tables.entry(kind).or_default().insert(
            record_id.to_string(),
            Entry {
                record: None,
                changed_at: now,
            },
        );
        Ok(())
    }

    async fn fetch_changes_since(&self, table: &str, since: i64) -> RemoteResult<Vec<RemoteChange>> {
        let kind = self.check(table)?;
        let state = self.lock();

        let mut changes: Vec<(i64, RemoteChange)> = state
            .tables
            .get(&kind)
            .into_iter()
            .flatten()
            .filter(|(_, entry)| entry.changed_at >= since)
            .map(|(id, entry)| {
                let change = match &entry.record {
                    Some(record) => RemoteChange::Upserted(record.clone()),
                    None => RemoteChange::Deleted {
                        record_id: id.clone(),
                    },
                };
                (entry.changed_at, change)
            })
            .collect();
        changes.sort_by_key(|(changed_at, _)| *changed_at);

        Ok(changes.into_iter().map(|(_, change)| change).collect())
    }

    async fn fetch_all(&self, table: &str) -> RemoteResult<Vec<CrdtRecord>> {
        let kind = self.check(table)?;
        let state = self.lock();

        Ok(state
            .tables
            .get(&kind)
            .into_iter()
            .flatten()
            .filter_map(|(_, entry)| entry.record.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::time::ManualClock;
    use serde_json::json;

    fn store() -> (InMemoryRemoteStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        (InMemoryRemoteStore::new(clock.clone()), clock)
    }

    fn cliente(id: &str, nombre: &str) -> CrdtRecord {
        let mut record = CrdtRecord::new(id);
        record.fields.insert("nombre".to_string(), json!(nombre));
        record.version_vector.insert("d1".to_string(), 1);
        record
    }

    #[tokio::test]
    async fn test_changes_since_includes_deletes() {
        let (remote, clock) = store();
        remote.upsert_batch("clientes", &[cliente("cl-1", "Ana")]).await.unwrap();

        clock.set_millis(2_000);
        remote.delete("clientes", "cl-1").await.unwrap();
        remote.upsert_batch("clientes", &[cliente("cl-2", "Luis")]).await.unwrap();

        let changes = remote.fetch_changes_since("clientes", 1_500).await.unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes
            .iter()
            .any(|c| matches!(c, RemoteChange::Deleted { record_id } if record_id == "cl-1")));
        assert_eq!(remote.fetch_all("clientes").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_table_is_rejected() {
        let (remote, _) = store();
        let err = remote.upsert_batch("gastos", &[]).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_scripted_failures_are_consumed() {
        let (remote, _) = store();
        remote.fail_next(RemoteError::Timeout);

        assert_eq!(
            remote.fetch_all("pagos").await.unwrap_err(),
            RemoteError::Timeout
        );
        assert!(remote.fetch_all("pagos").await.is_ok());
    }

    #[tokio::test]
    async fn test_upsert_merges_with_stored_copy() {
        let (remote, _) = store();
        let mut newer = cliente("cl-1", "Ana Maria");
        newer.version_vector.insert("d1".to_string(), 2);

        remote.upsert_batch("clientes", &[newer.clone()]).await.unwrap();
        remote.upsert_batch("clientes", &[cliente("cl-1", "Ana")]).await.unwrap();

        let stored = remote.get(TableKind::Clientes, "cl-1").unwrap();
        assert_eq!(stored.fields["nombre"], json!("Ana Maria"));
        assert!(stored.synced);
    }
}
