//! Record repository trait and implementation

use crate::error::{Result, StoreError};
use crate::models::{CrdtRecord, FieldMap, FieldVersion, Record, TableKind, VersionVector};
use async_trait::async_trait;
use sqlx::{query, sqlite::SqliteRow, Row, SqlitePool};
use std::collections::BTreeMap;

/// Record repository interface for data access operations
#[async_trait]
pub trait RecordRepository: Send + Sync {
    /// Find a record by table and id
    ///
    /// # Returns
    /// - `Ok(Some(record))` if found
    /// - `Ok(None)` if not found
    async fn find(&self, table: TableKind, id: &str) -> Result<Option<CrdtRecord>>;

    /// Insert or replace a record with its metadata
    ///
    /// # Errors
    /// Returns error if the record metadata is inconsistent or the write fails
    async fn upsert(&self, table: TableKind, record: &CrdtRecord) -> Result<()>;

    /// Delete a record
    ///
    /// # Returns
    /// - `Ok(true)` if the record was deleted
    /// - `Ok(false)` if it did not exist
    async fn delete(&self, table: TableKind, id: &str) -> Result<bool>;

    /// All records of a table, ordered by id
    async fn list(&self, table: TableKind) -> Result<Vec<CrdtRecord>>;

    /// Count records of a table
    async fn count(&self, table: TableKind) -> Result<i64>;

    /// Flag a record as matching the remote copy
    ///
    /// # Errors
    /// Returns `NotFound` if the record does not exist
    async fn mark_synced(&self, table: TableKind, id: &str) -> Result<()>;

    /// Remove every record of every table, returning the number removed
    async fn clear(&self) -> Result<u64>;
}

/// SQLite implementation of RecordRepository
///
/// All tables share the `records` table; the JSON columns hold the field map,
/// the version vector and the per-field versions.
#[derive(Clone)]
pub struct SqliteRecordRepository {
    pool: SqlitePool,
}

impl SqliteRecordRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a typed record, keeping any existing sync metadata.
    pub async fn save_record(&self, record: &Record, updated_at: i64) -> Result<CrdtRecord> {
        let table = record.table();
        let fresh = CrdtRecord::from_record(record)?;

        let mut stored = self
            .find(table, record.id())
            .await?
            .unwrap_or_else(|| CrdtRecord::new(record.id()));
        stored.fields = fresh.fields;
        stored.synced = false;
        stored.updated_at = updated_at;

        self.upsert(table, &stored).await?;
        Ok(stored)
    }

    /// Load and decode a typed record.
    pub async fn find_record(&self, table: TableKind, id: &str) -> Result<Option<Record>> {
        match self.find(table, id).await? {
            Some(record) => Ok(Some(record.to_record(table)?)),
            None => Ok(None),
        }
    }
}

pub(crate) fn decode_row(row: &SqliteRow) -> Result<CrdtRecord> {
    let fields: String = row.try_get("fields")?;
    let version_vector: String = row.try_get("version_vector")?;
    let field_versions: String = row.try_get("field_versions")?;

    Ok(CrdtRecord {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        fields: serde_json::from_str::<FieldMap>(&fields)?,
        version_vector: serde_json::from_str::<VersionVector>(&version_vector)?,
        field_versions: serde_json::from_str::<BTreeMap<String, FieldVersion>>(&field_versions)?,
        synced: row.try_get::<i64, _>("synced")? != 0,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl RecordRepository for SqliteRecordRepository {
    async fn find(&self, table: TableKind, id: &str) -> Result<Option<CrdtRecord>> {
        let row = query("SELECT * FROM records WHERE table_name = ? AND id = ?")
            .bind(table.as_str())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(decode_row).transpose()
    }

    async fn upsert(&self, table: TableKind, record: &CrdtRecord) -> Result<()> {
        record.validate().map_err(|e| StoreError::InvalidInput {
            field: table.to_string(),
            message: e,
        })?;

        query(
            r#"
            INSERT INTO records (
                table_name, id, tenant_id, fields, version_vector, field_versions,
                synced, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(table_name, id) DO UPDATE SET
                tenant_id = excluded.tenant_id,
                fields = excluded.fields,
                version_vector = excluded.version_vector,
                field_versions = excluded.field_versions,
                synced = excluded.synced,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(table.as_str())
        .bind(&record.id)
        .bind(&record.tenant_id)
        .bind(serde_json::to_string(&record.fields)?)
        .bind(serde_json::to_string(&record.version_vector)?)
        .bind(serde_json::to_string(&record.field_versions)?)
        .bind(record.synced as i64)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, table: TableKind, id: &str) -> Result<bool> {
        let result = query("DELETE FROM records WHERE table_name = ? AND id = ?")
            .bind(table.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, table: TableKind) -> Result<Vec<CrdtRecord>> {
        let rows = query("SELECT * FROM records WHERE table_name = ? ORDER BY id")
            .bind(table.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(decode_row).collect()
    }

    async fn count(&self, table: TableKind) -> Result<i64> {
        let count: i64 = query("SELECT COUNT(*) FROM records WHERE table_name = ?")
            .bind(table.as_str())
            .fetch_one(&self.pool)
            .await?
            .try_get(0)?;

        Ok(count)
    }

    async fn mark_synced(&self, table: TableKind, id: &str) -> Result<()> {
        let result = query("UPDATE records SET synced = 1 WHERE table_name = ? AND id = ?")
            .bind(table.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity_type: table.to_string(),
                id: id.to_string(),
            });
        }

        Ok(())
    }

    async fn clear(&self) -> Result<u64> {
        let result = query("DELETE FROM records").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use crate::models::Cliente;
    use serde_json::json;

    async fn setup() -> SqliteRecordRepository {
        let pool = create_test_pool().await.unwrap();
        SqliteRecordRepository::new(pool)
    }

    fn cliente(id: &str, nombre: &str) -> Record {
        Record::Cliente(Cliente {
            id: id.to_string(),
            nombre: nombre.to_string(),
            documento: "1020304050".to_string(),
            telefono: Some("3001234567".to_string()),
            direccion: None,
            email: None,
        })
    }

    #[tokio::test]
    async fn test_upsert_and_find() {
        let repo = setup().await;

        let mut record = CrdtRecord::new("cl-1");
        record.fields.insert("nombre".to_string(), json!("Ana"));
        record.version_vector.insert("d1".to_string(), 2);
        record.field_versions.insert(
            "nombre".to_string(),
            FieldVersion {
                value: json!("Ana"),
                timestamp: 100,
                device_id: "d1".to_string(),
            },
        );
        record.updated_at = 100;

        repo.upsert(TableKind::Clientes, &record).await.unwrap();

        let found = repo.find(TableKind::Clientes, "cl-1").await.unwrap();
        assert_eq!(found, Some(record));

        // Same id in another table is a different row
        assert!(repo.find(TableKind::Creditos, "cl-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_rejects_orphan_field_version() {
        let repo = setup().await;

        let mut record = CrdtRecord::new("cl-1");
        record.field_versions.insert(
            "nombre".to_string(),
            FieldVersion {
                value: json!("Ana"),
                timestamp: 1,
                device_id: "d1".to_string(),
            },
        );

        let result = repo.upsert(TableKind::Clientes, &record).await;
        assert!(matches!(result, Err(StoreError::InvalidInput { .. })));
    }

    #[tokio::test]
    async fn test_save_record_keeps_metadata() {
        let repo = setup().await;

        let mut record = CrdtRecord::from_record(&cliente("cl-1", "Ana")).unwrap();
        record.version_vector.insert("d1".to_string(), 3);
        record.synced = true;
        repo.upsert(TableKind::Clientes, &record).await.unwrap();

        let saved = repo.save_record(&cliente("cl-1", "Ana María"), 500).await.unwrap();
        assert_eq!(saved.version_vector.get("d1"), Some(&3));
        assert!(!saved.synced);

        let typed = repo
            .find_record(TableKind::Clientes, "cl-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(typed, cliente("cl-1", "Ana María"));
    }

    #[tokio::test]
    async fn test_delete_and_count() {
        let repo = setup().await;
        repo.save_record(&cliente("cl-1", "Ana"), 1).await.unwrap();
        repo.save_record(&cliente("cl-2", "Luis"), 2).await.unwrap();

        assert_eq!(repo.count(TableKind::Clientes).await.unwrap(), 2);
        assert!(repo.delete(TableKind::Clientes, "cl-1").await.unwrap());
        assert!(!repo.delete(TableKind::Clientes, "cl-1").await.unwrap());

        let remaining = repo.list(TableKind::Clientes).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "cl-2");
    }

    #[tokio::test]
    async fn test_mark_synced_missing_record() {
        let repo = setup().await;

        let result = repo.mark_synced(TableKind::Pagos, "nope").await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));

        repo.save_record(&cliente("cl-1", "Ana"), 1).await.unwrap();
        repo.mark_synced(TableKind::Clientes, "cl-1").await.unwrap();
        assert!(
            repo.find(TableKind::Clientes, "cl-1")
                .await
                .unwrap()
                .unwrap()
                .synced
        );
    }

    #[tokio::test]
    async fn test_clear() {
        let repo = setup().await;
        repo.save_record(&cliente("cl-1", "Ana"), 1).await.unwrap();
        repo.save_record(&cliente("cl-2", "Luis"), 2).await.unwrap();

        assert_eq!(repo.clear().await.unwrap(), 2);
        assert_eq!(repo.count(TableKind::Clientes).await.unwrap(), 0);
    }
}
