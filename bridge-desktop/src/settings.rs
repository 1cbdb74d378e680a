//! Settings kept in the engine's SQLite database

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    storage::SettingsStore,
};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::{debug, warn};

const KIND_STRING: &str = "string";
const KIND_I64: &str = "i64";

/// Settings rows tagged with the type they were written as.
///
/// Shares the engine's pool; reading a key back as another type fails.
pub struct SqliteSettingsStore {
    pool: SqlitePool,
}

fn db_err(action: &str, e: sqlx::Error) -> BridgeError {
    BridgeError::OperationFailed(format!("settings {}: {}", action, e))
}

impl SqliteSettingsStore {
    /// Wrap an existing pool, creating the `settings` table if the
    /// migrations have not run on it.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                value_type TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| db_err("schema", e))?;

        Ok(Self { pool })
    }

    /// Single-connection in-memory store; each `sqlite::memory:` connection
    /// is its own database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| db_err("connect", e))?;
        Self::with_pool(pool).await
    }

    async fn write(&self, key: &str, value: String, kind: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value, value_type, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                value_type = excluded.value_type,
                updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(kind)
        .bind(core_async::time::now_secs())
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("write", e))?;

        debug!(key, kind, "Setting stored");
        Ok(())
    }

    async fn read(&self, key: &str, kind: &str) -> Result<Option<String>> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT value, value_type FROM settings WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| db_err("read", e))?;

        match row {
            Some((_, stored)) if stored != kind => {
                warn!(key, expected = kind, stored = %stored, "Setting has another type");
                Err(BridgeError::OperationFailed(format!(
                    "setting {} is {}, not {}",
                    key, stored, kind
                )))
            }
            Some((value, _)) => Ok(Some(value)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SettingsStore for SqliteSettingsStore {
    async fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.write(key, value.to_string(), KIND_STRING).await
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        self.read(key, KIND_STRING).await
    }

    async fn set_i64(&self, key: &str, value: i64) -> Result<()> {
        self.write(key, value.to_string(), KIND_I64).await
    }

    async fn get_i64(&self, key: &str) -> Result<Option<i64>> {
        self.read(key, KIND_I64)
            .await?
            .map(|raw| {
                raw.parse::<i64>().map_err(|e| {
                    BridgeError::OperationFailed(format!("setting {} is corrupt: {}", key, e))
                })
            })
            .transpose()
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM settings WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("delete", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_device_id_round_trips_and_deletes() {
        let store = SqliteSettingsStore::in_memory().await.unwrap();

        store.set_string("device_id", "tablet-7").await.unwrap();
        assert_eq!(
            store.get_string("device_id").await.unwrap().as_deref(),
            Some("tablet-7")
        );

        store.delete("device_id").await.unwrap();
        store.delete("device_id").await.unwrap();
        assert_eq!(store.get_string("device_id").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_last_sync_timestamp_overwrites() {
        let store = SqliteSettingsStore::in_memory().await.unwrap();
        assert_eq!(store.get_i64("last_sync_timestamp").await.unwrap(), None);

        store.set_i64("last_sync_timestamp", 1_700_000_000_000).await.unwrap();
        store.set_i64("last_sync_timestamp", 1_700_000_500_000).await.unwrap();
        assert_eq!(
            store.get_i64("last_sync_timestamp").await.unwrap(),
            Some(1_700_000_500_000)
        );
    }

    #[tokio::test]
    async fn test_reading_with_another_type_fails() {
        let store = SqliteSettingsStore::in_memory().await.unwrap();

        store.set_string("last_sync_timestamp", "soon").await.unwrap();
        assert!(store.get_i64("last_sync_timestamp").await.is_err());
    }
}
