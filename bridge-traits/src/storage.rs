//! Durable Settings Abstraction

use async_trait::async_trait;

use crate::error::Result;

/// Key-value settings storage
///
/// Small durable preferences the engine keeps between runs, such as the last
/// successful sync timestamp and the device identifier.
///
/// # Platform Support
///
/// - **Desktop**: SQLite table (see `bridge-desktop`)
/// - **Mobile**: UserDefaults / SharedPreferences
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::SettingsStore;
///
/// async fn remember_sync(store: &dyn SettingsStore, at: i64) -> Result<()> {
///     store.set_i64("sync.last_sync_timestamp", at).await
/// }
/// ```
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn set_string(&self, key: &str, value: &str) -> Result<()>;

    async fn get_string(&self, key: &str) -> Result<Option<String>>;

    async fn set_i64(&self, key: &str, value: i64) -> Result<()>;

    /// Errors when the key holds a value of another type.
    async fn get_i64(&self, key: &str) -> Result<Option<i64>>;

    /// Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}
