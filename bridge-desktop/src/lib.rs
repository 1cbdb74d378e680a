//! # Desktop Bridge Implementations
//!
//! Default implementations of the bridge traits for desktop hosts
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `NetworkMonitor` using a cached TCP reachability probe
//! - `SettingsStore` using a SQLite key-value table
//! - `LifecycleObserver` fed by the host window layer
//! - `NotificationSink` that writes notifications to the log
//!
//! Desktop has no platform background-sync service, so no
//! `BackgroundSyncRegistrar` is provided here; the engine's polling fallback
//! covers it.
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{DesktopNetworkMonitor, SqliteSettingsStore};
//!
//! #[tokio::main]
//! async fn main() {
//!     let network = DesktopNetworkMonitor::new();
//!     let settings = SqliteSettingsStore::with_pool(pool.clone()).await?;
//!     // Hand both to the orchestrator
//! }
//! ```

mod lifecycle;
mod network;
mod notifier;
mod settings;

pub use lifecycle::DesktopLifecycleObserver;
pub use network::DesktopNetworkMonitor;
pub use notifier::LogNotifier;
pub use settings::SqliteSettingsStore;
