//! # Host Bridge Traits
//!
//! Platform abstraction traits the sync engine needs from its host.
//!
//! ## Overview
//!
//! The engine never talks to the operating system directly. Connectivity,
//! time, durable preferences, platform background-sync hooks and user
//! notifications are all reached through the traits in this crate, so that each
//! host (desktop, mobile shell, browser wrapper) can ship its own adapters and
//! tests can swap in deterministic fakes.
//!
//! ## Traits
//!
//! ### Connectivity
//! - [`NetworkMonitor`](network::NetworkMonitor) - Online/offline signal and connection quality
//!
//! ### Scheduling
//! - [`BackgroundSyncRegistrar`](background::BackgroundSyncRegistrar) - Platform background-sync registration
//! - [`LifecycleObserver`](background::LifecycleObserver) - Focus and visibility transitions
//!
//! ### Storage
//! - [`SettingsStore`](storage::SettingsStore) - Key-value preferences (last sync time, device id)
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Wall clock for persisted timestamps
//! - [`MonotonicClock`](time::MonotonicClock) - Monotonic time for cooldowns and backoff windows
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//! - [`NotificationSink`](notification::NotificationSink) - Best-effort user notifications
//!
//! ## Platform Requirements
//!
//! | Platform | Implementation Crate | Status |
//! |----------|---------------------|--------|
//! | Desktop  | `bridge-desktop`    | ✅ Available |
//! | Mobile   | Host-provided       | 📋 Planned |
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Adapters convert
//! platform failures into it with enough context to act on.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so adapters can be shared across
//! async tasks behind `Arc`.

pub mod background;
pub mod error;
pub mod network;
pub mod notification;
pub mod storage;
pub mod time;

pub use error::BridgeError;

pub use background::{
    BackgroundSyncRegistrar, LifecycleObserver, LifecycleState, TaskConstraints, WakeupStream,
};
pub use network::{EffectiveType, NetworkInfo, NetworkMonitor, NetworkStatus, NetworkType};
pub use notification::{Notification, NotificationPermission, NotificationSink};
pub use storage::SettingsStore;
pub use time::{
    Clock, LogEntry, LogLevel, LoggerSink, ManualClock, ManualMonotonicClock, MonotonicClock,
    SystemClock, SystemMonotonicClock,
};
