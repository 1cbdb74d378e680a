//! Background Sync Registration and Lifecycle
//!
//! Provides platform-level wakeups for sync and app lifecycle transitions.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Conditions the platform should satisfy before waking the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskConstraints {
    /// Require WiFi connection
    pub requires_wifi: bool,
    /// Require any network connection
    pub requires_network: bool,
    /// Require device to be charging
    pub requires_charging: bool,
}

impl Default for TaskConstraints {
    fn default() -> Self {
        Self {
            requires_wifi: false,
            requires_network: true,
            requires_charging: false,
        }
    }
}

/// Platform background-sync registration
///
/// Abstracts OS/browser hooks that wake the app to sync:
/// - **Android**: WorkManager periodic work
/// - **iOS**: BGAppRefreshTask
/// - **Web**: Background Sync / Periodic Background Sync
/// - **Desktop**: usually unsupported, the engine falls back to its own timer
///
/// Registration is keyed by a tag. When the platform decides to run a tag it
/// is delivered through the [`WakeupStream`].
///
/// # Example
///
/// ```ignore
/// use bridge_traits::background::{BackgroundSyncRegistrar, TaskConstraints};
/// use std::time::Duration;
///
/// async fn register(registrar: &dyn BackgroundSyncRegistrar) -> Result<()> {
///     if registrar.is_supported().await {
///         registrar
///             .register("sync-data", Duration::from_secs(300), TaskConstraints::default())
///             .await?;
///     }
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait BackgroundSyncRegistrar: Send + Sync {
    /// Whether the platform offers background sync at all
    async fn is_supported(&self) -> bool;

    /// Register (or re-register) a sync tag
    ///
    /// # Arguments
    ///
    /// * `tag` - Identifier delivered back on wakeup
    /// * `min_interval` - Shortest interval the platform may honour
    /// * `constraints` - Execution constraints (network, charging, etc.)
    async fn register(
        &self,
        tag: &str,
        min_interval: Duration,
        constraints: TaskConstraints,
    ) -> Result<()>;

    /// Remove a registered tag. Unknown tags are not an error.
    async fn unregister(&self, tag: &str) -> Result<()>;

    /// Tags currently registered with the platform
    async fn get_tags(&self) -> Result<Vec<String>>;

    /// Subscribe to platform wakeups
    async fn subscribe_wakeups(&self) -> Result<Box<dyn WakeupStream>>;
}

/// Stream of platform wakeups, one item per tag the platform fired
#[async_trait]
pub trait WakeupStream: Send {
    /// Returns `None` when the stream is closed.
    async fn next(&mut self) -> Option<String>;
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Application window has focus
    Focused,
    /// Application is visible but not focused
    Visible,
    /// Application is hidden or in the background
    Hidden,
}

/// Lifecycle observer trait
///
/// Notifies the engine about focus and visibility transitions so it can sync
/// when the user comes back to the app.
///
/// # Platform Support
///
/// - **Mobile**: Activity/UIApplication lifecycle callbacks
/// - **Desktop**: Window focus events
/// - **Web**: Page Visibility API and window focus
#[async_trait]
pub trait LifecycleObserver: Send + Sync {
    /// Get current lifecycle state
    async fn get_state(&self) -> Result<LifecycleState>;

    /// Subscribe to lifecycle state changes
    async fn subscribe_changes(&self) -> Result<Box<dyn LifecycleChangeStream>>;
}

/// Stream of lifecycle state changes
#[async_trait]
pub trait LifecycleChangeStream: Send {
    /// Get the next lifecycle state update
    ///
    /// Returns `None` when the stream is closed.
    async fn next(&mut self) -> Option<LifecycleState>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use mockall::mock;

    mock! {
        Registrar {}

        #[async_trait]
        impl BackgroundSyncRegistrar for Registrar {
            async fn is_supported(&self) -> bool;
            async fn register(&self, tag: &str, min_interval: Duration, constraints: TaskConstraints) -> Result<()>;
            async fn unregister(&self, tag: &str) -> Result<()>;
            async fn get_tags(&self) -> Result<Vec<String>>;
            async fn subscribe_wakeups(&self) -> Result<Box<dyn WakeupStream>>;
        }
    }

    #[test]
    fn test_task_constraints() {
        let constraints = TaskConstraints {
            requires_wifi: true,
            ..Default::default()
        };

        assert!(constraints.requires_wifi);
        assert!(constraints.requires_network);
        assert!(!constraints.requires_charging);
    }

    #[tokio::test]
    async fn test_registrar_is_object_safe() {
        let mut registrar = MockRegistrar::new();
        registrar.expect_is_supported().returning(|| false);
        registrar
            .expect_get_tags()
            .returning(|| Err(BridgeError::NotAvailable("background sync".to_string())));

        let registrar: Box<dyn BackgroundSyncRegistrar> = Box::new(registrar);
        assert!(!registrar.is_supported().await);
        assert!(registrar.get_tags().await.is_err());
    }
}
