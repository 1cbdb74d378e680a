//! Log-backed notification sink

use async_trait::async_trait;
use bridge_traits::{
    error::Result,
    notification::{Notification, NotificationPermission, NotificationSink},
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, info};

/// Notification sink that writes notifications to the tracing log.
///
/// Used on headless desktops and in development. Permission is granted on the
/// first request.
#[derive(Debug, Default)]
pub struct LogNotifier {
    granted: AtomicBool,
    delivered: AtomicUsize,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of notifications written so far
    pub fn delivered_count(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn permission(&self) -> Result<NotificationPermission> {
        if self.granted.load(Ordering::SeqCst) {
            Ok(NotificationPermission::Granted)
        } else {
            Ok(NotificationPermission::Default)
        }
    }

    async fn request_permission(&self) -> Result<NotificationPermission> {
        self.granted.store(true, Ordering::SeqCst);
        debug!("Notification permission granted");
        Ok(NotificationPermission::Granted)
    }

    async fn notify(&self, notification: Notification) -> Result<()> {
        info!(
            title = %notification.title,
            tag = ?notification.tag,
            "{}",
            notification.body
        );
        self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
