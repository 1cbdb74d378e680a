//! User Notification Abstraction
//!
//! Notifications are a side channel. The engine asks for permission lazily,
//! the first time it has something to say, and treats every failure here as
//! non-fatal.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Host notification permission state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPermission {
    /// User has not been asked yet
    Default,
    Granted,
    Denied,
}

/// A passive notification shown to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    /// Notifications sharing a tag replace each other
    pub tag: Option<String>,
}

impl Notification {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            tag: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

/// Notification sink trait
///
/// # Platform Support
///
/// - **Desktop**: Log line or OS notification center
/// - **Mobile**: Local notifications
/// - **Web**: Notification API from the service worker
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Current permission state without prompting
    async fn permission(&self) -> Result<NotificationPermission>;

    /// Prompt the user if needed and return the resulting state
    async fn request_permission(&self) -> Result<NotificationPermission>;

    /// Show a notification
    async fn notify(&self, notification: Notification) -> Result<()>;
}
