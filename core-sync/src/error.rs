use crate::remote::RemoteError;
use bridge_traits::error::BridgeError;
use core_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Invalid input: {field} - {message}")]
    InvalidInput { field: String, message: String },

    #[error("Queue item {id} not found")]
    QueueItemNotFound { id: String },

    #[error("Sync already in progress")]
    SyncInProgress,

    #[error("Sync paused after repeated failures")]
    CircuitOpen,

    #[error("No internet connection")]
    Offline,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Remote store rejected the request: {0}")]
    Rejected(String),

    #[error("Remote call timed out after {0} seconds")]
    Timeout(u64),

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] core_runtime::Error),

    #[error("Local store error: {0}")]
    Store(#[from] StoreError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),
}

impl SyncError {
    /// Whether a later attempt may succeed without intervention
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_)
                | SyncError::Timeout(_)
                | SyncError::Offline
                | SyncError::SyncInProgress
                | SyncError::CircuitOpen
                | SyncError::Database(_)
        )
    }

    pub(crate) fn invalid_input(field: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::InvalidInput {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<RemoteError> for SyncError {
    fn from(error: RemoteError) -> Self {
        if error.is_transient() {
            SyncError::Transport(error.to_string())
        } else {
            SyncError::Rejected(error.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
