//! Sync/diff job error types.

use thiserror::Error;

/// Synchronization and diff job errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another job of the same kind is already running.
    #[error("job already running: {0}")]
    Conflict(String),

    #[error(transparent)]
    Offer(#[from] bobine_offer::OfferError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("report serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for sync/diff operations.
pub type SyncResult<T> = std::result::Result<T, SyncError>;
