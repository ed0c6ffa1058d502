//! Referential store error types.

use thiserror::Error;

/// Referential operation errors.
#[derive(Debug, Error)]
pub enum ReferentialError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt referential entry: {0}")]
    Corrupt(String),
}

impl From<serde_json::Error> for ReferentialError {
    fn from(e: serde_json::Error) -> Self {
        ReferentialError::Corrupt(e.to_string())
    }
}

impl From<bobine_core::Error> for ReferentialError {
    fn from(e: bobine_core::Error) -> Self {
        ReferentialError::Corrupt(e.to_string())
    }
}

/// Result type for referential operations.
pub type ReferentialResult<T> = std::result::Result<T, ReferentialError>;
