//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid container name: {0}")]
    InvalidContainer(String),

    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("invalid tape state transition: {from} -> {to}")]
    InvalidTapeTransition { from: String, to: String },

    #[error("invalid access request id: {0}")]
    InvalidAccessRequestId(String),

    #[error("invalid location: {0}")]
    InvalidLocation(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
