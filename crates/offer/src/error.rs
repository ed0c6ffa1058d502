//! Offer engine error types.

use thiserror::Error;

/// Offer operation errors.
///
/// `NotFound`, `AlreadyExists` and `Conflict` are terminal and surfaced to
/// the caller. `CapacityExceeded` is retried with backoff by staging
/// callers. `UnavailableFromAsyncOffer` is not an error per se: it signals
/// that the caller must create an access request before reading.
#[derive(Debug, Error)]
pub enum OfferError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("cache capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("unavailable from async offer: {0}")]
    UnavailableFromAsyncOffer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("referential error: {0}")]
    Referential(#[from] bobine_referential::ReferentialError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] bobine_core::Error),

    #[error("technical error: {0}")]
    Technical(String),
}

impl OfferError {
    /// Whether a drive/stage retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OfferError::CapacityExceeded(_) | OfferError::Io(_) | OfferError::Technical(_)
        )
    }
}

/// Result type for offer operations.
pub type OfferResult<T> = std::result::Result<T, OfferError>;
