//! Core domain types and shared logic for the bobine storage offer.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Container naming and write policy
//! - Object digests and incremental hashing
//! - Object / archive storage locations
//! - Tape catalog states and transitions
//! - Access request statuses and identifiers
//! - Offer log entries
//! - Configuration types

pub mod access;
pub mod config;
pub mod container;
pub mod digest;
pub mod error;
pub mod location;
pub mod offer_log;
pub mod tape;

pub use access::{check_access_request_id, new_access_request_id, AccessRequestStatus};
pub use container::ContainerAddress;
pub use digest::{DigestAlgorithm, Hasher, ObjectDigest};
pub use error::{Error, Result};
pub use location::{ArchiveLocation, ObjectLocation, TarEntryDescription};
pub use offer_log::{LogOrder, OfferLogAction, OfferLogEntry};
pub use tape::{TapeLocation, TapeState};

/// Generate a unique storage id for an object write.
///
/// Each write gets a fresh storage id; concurrent overwrites of the same
/// object settle by comparing storage ids (last writer wins in the
/// referential, stale tar entries become garbage).
pub fn new_storage_id(object_id: &str) -> String {
    format!("{}-{}", object_id, uuid::Uuid::new_v4())
}

/// Generate a unique tar archive id for a file bucket.
///
/// The id doubles as the tar file name: `{date}-{uuid}.tar`.
pub fn new_tar_id(now: time::OffsetDateTime) -> String {
    format!(
        "{:04}{:02}{:02}-{}.tar",
        now.year(),
        u8::from(now.month()),
        now.day(),
        uuid::Uuid::new_v4()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_ids_are_unique_per_write() {
        let a = new_storage_id("obj");
        let b = new_storage_id("obj");
        assert_ne!(a, b);
        assert!(a.starts_with("obj-"));
    }

    #[test]
    fn tar_id_carries_date_and_extension() {
        let now = time::macros::datetime!(2026-08-06 12:00 UTC);
        let id = new_tar_id(now);
        assert!(id.starts_with("20260806-"));
        assert!(id.ends_with(".tar"));
    }
}
