//! Database models mapping to the referential schema.
//!
//! Location and id-list columns are stored as JSON text; the typed accessors
//! below decode them into the core model.

use bobine_core::{
    ArchiveLocation, DigestAlgorithm, ObjectDigest, ObjectLocation, TapeLocation, TapeState,
};
use sqlx::FromRow;
use time::OffsetDateTime;

use crate::error::{ReferentialError, ReferentialResult};

/// Object referential record, keyed by (container, object_id).
#[derive(Debug, Clone, FromRow)]
pub struct ObjectRow {
    pub container: String,
    pub object_id: String,
    /// Unique per write; settles concurrent overwrite races.
    pub storage_id: String,
    pub size: i64,
    pub digest_algorithm: String,
    pub digest: String,
    /// JSON-encoded [`ObjectLocation`].
    pub location: String,
    pub version: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ObjectRow {
    pub fn location(&self) -> ReferentialResult<ObjectLocation> {
        Ok(serde_json::from_str(&self.location)?)
    }

    pub fn digest(&self) -> ReferentialResult<ObjectDigest> {
        let algorithm = DigestAlgorithm::parse(&self.digest_algorithm)?;
        Ok(ObjectDigest::from_hex(algorithm, self.digest.clone())?)
    }
}

/// Archive (tar) referential record, keyed by tar_id.
#[derive(Debug, Clone, FromRow)]
pub struct ArchiveRow {
    pub tar_id: String,
    pub file_bucket: String,
    /// Total file size; known once the tar is sealed.
    pub size: Option<i64>,
    /// JSON-encoded [`ArchiveLocation`].
    pub location: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ArchiveRow {
    pub fn location(&self) -> ReferentialResult<ArchiveLocation> {
        Ok(serde_json::from_str(&self.location)?)
    }
}

/// Tape catalog record, keyed by tape_code.
#[derive(Debug, Clone, FromRow)]
pub struct TapeRow {
    pub tape_code: String,
    pub bucket: String,
    pub state: String,
    /// JSON-encoded [`TapeLocation`].
    pub location: String,
    /// Library slot the tape is returned to after unmount.
    pub home_slot: i64,
    pub label_written: bool,
    pub capacity: i64,
    pub written_bytes: i64,
    /// Next tape file position for an appended archive.
    pub file_position: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl TapeRow {
    pub fn state(&self) -> ReferentialResult<TapeState> {
        Ok(TapeState::parse(&self.state)?)
    }

    pub fn location(&self) -> ReferentialResult<TapeLocation> {
        Ok(serde_json::from_str(&self.location)?)
    }

    pub fn remaining_capacity(&self) -> i64 {
        self.capacity - self.written_bytes
    }
}

/// Access request record, keyed by request_id.
///
/// `ready_at`/`expires_at`/`purge_at` are set together, once the unavailable
/// set empties. The version column backs optimistic concurrent updates.
#[derive(Debug, Clone, FromRow)]
pub struct AccessRequestRow {
    pub request_id: String,
    pub container: String,
    /// JSON-encoded list of requested object ids.
    pub object_ids: String,
    /// JSON-encoded list of tar ids still missing from disk.
    pub unavailable_tar_ids: String,
    pub created_at: OffsetDateTime,
    pub ready_at: Option<OffsetDateTime>,
    pub expires_at: Option<OffsetDateTime>,
    pub purge_at: Option<OffsetDateTime>,
    pub version: i64,
}

impl AccessRequestRow {
    pub fn object_ids(&self) -> ReferentialResult<Vec<String>> {
        Ok(serde_json::from_str(&self.object_ids)?)
    }

    pub fn unavailable_tar_ids(&self) -> ReferentialResult<Vec<String>> {
        Ok(serde_json::from_str(&self.unavailable_tar_ids)?)
    }

    /// Derive the caller-visible status at `now`.
    pub fn status_at(&self, now: OffsetDateTime) -> ReferentialResult<bobine_core::AccessRequestStatus> {
        use bobine_core::AccessRequestStatus;
        if let Some(expires_at) = self.expires_at {
            if expires_at < now {
                return Ok(AccessRequestStatus::Expired);
            }
        }
        if self.unavailable_tar_ids()?.is_empty() {
            Ok(AccessRequestStatus::Ready)
        } else {
            Ok(AccessRequestStatus::Pending)
        }
    }
}

/// Offer log record. The rowid is the log offset: strictly increasing,
/// never reused, immutable once written.
#[derive(Debug, Clone, FromRow)]
pub struct OfferLogRow {
    pub offset: i64,
    pub container: String,
    pub object_id: String,
    pub action: String,
    pub created_at: OffsetDateTime,
}

impl OfferLogRow {
    pub fn into_entry(self) -> ReferentialResult<bobine_core::OfferLogEntry> {
        let action = bobine_core::OfferLogAction::parse(&self.action)
            .map_err(|e| ReferentialError::Corrupt(e.to_string()))?;
        Ok(bobine_core::OfferLogEntry {
            offset: self.offset,
            container: self.container,
            object_id: self.object_id,
            action,
        })
    }
}

/// Listing entry: id + size of a live object.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct ObjectListingEntry {
    pub object_id: String,
    pub size: i64,
}
