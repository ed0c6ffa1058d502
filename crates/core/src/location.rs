//! Storage location model for objects and tar archives.
//!
//! Locations are tagged unions persisted as JSON in the referential. An
//! object moves from `NotYetPacked` (input file on disk) to `InTar` once the
//! tar builder has appended it; a tar moves from `BuildingOnDisk` to
//! `ReadyOnDisk` when sealed, then to `OnTape` once a drive has written it.
//! `OnTape` is terminal: archives on tape are immutable.

use crate::digest::ObjectDigest;
use serde::{Deserialize, Serialize};

/// Where an object's bytes live within a tar archive.
///
/// Large objects may span several entries across tars; ranges never overlap.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TarEntryDescription {
    /// Identifier of the containing tar archive.
    pub tar_id: String,
    /// Tar entry name (the object's storage id, possibly with a chunk index).
    pub entry_name: String,
    /// Byte offset of the entry header within the tar file.
    pub offset: u64,
    /// Payload size of this entry in bytes.
    pub size: u64,
    /// Digest of this entry's payload, re-verified on read.
    pub digest: ObjectDigest,
}

/// Current physical location of an object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObjectLocation {
    /// Persisted as an input file on disk, not yet packed into a tar.
    NotYetPacked,
    /// Packed into one or more tar entries.
    InTar { entries: Vec<TarEntryDescription> },
}

/// Current physical location of a tar archive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArchiveLocation {
    /// Open tar still receiving entries (`{tar_id}.tmp` on disk).
    BuildingOnDisk,
    /// Sealed tar on disk, queued for tape archival.
    ReadyOnDisk,
    /// Written to tape. Immutable from this point on.
    OnTape { tape_code: String, file_position: u64 },
}

impl ArchiveLocation {
    /// Validate a location transition, returning a typed error on an illegal
    /// one. Only forward moves are allowed; `OnTape` is terminal.
    pub fn check_transition(&self, to: &ArchiveLocation) -> crate::Result<()> {
        let legal = matches!(
            (self, to),
            (ArchiveLocation::BuildingOnDisk, ArchiveLocation::ReadyOnDisk)
                | (ArchiveLocation::ReadyOnDisk, ArchiveLocation::OnTape { .. })
        );
        if legal {
            Ok(())
        } else {
            Err(crate::Error::InvalidLocation(format!(
                "illegal archive location transition: {self:?} -> {to:?}"
            )))
        }
    }

    pub fn is_on_tape(&self) -> bool {
        matches!(self, ArchiveLocation::OnTape { .. })
    }
}
