//! Archive (tar) referential repository trait.

use crate::error::ReferentialResult;
use crate::models::ArchiveRow;
use async_trait::async_trait;

/// Repository for the archive referential: durable mapping from tar id to
/// the tar's physical location and size.
#[async_trait]
pub trait ArchiveReferentialRepo: Send + Sync {
    /// Register a new building-on-disk tar.
    async fn insert_archive(&self, tar_id: &str, file_bucket: &str) -> ReferentialResult<()>;

    /// Fetch a single archive entry.
    async fn get_archive(&self, tar_id: &str) -> ReferentialResult<Option<ArchiveRow>>;

    /// Fetch a batch of archive entries. Missing ids are silently absent.
    async fn bulk_get_archives(&self, tar_ids: &[String]) -> ReferentialResult<Vec<ArchiveRow>>;

    /// Seal a building tar: set its final size and move it to ready-on-disk.
    /// Fails on an illegal location transition.
    async fn seal_archive(&self, tar_id: &str, size: u64) -> ReferentialResult<()>;

    /// Record a sealed tar as written to tape. Fails on an illegal location
    /// transition (a tar on tape is immutable).
    async fn set_on_tape(
        &self,
        tar_id: &str,
        tape_code: &str,
        file_position: u64,
    ) -> ReferentialResult<()>;

    /// List sealed tars not yet written to tape, oldest first. Used at
    /// startup to re-enqueue write orders lost to a crash.
    async fn list_ready_archives(&self) -> ReferentialResult<Vec<ArchiveRow>>;
}
