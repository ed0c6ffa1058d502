//! Tape catalog repository trait.

use crate::error::ReferentialResult;
use crate::models::TapeRow;
use async_trait::async_trait;
use bobine_core::TapeState;

/// Repository for the tape catalog: inventory of physical tapes, their
/// bucket assignment, state and current location.
#[async_trait]
pub trait TapeCatalogRepo: Send + Sync {
    /// Register a new tape.
    async fn insert_tape(&self, row: &TapeRow) -> ReferentialResult<()>;

    /// Fetch a tape by code.
    async fn get_tape(&self, tape_code: &str) -> ReferentialResult<Option<TapeRow>>;

    /// Atomically claim a writable tape of the given bucket for a drive:
    /// picks an `Open` tape first, then an `Empty` one, moves it to the
    /// drive and returns it. Returns `None` when no writable tape of the
    /// bucket is available.
    async fn claim_writable_tape(
        &self,
        bucket: &str,
        drive_index: u32,
    ) -> ReferentialResult<Option<TapeRow>>;

    /// Atomically claim a specific tape for a drive, if it is in a slot.
    /// Returns `None` when the tape is mounted elsewhere or unknown.
    async fn claim_tape(
        &self,
        tape_code: &str,
        drive_index: u32,
    ) -> ReferentialResult<Option<TapeRow>>;

    /// Return a mounted tape to a slot.
    async fn release_tape(&self, tape_code: &str, slot: u32) -> ReferentialResult<()>;

    /// Update a tape's state, validating the transition.
    async fn set_tape_state(&self, tape_code: &str, state: TapeState) -> ReferentialResult<()>;

    /// Record a successful archive write: bump written bytes and advance the
    /// file position counter.
    async fn record_tape_write(
        &self,
        tape_code: &str,
        written_bytes: u64,
    ) -> ReferentialResult<()>;

    /// Mark the tape label as written.
    async fn set_label_written(&self, tape_code: &str) -> ReferentialResult<()>;
}
