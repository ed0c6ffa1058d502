//! Offer synchronization and diff jobs.
//!
//! Both jobs see storage offers through the [`OfferAccess`] trait and share
//! the same run contract: a single job of a kind at a time (a concurrent
//! start fails with `Conflict`), a running flag, and a queryable last
//! report. Per-object failures are recorded and the job continues.

pub mod diff;
pub mod error;
mod job;
pub mod offer;
pub mod report;
pub mod sync;

pub use diff::OfferDiffService;
pub use error::{SyncError, SyncResult};
pub use offer::{ByteStreamReader, ListingStream, OfferAccess};
pub use report::{DiffReport, DiffReportEntry, JobStatus, SyncAnomaly, SyncReport};
pub use sync::{OfferSyncService, SyncItem};
