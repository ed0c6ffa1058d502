//! Tape-backed storage offer engine.
//!
//! This crate implements the tiered-storage engine behind a tape library
//! offer:
//! - Input-file staging and per-bucket tar packing
//! - Tape drive scheduling (bounded drive pool, per-drive order queues)
//! - Disk-space-bounded archive cache (weighted LRU, pinning, observable
//!   background eviction)
//! - Asynchronous access requests staging tape-only data back into cache
//! - The [`TapeOfferStore`] front door: put/get/head/delete/list, offer log
//!   queries and the access-request lifecycle
//!
//! The physical hardware sits behind the [`TapeLibrary`] trait; the in-tree
//! [`VirtualTapeLibrary`] emulates a library on the local filesystem.

pub mod access;
pub mod bucket;
pub mod cache;
pub mod drive;
pub mod error;
pub mod file_storage;
pub mod library;
pub mod store;
pub mod stream;
pub mod tar;

pub use access::AccessRequestManager;
pub use bucket::BucketTopology;
pub use cache::ArchiveCacheStorage;
pub use drive::{DrivePool, ReadOrder, StagingEvent, WriteOrder};
pub use error::{OfferError, OfferResult};
pub use file_storage::InputFileStorage;
pub use library::{TapeLibrary, VirtualTapeLibrary};
pub use store::{ObjectMetadata, TapeOfferStore};
pub use stream::{ByteStream, ObjectContent};
pub use tar::{TarBuilderManager, TarFileStorage};
