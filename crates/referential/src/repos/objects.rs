//! Object referential repository trait.

use crate::error::ReferentialResult;
use crate::models::{ObjectListingEntry, ObjectRow};
use async_trait::async_trait;
use bobine_core::TarEntryDescription;

/// Repository for the object referential: durable mapping from
/// (container, object_id) to the object's current physical location.
#[async_trait]
pub trait ObjectReferentialRepo: Send + Sync {
    /// Insert a new object entry, or supersede the existing one (overwrite).
    /// The version counter is bumped on update; the previous location is
    /// replaced wholesale (old tar entries become unreferenced garbage).
    async fn upsert_object(&self, row: &ObjectRow) -> ReferentialResult<()>;

    /// Fetch a single object entry.
    async fn get_object(&self, container: &str, object_id: &str)
        -> ReferentialResult<Option<ObjectRow>>;

    /// Fetch a batch of object entries. Missing ids are silently absent.
    async fn bulk_get_objects(
        &self,
        container: &str,
        object_ids: &[String],
    ) -> ReferentialResult<Vec<ObjectRow>>;

    /// Switch an object's location to its tar entries, guarded by storage id:
    /// if the object was deleted or overwritten meanwhile (different storage
    /// id), no update occurs and `false` is returned.
    async fn set_packed_location(
        &self,
        container: &str,
        object_id: &str,
        storage_id: &str,
        entries: &[TarEntryDescription],
    ) -> ReferentialResult<bool>;

    /// Remove an object entry. Returns `false` if it was already absent.
    async fn delete_object(&self, container: &str, object_id: &str) -> ReferentialResult<bool>;

    /// List live objects of a container ordered by id, paged. `after` is an
    /// exclusive lower bound for resuming a listing.
    async fn list_objects(
        &self,
        container: &str,
        after: Option<&str>,
        limit: u32,
    ) -> ReferentialResult<Vec<ObjectListingEntry>>;
}
