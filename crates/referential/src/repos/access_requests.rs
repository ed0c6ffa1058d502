//! Access request repository trait.

use crate::error::ReferentialResult;
use crate::models::AccessRequestRow;
use async_trait::async_trait;
use std::collections::HashSet;
use time::OffsetDateTime;

/// Repository for access request persistence.
///
/// Concurrent updates (a staging completion racing another, or a removal)
/// are settled with version-checked updates: the caller re-reads and
/// retries on a lost race.
#[async_trait]
pub trait AccessRequestRepo: Send + Sync {
    /// Insert a new access request.
    async fn insert_request(&self, row: &AccessRequestRow) -> ReferentialResult<()>;

    /// Fetch a request by id.
    async fn get_request(&self, request_id: &str) -> ReferentialResult<Option<AccessRequestRow>>;

    /// Fetch a batch of requests by id. Missing ids are silently absent.
    async fn bulk_get_requests(
        &self,
        request_ids: &[String],
    ) -> ReferentialResult<Vec<AccessRequestRow>>;

    /// Requests still waiting on the given tar id.
    async fn find_by_unavailable_tar(
        &self,
        tar_id: &str,
    ) -> ReferentialResult<Vec<AccessRequestRow>>;

    /// All requests whose unavailable set is non-empty.
    async fn find_non_ready_requests(&self) -> ReferentialResult<Vec<AccessRequestRow>>;

    /// Version-checked full-row update. Returns `false` when the row's
    /// version no longer matches (concurrent update won the race).
    async fn update_request(
        &self,
        row: &AccessRequestRow,
        expected_version: i64,
    ) -> ReferentialResult<bool>;

    /// Delete a request. Returns `false` if it was already absent.
    async fn delete_request(&self, request_id: &str) -> ReferentialResult<bool>;

    /// Requests whose expiry date has passed (purged or not yet).
    async fn find_expired_requests(
        &self,
        now: OffsetDateTime,
    ) -> ReferentialResult<Vec<AccessRequestRow>>;

    /// Delete requests whose purge date has passed, returning them.
    async fn purge_expired_requests(
        &self,
        now: OffsetDateTime,
    ) -> ReferentialResult<Vec<AccessRequestRow>>;

    /// Of the given tar ids, return those NOT referenced by any remaining
    /// request (i.e. whose pending read orders may be cancelled).
    async fn filter_unreferenced_tars(
        &self,
        tar_ids: &HashSet<String>,
    ) -> ReferentialResult<HashSet<String>>;

    /// Extend the expiry of ready requests covering (container, object_id).
    /// Used to refresh the TTL on successful reads.
    async fn refresh_ready_requests(
        &self,
        container: &str,
        object_id: &str,
        expires_at: OffsetDateTime,
        purge_at: OffsetDateTime,
    ) -> ReferentialResult<u64>;
}
