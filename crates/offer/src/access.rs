//! Access request manager.
//!
//! An access request is the caller-visible ticket for "ensure these objects
//! are staged in the disk cache and keep their tars pinned". Requests start
//! `Pending` with the list of tar ids still missing from disk; staging
//! completions drain that list (optimistic, version-checked updates); an
//! emptied list sets the ready/expiry/purge dates. A periodic cleanup task
//! self-heals missed notifications, expires TTL-passed requests, unpins
//! their tars and purges old rows. Removal is idempotent and cancels read
//! orders nobody else needs.
//!
//! Pins are in-memory (per-request sets of cached tars); losing them on
//! restart only makes those tars evictable again, never unsafe.

use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bucket::BucketTopology;
use crate::cache::ArchiveCacheStorage;
use crate::drive::{DrivePool, ReadOrder, StagingEvent};
use crate::error::{OfferError, OfferResult};
use bobine_core::config::AccessRequestConfig;
use bobine_core::{
    check_access_request_id, new_access_request_id, AccessRequestStatus, ArchiveLocation,
    ObjectLocation,
};
use bobine_referential::models::{AccessRequestRow, ArchiveRow};
use bobine_referential::ReferentialStore;

const MAX_UPDATE_RETRIES: u32 = 3;

/// Asynchronous access-request state machine.
pub struct AccessRequestManager {
    store: Arc<dyn ReferentialStore>,
    cache: Arc<ArchiveCacheStorage>,
    topology: Arc<BucketTopology>,
    drive_pool: Arc<DrivePool>,
    config: AccessRequestConfig,
    /// request id -> (file_bucket, tar_id) pins held on the cache.
    pins: StdMutex<HashMap<String, HashSet<(String, String)>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl AccessRequestManager {
    /// Build the manager and start its background loops: the staging event
    /// consumer and the periodic cleanup task.
    pub fn start(
        store: Arc<dyn ReferentialStore>,
        cache: Arc<ArchiveCacheStorage>,
        topology: Arc<BucketTopology>,
        drive_pool: Arc<DrivePool>,
        config: AccessRequestConfig,
        mut staging_events: mpsc::UnboundedReceiver<StagingEvent>,
    ) -> OfferResult<Arc<Self>> {
        config.validate().map_err(OfferError::BadRequest)?;

        let manager = Arc::new(Self {
            store,
            cache,
            topology,
            drive_pool,
            config: config.clone(),
            pins: StdMutex::new(HashMap::new()),
            tasks: StdMutex::new(Vec::new()),
        });

        // The loops hold weak references so dropping the manager ends them.
        let events_manager = Arc::downgrade(&manager);
        let events_task = tokio::spawn(async move {
            while let Some(event) = staging_events.recv().await {
                let Some(manager) = events_manager.upgrade() else {
                    break;
                };
                manager.on_staging_event(event).await;
            }
        });

        let cleanup_manager = Arc::downgrade(&manager);
        let cleanup_task = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(config.cleanup_interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = cleanup_manager.upgrade() else {
                    break;
                };
                if let Err(e) = manager.cleanup_pass().await {
                    error!(error = %e, "access request cleanup pass failed");
                }
            }
        });

        manager
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([events_task, cleanup_task]);
        Ok(manager)
    }

    /// Create an access request unless every object is already readable
    /// from disk, in which case `None` is returned (immediate access is
    /// possible, no ticket needed).
    pub async fn create_access_request_if_required(
        &self,
        container: &str,
        object_ids: &[String],
    ) -> OfferResult<Option<String>> {
        self.check_request_objects(object_ids)?;
        let file_bucket = self.topology.file_bucket_of(container)?;

        let on_tape = self.on_tape_archives(container, object_ids).await?;
        let (cached, unavailable): (Vec<_>, Vec<_>) = on_tape
            .into_iter()
            .partition(|archive| self.cache.contains_archive(&file_bucket, &archive.tar_id));

        if unavailable.is_empty() {
            debug!(container, "all objects immediately accessible, no access request needed");
            return Ok(None);
        }

        let request_id = new_access_request_id();
        let unavailable_tar_ids: Vec<String> =
            unavailable.iter().map(|a| a.tar_id.clone()).collect();
        let now = OffsetDateTime::now_utc();

        let row = AccessRequestRow {
            request_id: request_id.clone(),
            container: container.to_string(),
            object_ids: serde_json::to_string(object_ids)
                .map_err(|e| OfferError::Technical(e.to_string()))?,
            unavailable_tar_ids: serde_json::to_string(&unavailable_tar_ids)
                .map_err(|e| OfferError::Technical(e.to_string()))?,
            created_at: now,
            ready_at: None,
            expires_at: None,
            purge_at: None,
            version: 0,
        };
        self.store.insert_request(&row).await?;

        // Pin the tars already resident so they survive until the request
        // goes away; the missing ones get pinned as staging completes.
        for archive in &cached {
            self.pin_for_request(&request_id, &file_bucket, &archive.tar_id);
        }

        for archive in &unavailable {
            self.enqueue_read_order(&file_bucket, archive)?;
        }

        info!(
            request_id = %request_id,
            container,
            unavailable = unavailable.len(),
            "created access request"
        );
        Ok(Some(request_id))
    }

    /// Map access request ids to their current status. Unknown ids map to
    /// `NotFound`.
    pub async fn check_access_request_statuses(
        &self,
        request_ids: &[String],
    ) -> OfferResult<HashMap<String, AccessRequestStatus>> {
        let mut unique = HashSet::new();
        for id in request_ids {
            check_access_request_id(id)?;
            if !unique.insert(id) {
                return Err(OfferError::BadRequest(format!(
                    "duplicate access request id '{id}'"
                )));
            }
        }

        let rows = self.store.bulk_get_requests(request_ids).await?;
        let now = OffsetDateTime::now_utc();

        let mut results = HashMap::new();
        for row in rows {
            let status = row.status_at(now)?;
            results.insert(row.request_id, status);
        }
        for id in request_ids {
            results
                .entry(id.clone())
                .or_insert(AccessRequestStatus::NotFound);
        }
        Ok(results)
    }

    /// Remove an access request. Idempotent: removing an unknown id is OK.
    /// Read orders still queued for tars no other request needs are
    /// cancelled; an in-flight staging is abandoned and simply leaves an
    /// unpinned cache entry.
    pub async fn remove_access_request(&self, request_id: &str) -> OfferResult<()> {
        check_access_request_id(request_id)?;

        let Some(row) = self.store.get_request(request_id).await? else {
            warn!(request_id, "no such access request, already deleted?");
            return Ok(());
        };

        let deleted = self.store.delete_request(request_id).await?;
        self.release_request_pins(request_id);
        if deleted {
            self.cancel_read_orders(&row).await?;
        }
        info!(request_id, "removed access request");
        Ok(())
    }

    /// Whether ALL objects are immediately readable from disk. Absent
    /// objects count as available (immediate 404).
    pub async fn check_object_availability(
        &self,
        container: &str,
        object_ids: &[String],
    ) -> OfferResult<bool> {
        self.check_request_objects(object_ids)?;
        let file_bucket = self.topology.file_bucket_of(container)?;
        let on_tape = self.on_tape_archives(container, object_ids).await?;
        Ok(on_tape
            .iter()
            .all(|archive| self.cache.contains_archive(&file_bucket, &archive.tar_id)))
    }

    /// Extend the TTL of ready requests covering this object (called on
    /// each successful read).
    pub async fn refresh_for_read(&self, container: &str, object_id: &str) -> OfferResult<()> {
        let now = OffsetDateTime::now_utc();
        let expires_at = now + Duration::from_secs(self.config.expiration_secs);
        let purge_at = now + Duration::from_secs(self.config.purge_secs);
        let refreshed = self
            .store
            .refresh_ready_requests(container, object_id, expires_at, purge_at)
            .await?;
        if refreshed > 0 {
            debug!(container, object_id, refreshed, "refreshed access request TTL");
        }
        Ok(())
    }

    fn check_request_objects(&self, object_ids: &[String]) -> OfferResult<()> {
        if object_ids.is_empty() {
            return Err(OfferError::BadRequest("empty access request".to_string()));
        }
        if object_ids.len() > self.config.max_request_size {
            return Err(OfferError::BadRequest(format!(
                "access request too large: {} objects, max {}",
                object_ids.len(),
                self.config.max_request_size
            )));
        }
        let mut unique = HashSet::new();
        for id in object_ids {
            if id.is_empty() {
                return Err(OfferError::BadRequest("empty object id".to_string()));
            }
            if !unique.insert(id) {
                return Err(OfferError::BadRequest(format!(
                    "duplicate object id '{id}' in access request"
                )));
            }
        }
        Ok(())
    }

    /// Archives backing the given objects that live on tape. Absent objects
    /// and objects still on disk (input file, building or ready tar) do not
    /// contribute.
    async fn on_tape_archives(
        &self,
        container: &str,
        object_ids: &[String],
    ) -> OfferResult<Vec<ArchiveRow>> {
        let objects = self.store.bulk_get_objects(container, object_ids).await?;

        let mut tar_ids: HashSet<String> = HashSet::new();
        for object in &objects {
            if let ObjectLocation::InTar { entries } = object.location()? {
                tar_ids.extend(entries.into_iter().map(|e| e.tar_id));
            }
        }
        let tar_ids: Vec<String> = tar_ids.into_iter().collect();

        let archives = self.store.bulk_get_archives(&tar_ids).await?;
        if archives.len() != tar_ids.len() {
            let found: HashSet<&str> = archives.iter().map(|a| a.tar_id.as_str()).collect();
            let missing: Vec<&str> = tar_ids
                .iter()
                .map(String::as_str)
                .filter(|id| !found.contains(id))
                .collect();
            return Err(OfferError::Technical(format!(
                "unknown archive ids: {missing:?}"
            )));
        }

        let mut on_tape = Vec::new();
        for archive in archives {
            if archive.location()?.is_on_tape() {
                on_tape.push(archive);
            }
        }
        Ok(on_tape)
    }

    fn enqueue_read_order(&self, file_bucket: &str, archive: &ArchiveRow) -> OfferResult<()> {
        let ArchiveLocation::OnTape {
            tape_code,
            file_position,
        } = archive.location()?
        else {
            return Err(OfferError::Technical(format!(
                "archive {} expected to be on tape",
                archive.tar_id
            )));
        };
        let size = archive.size.ok_or_else(|| {
            OfferError::Technical(format!("archive {} has no recorded size", archive.tar_id))
        })? as u64;

        self.drive_pool.submit_read_if_absent(ReadOrder {
            tar_id: archive.tar_id.clone(),
            file_bucket: file_bucket.to_string(),
            tape_code,
            file_position,
            size,
        });
        Ok(())
    }

    async fn on_staging_event(&self, event: StagingEvent) {
        match event.outcome {
            Ok(()) => {
                if let Err(e) = self.on_archive_staged(&event.file_bucket, &event.tar_id).await {
                    error!(tar_id = %event.tar_id, error = %e, "could not apply staging completion");
                }
            }
            Err(message) => {
                // Requests stay pending; the cleanup pass re-queues the
                // read order.
                warn!(tar_id = %event.tar_id, error = %message, "staging failed");
            }
        }
    }

    /// Apply a staging completion: pin the tar for every waiting request,
    /// then drain it from their unavailable lists.
    async fn on_archive_staged(&self, file_bucket: &str, tar_id: &str) -> OfferResult<()> {
        let waiting = self.store.find_by_unavailable_tar(tar_id).await?;
        for request in &waiting {
            self.pin_for_request(&request.request_id, file_bucket, tar_id);
        }
        for request in waiting {
            self.mark_archive_ready(request, tar_id).await?;
        }
        Ok(())
    }

    /// Remove a now-staged tar from a request's unavailable list, setting
    /// the ready/expiry/purge dates once the list empties. Concurrent
    /// updates are settled by version-checked retries.
    async fn mark_archive_ready(
        &self,
        mut request: AccessRequestRow,
        tar_id: &str,
    ) -> OfferResult<()> {
        for _ in 0..MAX_UPDATE_RETRIES {
            let mut unavailable = request.unavailable_tar_ids()?;
            if !unavailable.iter().any(|id| id == tar_id) {
                return Ok(());
            }
            unavailable.retain(|id| id != tar_id);

            let mut updated = request.clone();
            updated.unavailable_tar_ids = serde_json::to_string(&unavailable)
                .map_err(|e| OfferError::Technical(e.to_string()))?;
            if updated.ready_at.is_none() && unavailable.is_empty() {
                let now = OffsetDateTime::now_utc();
                updated.ready_at = Some(now);
                updated.expires_at = Some(now + Duration::from_secs(self.config.expiration_secs));
                updated.purge_at = Some(now + Duration::from_secs(self.config.purge_secs));
                info!(request_id = %updated.request_id, "access request ready");
            }
            updated.version = request.version + 1;

            if self.store.update_request(&updated, request.version).await? {
                return Ok(());
            }

            warn!(request_id = %request.request_id, "concurrent access request update, retrying");
            let delay = rand::thread_rng().gen_range(10..200);
            tokio::time::sleep(Duration::from_millis(delay)).await;

            match self.store.get_request(&request.request_id).await? {
                Some(refreshed) => request = refreshed,
                None => {
                    debug!(request_id = %request.request_id, "request deleted meanwhile");
                    return Ok(());
                }
            }
        }

        Err(OfferError::Conflict(format!(
            "could not update access request {} after {MAX_UPDATE_RETRIES} retries",
            request.request_id
        )))
    }

    /// Periodic maintenance: self-heal pending requests, expire and purge.
    async fn cleanup_pass(&self) -> OfferResult<()> {
        self.fix_pending_requests().await?;
        self.release_expired_pins().await?;
        self.purge_old_requests().await?;
        Ok(())
    }

    /// Re-check pending requests against the cache (a staging notification
    /// may have been lost) and re-queue read orders for tars still missing.
    async fn fix_pending_requests(&self) -> OfferResult<()> {
        let pending = self.store.find_non_ready_requests().await?;

        let mut staged: HashSet<(String, String)> = HashSet::new();
        let mut missing: HashMap<String, String> = HashMap::new();
        for request in &pending {
            let file_bucket = self.topology.file_bucket_of(&request.container)?;
            for tar_id in request.unavailable_tar_ids()? {
                if self.cache.contains_archive(&file_bucket, &tar_id) {
                    staged.insert((file_bucket.clone(), tar_id));
                } else {
                    missing.insert(tar_id, file_bucket.clone());
                }
            }
        }

        for (file_bucket, tar_id) in staged {
            warn!(tar_id = %tar_id, "archive staged but requests still pending, fixing");
            self.on_archive_staged(&file_bucket, &tar_id).await?;
        }

        for (tar_id, file_bucket) in missing {
            if let Some(archive) = self.store.get_archive(&tar_id).await? {
                if archive.location()?.is_on_tape() {
                    self.enqueue_read_order(&file_bucket, &archive)?;
                }
            }
        }
        Ok(())
    }

    /// Unpin the tars of requests whose TTL has passed, making them
    /// evictable again. The rows stay (status `Expired`) until purge.
    async fn release_expired_pins(&self) -> OfferResult<()> {
        let expired = self
            .store
            .find_expired_requests(OffsetDateTime::now_utc())
            .await?;
        for request in expired {
            self.release_request_pins(&request.request_id);
        }
        Ok(())
    }

    async fn purge_old_requests(&self) -> OfferResult<()> {
        let purged = self
            .store
            .purge_expired_requests(OffsetDateTime::now_utc())
            .await?;
        for request in purged {
            info!(request_id = %request.request_id, "purged expired access request");
            self.release_request_pins(&request.request_id);
            self.cancel_read_orders(&request).await?;
        }
        Ok(())
    }

    /// Cancel queued read orders for the request's tars, unless another
    /// live request still needs them. A concurrent request created between
    /// the cancellation and this check gets its order re-queued.
    async fn cancel_read_orders(&self, request: &AccessRequestRow) -> OfferResult<()> {
        let tar_ids: HashSet<String> = request.unavailable_tar_ids()?.into_iter().collect();
        if tar_ids.is_empty() {
            return Ok(());
        }

        let cancellable = self.store.filter_unreferenced_tars(&tar_ids).await?;
        let file_bucket = self.topology.file_bucket_of(&request.container)?;

        for tar_id in &cancellable {
            self.drive_pool.try_cancel_read(tar_id);
        }

        // Double-check: a request created concurrently still needs the tar.
        for tar_id in &cancellable {
            let still_needed = !self.store.find_by_unavailable_tar(tar_id).await?.is_empty();
            if still_needed {
                warn!(tar_id = %tar_id, "concurrent access request appeared, re-queueing read order");
                if let Some(archive) = self.store.get_archive(tar_id).await? {
                    if archive.location()?.is_on_tape() {
                        self.enqueue_read_order(&file_bucket, &archive)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Pin a cached tar on behalf of a request (at most once per pair).
    fn pin_for_request(&self, request_id: &str, file_bucket: &str, tar_id: &str) {
        let mut pins = self.pins.lock().unwrap_or_else(|e| e.into_inner());
        let entry = pins.entry(request_id.to_string()).or_default();
        let key = (file_bucket.to_string(), tar_id.to_string());
        if entry.contains(&key) {
            return;
        }
        if self.cache.pin_archive(file_bucket, tar_id) {
            entry.insert(key);
        }
    }

    /// Release every pin held by a request.
    fn release_request_pins(&self, request_id: &str) {
        let removed = {
            let mut pins = self.pins.lock().unwrap_or_else(|e| e.into_inner());
            pins.remove(request_id)
        };
        if let Some(keys) = removed {
            for (file_bucket, tar_id) in keys {
                self.cache.unpin_archive(&file_bucket, &tar_id);
            }
        }
    }
}

impl Drop for AccessRequestManager {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            task.abort();
        }
    }
}
