//! The tape-backed object store front door.
//!
//! [`TapeOfferStore`] wires the engine together (input-file staging, bucket
//! tar builders, drive pool, archive cache, access request manager) and
//! exposes the offer's synchronous surface: put/bulk-put, digest-verified
//! get, head, delete, ordered listing, offer log queries and the
//! access-request lifecycle.
//!
//! A GET served from disk (input file, building/ready tar, or cached tar)
//! streams immediately; an object whose backing tars are tape-only fails
//! with `UnavailableFromAsyncOffer`, directing the caller to create an
//! access request first.

use futures::Stream;
use rand::Rng;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use crate::access::AccessRequestManager;
use crate::bucket::BucketTopology;
use crate::cache::ArchiveCacheStorage;
use crate::drive::DrivePool;
use crate::error::{OfferError, OfferResult};
use crate::file_storage::InputFileStorage;
use crate::library::TapeLibrary;
use crate::stream::{verified_file_stream, verified_tar_stream, ObjectContent, TarOpener};
use crate::tar::{PackRequest, TarBuilderManager, TarFileStorage};
use bobine_core::config::OfferConfig;
use bobine_core::{
    AccessRequestStatus, DigestAlgorithm, LogOrder, ObjectDigest, ObjectLocation, OfferLogAction,
    OfferLogEntry,
};
use bobine_referential::models::{ObjectListingEntry, ObjectRow};
use bobine_referential::ReferentialStore;

const GET_RETRIES_ON_CONCURRENT_UPDATE: u32 = 5;
const LISTING_PAGE_SIZE: u32 = 1000;

/// Metadata of a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMetadata {
    pub container: String,
    pub object_id: String,
    pub size: u64,
    pub digest: ObjectDigest,
    pub last_modified: OffsetDateTime,
}

/// The tape-backed storage offer.
pub struct TapeOfferStore {
    store: Arc<dyn ReferentialStore>,
    input_files: Arc<InputFileStorage>,
    tar_storage: Arc<TarFileStorage>,
    tar_builder: TarBuilderManager,
    cache: Arc<ArchiveCacheStorage>,
    access: Arc<AccessRequestManager>,
    topology: Arc<BucketTopology>,
}

impl TapeOfferStore {
    /// Assemble the engine: staging areas, cache, drive pool, builders and
    /// the access request manager, recovering in-flight state from the
    /// referential.
    pub async fn open(
        config: OfferConfig,
        store: Arc<dyn ReferentialStore>,
        library: Arc<dyn TapeLibrary>,
    ) -> OfferResult<Self> {
        let topology = Arc::new(BucketTopology::new(config.topology.clone())?);
        let input_files = Arc::new(InputFileStorage::new(&config.input_files_dir).await?);
        let tar_storage = Arc::new(TarFileStorage::new(&config.input_tars_dir).await?);
        let cache = Arc::new(
            ArchiveCacheStorage::new(&config.cache_dir, Arc::clone(&topology), &config.cache)
                .await?,
        );

        let (drive_pool, staging_events) = DrivePool::new(
            Arc::clone(&store),
            library,
            Arc::clone(&cache),
            config.drive_pool.clone(),
            cache.staging_dir(),
        );
        let drive_pool = Arc::new(drive_pool);

        let tar_builder = TarBuilderManager::new(
            Arc::clone(&store),
            Arc::clone(&input_files),
            Arc::clone(&tar_storage),
            Arc::clone(&topology),
            Arc::clone(&drive_pool),
            config.tar_builder.clone(),
        )
        .await?;

        let access = AccessRequestManager::start(
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&topology),
            drive_pool,
            config.access_requests.clone(),
            staging_events,
        )?;

        Ok(Self {
            store,
            input_files,
            tar_storage,
            tar_builder,
            cache,
            access,
            topology,
        })
    }

    /// Store an object, streaming it to disk while computing its digest.
    /// Write-once containers reject overwrite with different content and
    /// treat identical rewrites as idempotent no-ops.
    pub async fn put_object<R>(
        &self,
        container: &str,
        object_id: &str,
        algorithm: DigestAlgorithm,
        size: u64,
        reader: R,
    ) -> OfferResult<ObjectDigest>
    where
        R: AsyncRead + Send + Unpin,
    {
        let write_once = self.topology.is_write_once(container)?;
        let existing = if write_once {
            self.store.get_object(container, object_id).await?
        } else {
            None
        };

        let storage_id = bobine_core::new_storage_id(object_id);
        let digest = self
            .input_files
            .write_file(container, &storage_id, algorithm, size, reader)
            .await?;

        if let Some(existing) = existing {
            self.input_files.delete_file(container, &storage_id).await?;
            let existing_digest = existing.digest()?;
            if existing_digest == digest {
                debug!(container, object_id, "idempotent rewrite of write-once object");
                return Ok(digest);
            }
            return Err(OfferError::AlreadyExists(format!(
                "write-once object {container}/{object_id} already exists with a different digest"
            )));
        }

        self.commit_object(container, object_id, &storage_id, &digest, size)
            .await?;
        Ok(digest)
    }

    /// Store a batch of objects from one multiplexed stream (u64-BE length
    /// prefix per object). Any failure aborts the whole batch before any
    /// referential mutation; already-written bytes are left as garbage.
    pub async fn bulk_put_objects<R>(
        &self,
        container: &str,
        object_ids: &[String],
        algorithm: DigestAlgorithm,
        mut reader: R,
    ) -> OfferResult<Vec<ObjectDigest>>
    where
        R: AsyncRead + Send + Unpin,
    {
        if object_ids.is_empty() {
            return Err(OfferError::BadRequest("empty bulk write".to_string()));
        }
        let mut unique = HashSet::new();
        for id in object_ids {
            if !unique.insert(id) {
                return Err(OfferError::BadRequest(format!(
                    "duplicate object id '{id}' in bulk write"
                )));
            }
        }

        let write_once = self.topology.is_write_once(container)?;
        let mut staged: Vec<(String, String, ObjectDigest, u64)> = Vec::new();

        let stage_all = async {
            for object_id in object_ids {
                let size = reader.read_u64().await.map_err(|e| {
                    OfferError::BadRequest(format!(
                        "multiplexed stream ended before object {object_id}: {e}"
                    ))
                })?;
                let storage_id = bobine_core::new_storage_id(object_id);
                // Bound the reader to this frame so the size check cannot
                // consume the next object's length prefix.
                let frame = (&mut reader).take(size);
                let digest = self
                    .input_files
                    .write_file(container, &storage_id, algorithm, size, frame)
                    .await?;
                staged.push((object_id.clone(), storage_id, digest, size));
            }
            Ok::<(), OfferError>(())
        }
        .await;

        if let Err(e) = stage_all {
            self.discard_staged(container, &staged).await;
            return Err(e);
        }

        // Write-once: identical rewrites are no-ops, different content
        // aborts the whole batch.
        let mut idempotent: HashSet<usize> = HashSet::new();
        if write_once {
            for (index, (object_id, _, digest, _)) in staged.iter().enumerate() {
                if let Some(existing) = self.store.get_object(container, object_id).await? {
                    if &existing.digest()? != digest {
                        self.discard_staged(container, &staged).await;
                        return Err(OfferError::AlreadyExists(format!(
                            "write-once object {container}/{object_id} already exists with a different digest"
                        )));
                    }
                    idempotent.insert(index);
                }
            }
        }

        let mut digests = Vec::with_capacity(staged.len());
        for (index, (object_id, storage_id, digest, size)) in staged.iter().enumerate() {
            if idempotent.contains(&index) {
                self.input_files.delete_file(container, storage_id).await?;
            } else {
                self.commit_object(container, object_id, storage_id, digest, *size)
                    .await?;
            }
            digests.push(digest.clone());
        }
        Ok(digests)
    }

    async fn discard_staged(&self, container: &str, staged: &[(String, String, ObjectDigest, u64)]) {
        for (_, storage_id, _, _) in staged {
            let _ = self.input_files.delete_file(container, storage_id).await;
        }
    }

    /// Record a staged write in the referential, the offer log, and the
    /// bucket's pack queue.
    async fn commit_object(
        &self,
        container: &str,
        object_id: &str,
        storage_id: &str,
        digest: &ObjectDigest,
        size: u64,
    ) -> OfferResult<()> {
        let file_bucket = self.topology.file_bucket_of(container)?;
        let now = OffsetDateTime::now_utc();
        let row = ObjectRow {
            container: container.to_string(),
            object_id: object_id.to_string(),
            storage_id: storage_id.to_string(),
            size: size as i64,
            digest_algorithm: digest.algorithm.as_str().to_string(),
            digest: digest.hex.clone(),
            location: serde_json::to_string(&ObjectLocation::NotYetPacked)
                .map_err(|e| OfferError::Technical(e.to_string()))?,
            version: 0,
            created_at: now,
            updated_at: now,
        };

        let upsert = self.store.upsert_object(&row).await;
        // Queue the pack message even when the referential write failed: if
        // the row actually landed despite the error the object must not be
        // lost; if it did not, the tar entries become orphans.
        let enqueue = self.tar_builder.enqueue(
            &file_bucket,
            PackRequest {
                container: container.to_string(),
                object_id: object_id.to_string(),
                storage_id: storage_id.to_string(),
                size,
                digest_algorithm: digest.algorithm,
            },
        );
        upsert?;
        enqueue?;

        self.store
            .append_log(container, object_id, OfferLogAction::Write)
            .await?;
        info!(container, object_id, size, "object stored");
        Ok(())
    }

    /// Read an object as an exact-length, digest-verified stream.
    ///
    /// Served from disk wherever the bytes currently are; fails with
    /// `UnavailableFromAsyncOffer` when the backing tars are tape-only.
    /// Concurrent pack/overwrite races are settled by bounded retries.
    pub async fn get_object(&self, container: &str, object_id: &str) -> OfferResult<ObjectContent> {
        for _ in 0..GET_RETRIES_ON_CONCURRENT_UPDATE {
            match self.try_read_object(container, object_id).await? {
                Some(content) => {
                    self.access.refresh_for_read(container, object_id).await?;
                    return Ok(content);
                }
                None => {
                    warn!(container, object_id, "concurrent update during read, retrying");
                    let delay = rand::thread_rng().gen_range(10..300);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }
        Err(OfferError::Technical(format!(
            "could not read object {container}/{object_id} after {GET_RETRIES_ON_CONCURRENT_UPDATE} retries"
        )))
    }

    async fn try_read_object(
        &self,
        container: &str,
        object_id: &str,
    ) -> OfferResult<Option<ObjectContent>> {
        let row = self
            .store
            .get_object(container, object_id)
            .await?
            .ok_or_else(|| OfferError::NotFound(format!("object {container}/{object_id}")))?;
        let digest = row.digest()?;
        let size = row.size as u64;

        match row.location()? {
            ObjectLocation::NotYetPacked => {
                match self.input_files.read_file(container, &row.storage_id).await {
                    Ok(file) => Ok(Some(ObjectContent {
                        size,
                        digest: digest.clone(),
                        stream: verified_file_stream(file, size, digest),
                    })),
                    // Concurrently packed into a tar; re-resolve.
                    Err(OfferError::NotFound(_)) => Ok(None),
                    Err(e) => Err(e),
                }
            }
            ObjectLocation::InTar { entries } => {
                let file_bucket = self.topology.file_bucket_of(container)?;

                // Pin the cached tars for the stream's lifetime, then check
                // that every backing tar is disk-resident.
                let tar_ids: HashSet<&str> =
                    entries.iter().map(|e| e.tar_id.as_str()).collect();
                let mut guard = ReadPins {
                    cache: Arc::clone(&self.cache),
                    keys: Vec::new(),
                };
                for tar_id in &tar_ids {
                    if self.cache.pin_archive(&file_bucket, tar_id) {
                        guard.keys.push((file_bucket.clone(), tar_id.to_string()));
                        continue;
                    }
                    if !self.tar_storage.contains_tar(&file_bucket, tar_id).await? {
                        return Err(OfferError::UnavailableFromAsyncOffer(format!(
                            "archive {file_bucket}/{tar_id} backing {container}/{object_id} \
                             is on tape; create an access request"
                        )));
                    }
                }

                let opener = self.tar_opener(file_bucket.clone());
                Ok(Some(ObjectContent {
                    size,
                    digest: digest.clone(),
                    stream: verified_tar_stream(entries, size, digest, opener, guard),
                }))
            }
        }
    }

    /// Lazily locate a tar (building/sealed tar storage first, then the
    /// cache) at stream-consumption time.
    fn tar_opener(&self, file_bucket: String) -> TarOpener {
        let tar_storage = Arc::clone(&self.tar_storage);
        let cache = Arc::clone(&self.cache);
        Box::new(move |entry| {
            let tar_storage = Arc::clone(&tar_storage);
            let cache = Arc::clone(&cache);
            let file_bucket = file_bucket.clone();
            Box::pin(async move {
                if let Some(file) = tar_storage.try_open_tar(&file_bucket, &entry.tar_id).await? {
                    return Ok(file);
                }
                if let Some(file) = cache.try_read_archive(&file_bucket, &entry.tar_id).await? {
                    return Ok(file);
                }
                Err(OfferError::UnavailableFromAsyncOffer(format!(
                    "archive {file_bucket}/{} is no longer disk-resident",
                    entry.tar_id
                )))
            })
        })
    }

    /// Whether an object currently exists (tombstoned objects do not).
    pub async fn object_exists(&self, container: &str, object_id: &str) -> OfferResult<bool> {
        Ok(self.store.get_object(container, object_id).await?.is_some())
    }

    /// Stored digest of an object, verifying the algorithm matches.
    pub async fn object_digest(
        &self,
        container: &str,
        object_id: &str,
        algorithm: DigestAlgorithm,
    ) -> OfferResult<ObjectDigest> {
        let row = self
            .store
            .get_object(container, object_id)
            .await?
            .ok_or_else(|| OfferError::NotFound(format!("object {container}/{object_id}")))?;
        let digest = row.digest()?;
        if digest.algorithm != algorithm {
            return Err(OfferError::BadRequest(format!(
                "digest algorithm mismatch for {container}/{object_id}: expected {algorithm}, stored {}",
                digest.algorithm
            )));
        }
        Ok(digest)
    }

    /// Metadata of an object.
    pub async fn object_metadata(
        &self,
        container: &str,
        object_id: &str,
    ) -> OfferResult<ObjectMetadata> {
        let row = self
            .store
            .get_object(container, object_id)
            .await?
            .ok_or_else(|| OfferError::NotFound(format!("object {container}/{object_id}")))?;
        Ok(ObjectMetadata {
            container: row.container.clone(),
            object_id: row.object_id.clone(),
            size: row.size as u64,
            digest: row.digest()?,
            last_modified: row.updated_at,
        })
    }

    /// Delete an object. Idempotent: deleting an absent object is OK.
    /// Rejected for write-once containers. Physical bytes in sealed tars
    /// remain as garbage.
    pub async fn delete_object(&self, container: &str, object_id: &str) -> OfferResult<()> {
        if self.topology.is_write_once(container)? {
            return Err(OfferError::Conflict(format!(
                "container {container} is write-once, objects cannot be deleted"
            )));
        }

        let deleted = self.store.delete_object(container, object_id).await?;
        if deleted {
            self.store
                .append_log(container, object_id, OfferLogAction::Delete)
                .await?;
            info!(container, object_id, "object deleted");
        } else {
            debug!(container, object_id, "delete of absent object, no-op");
        }
        Ok(())
    }

    /// Stream the container's live objects ordered by id.
    pub fn list_objects(
        &self,
        container: &str,
    ) -> Pin<Box<dyn Stream<Item = OfferResult<ObjectListingEntry>> + Send>> {
        let store = Arc::clone(&self.store);
        let container = container.to_string();
        let stream = async_stream::try_stream! {
            let mut after: Option<String> = None;
            loop {
                let page = store
                    .list_objects(&container, after.as_deref(), LISTING_PAGE_SIZE)
                    .await?;
                let Some(last) = page.last() else {
                    break;
                };
                after = Some(last.object_id.clone());
                let full_page = page.len() as u32 == LISTING_PAGE_SIZE;
                for entry in page {
                    yield entry;
                }
                if !full_page {
                    break;
                }
            }
        };
        Box::pin(stream)
    }

    /// Query the container's offer log.
    pub async fn offer_log(
        &self,
        container: &str,
        offset: Option<i64>,
        limit: u32,
        order: LogOrder,
    ) -> OfferResult<Vec<OfferLogEntry>> {
        Ok(self.store.list_log(container, offset, limit, order).await?)
    }

    // ----- access request lifecycle -------------------------------------

    /// See [`AccessRequestManager::create_access_request_if_required`].
    pub async fn create_access_request_if_required(
        &self,
        container: &str,
        object_ids: &[String],
    ) -> OfferResult<Option<String>> {
        self.access
            .create_access_request_if_required(container, object_ids)
            .await
    }

    pub async fn check_access_request_statuses(
        &self,
        request_ids: &[String],
    ) -> OfferResult<std::collections::HashMap<String, AccessRequestStatus>> {
        self.access.check_access_request_statuses(request_ids).await
    }

    pub async fn remove_access_request(&self, request_id: &str) -> OfferResult<()> {
        self.access.remove_access_request(request_id).await
    }

    /// Whether ALL objects are immediately readable from disk.
    pub async fn check_object_availability(
        &self,
        container: &str,
        object_ids: &[String],
    ) -> OfferResult<bool> {
        self.access
            .check_object_availability(container, object_ids)
            .await
    }

    // ----- maintenance ---------------------------------------------------

    /// Seal a bucket's open tar regardless of fill level.
    pub async fn drain_file_bucket(&self, file_bucket: &str) -> OfferResult<()> {
        self.tar_builder.drain(file_bucket).await
    }

    /// Seal every bucket's open tar.
    pub async fn drain_all(&self) -> OfferResult<()> {
        self.tar_builder.drain_all().await
    }

    /// The archive cache (capacity introspection, eviction signal).
    pub fn cache(&self) -> &Arc<ArchiveCacheStorage> {
        &self.cache
    }

    /// The bucket topology.
    pub fn topology(&self) -> &Arc<BucketTopology> {
        &self.topology
    }
}

/// Cache pins held for the lifetime of a read stream.
struct ReadPins {
    cache: Arc<ArchiveCacheStorage>,
    keys: Vec<(String, String)>,
}

impl Drop for ReadPins {
    fn drop(&mut self) {
        for (file_bucket, tar_id) in &self.keys {
            self.cache.unpin_archive(file_bucket, tar_id);
        }
    }
}
