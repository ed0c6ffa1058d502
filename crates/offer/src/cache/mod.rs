//! Archive disk cache.
//!
//! Tars staged back from tape live under `{cache_dir}/{file_bucket}/{tar_id}`,
//! admission-controlled by a weighted LRU ([`lru::WeightedLruCache`]). The
//! `.staging` subdirectory holds in-flight downloads on the same filesystem,
//! so the final move into the cache is an atomic rename.

pub mod lru;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::fs;
use tracing::{info, warn};

use crate::bucket::BucketTopology;
use crate::error::{OfferError, OfferResult};
use crate::file_storage::check_path_component;
use bobine_core::config::CacheConfig;
use lru::WeightedLruCache;

const STAGING_DIR: &str = ".staging";

/// Cache entry key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ArchiveKey {
    pub file_bucket: String,
    pub tar_id: String,
}

impl ArchiveKey {
    pub fn new(file_bucket: impl Into<String>, tar_id: impl Into<String>) -> Self {
        Self {
            file_bucket: file_bucket.into(),
            tar_id: tar_id.into(),
        }
    }
}

impl fmt::Debug for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.file_bucket, self.tar_id)
    }
}

/// Disk-space-bounded cache of tar archives staged from tape.
pub struct ArchiveCacheStorage {
    cache_dir: PathBuf,
    lru: WeightedLruCache<ArchiveKey>,
}

impl ArchiveCacheStorage {
    /// Open the cache, loading existing archive files from disk.
    pub async fn new(
        cache_dir: impl AsRef<Path>,
        topology: Arc<BucketTopology>,
        config: &CacheConfig,
    ) -> OfferResult<Self> {
        config.validate().map_err(OfferError::BadRequest)?;

        let cache_dir = cache_dir.as_ref().to_path_buf();
        fs::create_dir_all(cache_dir.join(STAGING_DIR)).await?;

        let initial = scan_cache_dir(&cache_dir, &topology)?;

        let judge_topology = Arc::clone(&topology);
        let listener_dir = cache_dir.clone();
        let lru = WeightedLruCache::new(
            config.max_capacity,
            config.eviction_threshold,
            config.safe_threshold,
            Arc::new(move |key: &ArchiveKey| {
                !judge_topology.keep_forever_in_cache(&key.file_bucket)
            }),
            Arc::new(move |key: &ArchiveKey| {
                let path = listener_dir.join(&key.file_bucket).join(&key.tar_id);
                info!(file_bucket = %key.file_bucket, tar_id = %key.tar_id, "evicting cached archive");
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "could not delete evicted archive");
                }
            }),
            initial,
        )?;

        Ok(Self { cache_dir, lru })
    }

    /// Directory for in-flight staging downloads (same filesystem as the
    /// cache, so the final move is atomic).
    pub fn staging_dir(&self) -> PathBuf {
        self.cache_dir.join(STAGING_DIR)
    }

    /// Reserve cache space for an archive about to be staged from tape.
    pub fn reserve_archive_space(
        &self,
        file_bucket: &str,
        tar_id: &str,
        size: u64,
    ) -> OfferResult<()> {
        check_path_component(file_bucket)?;
        check_path_component(tar_id)?;
        self.lru.reserve(ArchiveKey::new(file_bucket, tar_id), size)
    }

    /// Atomically move a fully-staged file into the cache and confirm its
    /// reservation. The file size must match the reserved size.
    pub async fn move_archive_into_cache(
        &self,
        staged: &Path,
        file_bucket: &str,
        tar_id: &str,
    ) -> OfferResult<()> {
        let key = ArchiveKey::new(file_bucket, tar_id);
        if !self.lru.is_reserved(&key) {
            return Err(OfferError::BadRequest(format!(
                "archive {key:?} is not reserved in cache"
            )));
        }

        let dest = self.archive_path(file_bucket, tar_id)?;
        if fs::try_exists(&dest).await? {
            return Err(OfferError::AlreadyExists(format!(
                "cached archive {key:?}"
            )));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(staged, &dest).await?;

        self.lru.confirm(&key, now_stamp())
    }

    /// Release a reservation whose staging failed.
    pub fn cancel_reserved_archive(&self, file_bucket: &str, tar_id: &str) -> OfferResult<()> {
        self.lru.cancel(&ArchiveKey::new(file_bucket, tar_id))
    }

    /// Open a cached archive for read, refreshing its LRU position.
    /// Returns `None` when the archive is not cached (or was just evicted).
    pub async fn try_read_archive(
        &self,
        file_bucket: &str,
        tar_id: &str,
    ) -> OfferResult<Option<fs::File>> {
        let key = ArchiveKey::new(file_bucket, tar_id);
        if !self.lru.contains(&key) {
            return Ok(None);
        }

        let path = self.archive_path(file_bucket, tar_id)?;
        match fs::File::open(&path).await {
            Ok(file) => {
                self.lru.touch(&key, now_stamp());
                Ok(Some(file))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(file_bucket, tar_id, "cached archive vanished, concurrent eviction?");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether an archive is fully cached (reservations do not count).
    pub fn contains_archive(&self, file_bucket: &str, tar_id: &str) -> bool {
        self.lru.contains(&ArchiveKey::new(file_bucket, tar_id))
    }

    pub fn is_archive_reserved(&self, file_bucket: &str, tar_id: &str) -> bool {
        self.lru.is_reserved(&ArchiveKey::new(file_bucket, tar_id))
    }

    /// Pin an archive against eviction. Returns `false` if not cached.
    pub fn pin_archive(&self, file_bucket: &str, tar_id: &str) -> bool {
        self.lru.pin(&ArchiveKey::new(file_bucket, tar_id))
    }

    /// Release one pin of an archive.
    pub fn unpin_archive(&self, file_bucket: &str, tar_id: &str) {
        self.lru.unpin(&ArchiveKey::new(file_bucket, tar_id))
    }

    /// Whether a background eviction sweep is currently running.
    pub fn eviction_running(&self) -> bool {
        self.lru.eviction_running()
    }

    /// Resolve once the current eviction sweep (if any) has finished.
    pub async fn wait_for_eviction(&self) {
        self.lru.wait_for_eviction().await
    }

    /// Current occupied + reserved bytes.
    pub fn current_usage(&self) -> u64 {
        self.lru.usage()
    }

    pub fn max_capacity(&self) -> u64 {
        self.lru.max_capacity()
    }

    pub fn archive_path(&self, file_bucket: &str, tar_id: &str) -> OfferResult<PathBuf> {
        check_path_component(file_bucket)?;
        check_path_component(tar_id)?;
        Ok(self.cache_dir.join(file_bucket).join(tar_id))
    }
}

fn now_stamp() -> i128 {
    OffsetDateTime::now_utc().unix_timestamp_nanos()
}

/// Load existing `{file_bucket}/{tar_id}` files as initial cache entries.
fn scan_cache_dir(
    cache_dir: &Path,
    topology: &BucketTopology,
) -> OfferResult<Vec<(ArchiveKey, u64, i128)>> {
    let mut initial = Vec::new();

    for bucket_entry in std::fs::read_dir(cache_dir)? {
        let bucket_entry = bucket_entry?;
        if !bucket_entry.file_type()?.is_dir() {
            return Err(OfferError::Technical(format!(
                "unexpected file at cache root: {}",
                bucket_entry.path().display()
            )));
        }
        let file_bucket = bucket_entry.file_name().to_string_lossy().into_owned();
        if file_bucket == STAGING_DIR {
            continue;
        }
        if !topology.is_valid_file_bucket(&file_bucket) {
            return Err(OfferError::Technical(format!(
                "unknown file bucket in cache directory: {file_bucket}"
            )));
        }

        for file_entry in std::fs::read_dir(bucket_entry.path())? {
            let file_entry = file_entry?;
            if !file_entry.file_type()?.is_file() {
                return Err(OfferError::Technical(format!(
                    "unexpected non-file in cache: {}",
                    file_entry.path().display()
                )));
            }
            let tar_id = file_entry.file_name().to_string_lossy().into_owned();
            let metadata = file_entry.metadata()?;
            let accessed = metadata
                .accessed()
                .or_else(|_| metadata.modified())
                .map(OffsetDateTime::from)
                .unwrap_or_else(|_| OffsetDateTime::now_utc());

            initial.push((
                ArchiveKey::new(file_bucket.clone(), tar_id),
                metadata.len(),
                accessed.unix_timestamp_nanos(),
            ));
        }
    }

    Ok(initial)
}
