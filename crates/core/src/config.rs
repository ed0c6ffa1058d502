//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Tar builder configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TarBuilderConfig {
    /// Size threshold at which an open tar is sealed, in bytes.
    #[serde(default = "default_max_tar_size")]
    pub max_tar_size: u64,
    /// Maximum payload size of a single tar entry, in bytes. Larger objects
    /// are split across several entries.
    #[serde(default = "default_max_entry_size")]
    pub max_entry_size: u64,
}

/// Archive disk cache configuration.
///
/// Thresholds are strictly ordered: `safe < eviction < max`. Crossing the
/// eviction threshold starts a background sweep which stops once usage drops
/// below the safe threshold.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Hard capacity in bytes. Reservations beyond it fail.
    pub max_capacity: u64,
    /// Usage level that triggers a background eviction sweep.
    pub eviction_threshold: u64,
    /// Usage level at which an eviction sweep stops.
    pub safe_threshold: u64,
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.safe_threshold == 0 {
            return Err("safe_threshold must be positive".to_string());
        }
        if self.safe_threshold >= self.eviction_threshold {
            return Err("eviction_threshold must be greater than safe_threshold".to_string());
        }
        if self.eviction_threshold >= self.max_capacity {
            return Err("max_capacity must be greater than eviction_threshold".to_string());
        }
        Ok(())
    }
}

/// Access request manager configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccessRequestConfig {
    /// Maximum number of object ids per access request.
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
    /// TTL of a READY request, in seconds of inactivity.
    #[serde(default = "default_expiration_secs")]
    pub expiration_secs: u64,
    /// Delay after expiry before the request row is purged, in seconds.
    #[serde(default = "default_purge_secs")]
    pub purge_secs: u64,
    /// Interval of the background cleanup task, in seconds.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl AccessRequestConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_request_size == 0 {
            return Err("max_request_size must be positive".to_string());
        }
        if self.purge_secs < self.expiration_secs {
            return Err("purge cannot occur before expiration".to_string());
        }
        Ok(())
    }
}

/// Drive pool configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DrivePoolConfig {
    /// Number of physical drives.
    #[serde(default = "default_drive_count")]
    pub drive_count: u32,
    /// Usable capacity of a single tape, in bytes.
    pub tape_capacity: u64,
    /// Maximum attempts for a failed read/write order.
    #[serde(default = "default_max_order_attempts")]
    pub max_order_attempts: u32,
    /// Base delay of the exponential retry backoff, in milliseconds.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

/// Bucket topology: container categories map to file buckets, file buckets
/// group into tape buckets. The topology isolates expirable from
/// non-expirable data streams.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BucketTopologyConfig {
    /// Container category -> file bucket.
    pub file_buckets: BTreeMap<String, String>,
    /// File bucket -> tape bucket.
    pub buckets: BTreeMap<String, String>,
    /// Categories whose containers are write-once (no overwrite, no delete).
    #[serde(default)]
    pub write_once_categories: BTreeSet<String>,
    /// File buckets whose archives are kept cache-resident forever.
    #[serde(default)]
    pub keep_forever_file_buckets: BTreeSet<String>,
}

impl BucketTopologyConfig {
    pub fn validate(&self) -> Result<(), String> {
        for (category, file_bucket) in &self.file_buckets {
            if !self.buckets.contains_key(file_bucket) {
                return Err(format!(
                    "file bucket '{file_bucket}' of category '{category}' has no tape bucket"
                ));
            }
        }
        for file_bucket in &self.keep_forever_file_buckets {
            if !self.buckets.contains_key(file_bucket) {
                return Err(format!("unknown keep-forever file bucket '{file_bucket}'"));
            }
        }
        Ok(())
    }
}

/// Top-level offer configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OfferConfig {
    /// Directory for not-yet-packed input files.
    pub input_files_dir: PathBuf,
    /// Directory for building/sealed tars awaiting tape archival.
    pub input_tars_dir: PathBuf,
    /// Directory of the archive disk cache.
    pub cache_dir: PathBuf,
    pub topology: BucketTopologyConfig,
    #[serde(default)]
    pub tar_builder: TarBuilderConfig,
    pub cache: CacheConfig,
    #[serde(default)]
    pub access_requests: AccessRequestConfig,
    pub drive_pool: DrivePoolConfig,
}

fn default_max_tar_size() -> u64 {
    10 * 1024 * 1024 * 1024 // 10 GiB
}

fn default_max_entry_size() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}

fn default_max_request_size() -> usize {
    10_000
}

fn default_expiration_secs() -> u64 {
    900 // 15 minutes
}

fn default_purge_secs() -> u64 {
    1800
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

fn default_drive_count() -> u32 {
    4
}

fn default_max_order_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

impl Default for TarBuilderConfig {
    fn default() -> Self {
        Self {
            max_tar_size: default_max_tar_size(),
            max_entry_size: default_max_entry_size(),
        }
    }
}

impl Default for AccessRequestConfig {
    fn default() -> Self {
        Self {
            max_request_size: default_max_request_size(),
            expiration_secs: default_expiration_secs(),
            purge_secs: default_purge_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}
