//! Bucket topology: container category -> file bucket -> tape bucket.
//!
//! File buckets partition the on-disk tar space (one open tar per file
//! bucket); tape buckets partition the tape pool, isolating expirable from
//! non-expirable data streams.

use bobine_core::config::BucketTopologyConfig;
use bobine_core::ContainerAddress;

use crate::error::{OfferError, OfferResult};

/// Immutable topology resolver built from configuration.
pub struct BucketTopology {
    config: BucketTopologyConfig,
}

impl BucketTopology {
    pub fn new(config: BucketTopologyConfig) -> OfferResult<Self> {
        config
            .validate()
            .map_err(OfferError::BadRequest)?;
        Ok(Self { config })
    }

    /// Resolve the file bucket of a container.
    pub fn file_bucket_of(&self, container: &str) -> OfferResult<String> {
        let address = ContainerAddress::parse(container)?;
        self.config
            .file_buckets
            .get(&address.category)
            .cloned()
            .ok_or_else(|| {
                OfferError::BadRequest(format!("no file bucket for category '{}'", address.category))
            })
    }

    /// Resolve the tape bucket of a file bucket.
    pub fn bucket_of(&self, file_bucket: &str) -> OfferResult<String> {
        self.config
            .buckets
            .get(file_bucket)
            .cloned()
            .ok_or_else(|| {
                OfferError::BadRequest(format!("no tape bucket for file bucket '{file_bucket}'"))
            })
    }

    /// Whether a file bucket is a known one.
    pub fn is_valid_file_bucket(&self, file_bucket: &str) -> bool {
        self.config.buckets.contains_key(file_bucket)
    }

    /// All configured file buckets.
    pub fn file_buckets(&self) -> impl Iterator<Item = &str> {
        self.config.buckets.keys().map(String::as_str)
    }

    /// Whether archives of a file bucket are kept cache-resident forever.
    pub fn keep_forever_in_cache(&self, file_bucket: &str) -> bool {
        self.config.keep_forever_file_buckets.contains(file_bucket)
    }

    /// Whether a container rejects overwrite and delete.
    pub fn is_write_once(&self, container: &str) -> OfferResult<bool> {
        let address = ContainerAddress::parse(container)?;
        Ok(self.config.write_once_categories.contains(&address.category))
    }
}
