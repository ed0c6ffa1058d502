//! Shared test harness: full offer engines over virtual tape libraries.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use time::OffsetDateTime;

use bobine_core::config::{
    AccessRequestConfig, BucketTopologyConfig, CacheConfig, DrivePoolConfig, OfferConfig,
    TarBuilderConfig,
};
use bobine_core::{DigestAlgorithm, ObjectDigest, TapeLocation, TapeState};
use bobine_offer::stream::collect_stream;
use bobine_offer::{OfferResult, TapeOfferStore, VirtualTapeLibrary};
use bobine_referential::models::TapeRow;
use bobine_referential::{ReferentialStore, SqliteStore, TapeCatalogRepo};

pub const CONTAINER: &str = "0_object";

pub struct TestOffer {
    pub offer: Arc<TapeOfferStore>,
    // Kept last so the engine shuts down before the directory goes away.
    pub temp: TempDir,
}

/// Build an independent offer instance (own referential, library, cache).
pub async fn build_offer() -> TestOffer {
    let temp = TempDir::new().unwrap();

    let referential = Arc::new(
        SqliteStore::open(temp.path().join("referential.db"))
            .await
            .unwrap(),
    );
    let library = Arc::new(
        VirtualTapeLibrary::new(temp.path().join("tapes"), Duration::ZERO)
            .await
            .unwrap(),
    );

    let now = OffsetDateTime::now_utc();
    for (index, code) in ["T0001", "T0002"].iter().enumerate() {
        library.add_tape(code).await.unwrap();
        referential
            .insert_tape(&TapeRow {
                tape_code: code.to_string(),
                bucket: "prod".to_string(),
                state: TapeState::Empty.as_str().to_string(),
                location: serde_json::to_string(&TapeLocation::Slot { slot: index as u32 })
                    .unwrap(),
                home_slot: index as i64,
                label_written: false,
                capacity: 64 * 1024 * 1024,
                written_bytes: 0,
                file_position: 0,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
    }

    let config = OfferConfig {
        input_files_dir: temp.path().join("input_files"),
        input_tars_dir: temp.path().join("input_tars"),
        cache_dir: temp.path().join("cache"),
        topology: BucketTopologyConfig {
            file_buckets: BTreeMap::from([("object".to_string(), "objects".to_string())]),
            buckets: BTreeMap::from([("objects".to_string(), "prod".to_string())]),
            write_once_categories: BTreeSet::new(),
            keep_forever_file_buckets: BTreeSet::new(),
        },
        tar_builder: TarBuilderConfig {
            max_tar_size: 1024 * 1024,
            max_entry_size: 1024 * 1024,
        },
        cache: CacheConfig {
            max_capacity: 64 * 1024 * 1024,
            eviction_threshold: 48 * 1024 * 1024,
            safe_threshold: 32 * 1024 * 1024,
        },
        access_requests: AccessRequestConfig::default(),
        drive_pool: DrivePoolConfig {
            drive_count: 1,
            tape_capacity: 64 * 1024 * 1024,
            max_order_attempts: 3,
            retry_base_delay_ms: 10,
        },
    };

    let store: Arc<dyn ReferentialStore> = referential.clone();
    let offer = Arc::new(
        TapeOfferStore::open(config, store, library)
            .await
            .unwrap(),
    );

    TestOffer { offer, temp }
}

pub async fn put(offer: &TapeOfferStore, object_id: &str, data: &[u8]) -> OfferResult<ObjectDigest> {
    offer
        .put_object(
            CONTAINER,
            object_id,
            DigestAlgorithm::Sha256,
            data.len() as u64,
            data,
        )
        .await
}

pub async fn get_bytes(offer: &TapeOfferStore, object_id: &str) -> OfferResult<Vec<u8>> {
    let content = offer.get_object(CONTAINER, object_id).await?;
    collect_stream(content.stream).await
}
