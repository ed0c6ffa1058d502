//! Shared test harness: a full offer engine over a virtual tape library
//! and a temp-dir SQLite referential.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use time::OffsetDateTime;

use bobine_core::config::{
    AccessRequestConfig, BucketTopologyConfig, CacheConfig, DrivePoolConfig, OfferConfig,
    TarBuilderConfig,
};
use bobine_core::{DigestAlgorithm, ObjectDigest, ObjectLocation, TapeLocation, TapeState};
use bobine_offer::stream::collect_stream;
use bobine_offer::{OfferResult, TapeOfferStore, VirtualTapeLibrary};
use bobine_referential::models::{ArchiveRow, TapeRow};
use bobine_referential::{
    ArchiveReferentialRepo, ObjectReferentialRepo, ReferentialStore, SqliteStore, TapeCatalogRepo,
};

pub const CONTAINER: &str = "0_object";
pub const WRITE_ONCE_CONTAINER: &str = "0_backup";

pub struct TestOffer {
    pub offer: TapeOfferStore,
    pub referential: Arc<SqliteStore>,
    pub library: Arc<VirtualTapeLibrary>,
    // Kept last so the engine shuts down before the directory goes away.
    pub temp: TempDir,
}

pub struct TestOfferOptions {
    pub max_tar_size: u64,
    pub cache_max: u64,
    pub cache_eviction: u64,
    pub cache_safe: u64,
    pub tape_capacity: u64,
    pub expiration_secs: u64,
    pub purge_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for TestOfferOptions {
    fn default() -> Self {
        Self {
            max_tar_size: 4096,
            cache_max: 1024 * 1024,
            cache_eviction: 768 * 1024,
            cache_safe: 512 * 1024,
            tape_capacity: 1024 * 1024,
            expiration_secs: 300,
            purge_secs: 600,
            cleanup_interval_secs: 1,
        }
    }
}

pub async fn build_offer(options: TestOfferOptions) -> TestOffer {
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
    for (index, (code, bucket)) in [
        ("T0001", "prod"),
        ("T0002", "prod"),
        ("T0003", "prod"),
        ("T1001", "admin"),
        ("T1002", "admin"),
    ]
    .iter()
    .enumerate()
    {
        library.add_tape(code).await.unwrap();
        referential
            .insert_tape(&TapeRow {
                tape_code: code.to_string(),
                bucket: bucket.to_string(),
                state: TapeState::Empty.as_str().to_string(),
                location: serde_json::to_string(&TapeLocation::Slot { slot: index as u32 })
                    .unwrap(),
                home_slot: index as i64,
                label_written: false,
                capacity: options.tape_capacity as i64,
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
            file_buckets: BTreeMap::from([
                ("object".to_string(), "objects".to_string()),
                ("backup".to_string(), "admin".to_string()),
            ]),
            buckets: BTreeMap::from([
                ("objects".to_string(), "prod".to_string()),
                ("admin".to_string(), "admin".to_string()),
            ]),
            write_once_categories: BTreeSet::from(["backup".to_string()]),
            keep_forever_file_buckets: BTreeSet::new(),
        },
        tar_builder: TarBuilderConfig {
            max_tar_size: options.max_tar_size,
            max_entry_size: 1024 * 1024,
        },
        cache: CacheConfig {
            max_capacity: options.cache_max,
            eviction_threshold: options.cache_eviction,
            safe_threshold: options.cache_safe,
        },
        access_requests: AccessRequestConfig {
            max_request_size: 1000,
            expiration_secs: options.expiration_secs,
            purge_secs: options.purge_secs,
            cleanup_interval_secs: options.cleanup_interval_secs,
        },
        drive_pool: DrivePoolConfig {
            drive_count: 2,
            tape_capacity: options.tape_capacity,
            max_order_attempts: 3,
            retry_base_delay_ms: 10,
        },
    };

    let store: Arc<dyn ReferentialStore> = referential.clone();
    let offer = TapeOfferStore::open(config, store, library.clone())
        .await
        .unwrap();

    TestOffer {
        offer,
        referential,
        library,
        temp,
    }
}

pub async fn default_offer() -> TestOffer {
    build_offer(TestOfferOptions::default()).await
}

pub async fn put(
    offer: &TapeOfferStore,
    container: &str,
    object_id: &str,
    data: &[u8],
) -> OfferResult<ObjectDigest> {
    offer
        .put_object(
            container,
            object_id,
            DigestAlgorithm::Sha256,
            data.len() as u64,
            data,
        )
        .await
}

pub async fn get_bytes(
    offer: &TapeOfferStore,
    container: &str,
    object_id: &str,
) -> OfferResult<Vec<u8>> {
    let content = offer.get_object(container, object_id).await?;
    collect_stream(content.stream).await
}

/// Poll `condition` until it holds, panicking after ten seconds.
pub async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for: {what}");
}

pub async fn object_location(
    referential: &SqliteStore,
    container: &str,
    object_id: &str,
) -> ObjectLocation {
    referential
        .get_object(container, object_id)
        .await
        .unwrap()
        .unwrap()
        .location()
        .unwrap()
}

/// The archive backing an object's first tar entry.
pub async fn backing_archive(
    referential: &SqliteStore,
    container: &str,
    object_id: &str,
) -> ArchiveRow {
    let location = object_location(referential, container, object_id).await;
    let ObjectLocation::InTar { entries } = location else {
        panic!("object {container}/{object_id} not yet packed");
    };
    referential
        .get_archive(&entries[0].tar_id)
        .await
        .unwrap()
        .unwrap()
}

/// Wait until an object has been packed into a tar.
pub async fn wait_packed(referential: &SqliteStore, container: &str, object_id: &str) {
    wait_until("object packed into tar", || async {
        matches!(
            object_location(referential, container, object_id).await,
            ObjectLocation::InTar { .. }
        )
    })
    .await;
}

/// Wait until the archive backing an object reaches tape.
pub async fn wait_on_tape(referential: &SqliteStore, container: &str, object_id: &str) {
    wait_packed(referential, container, object_id).await;
    wait_until("archive written to tape", || async {
        backing_archive(referential, container, object_id)
            .await
            .location()
            .unwrap()
            .is_on_tape()
    })
    .await;
}
