// Access request lifecycle: creation, readiness, expiry, removal,
// independence from object deletion.

mod common;

use common::*;
use bobine_core::AccessRequestStatus;
use bobine_offer::OfferError;

/// Archive an object to tape and evict its tar from the cache, making the
/// object tape-only.
async fn archive_and_evict(harness: &TestOffer, object_id: &str, data: &[u8]) {
    put(&harness.offer, CONTAINER, object_id, data).await.unwrap();
    wait_packed(&harness.referential, CONTAINER, object_id).await;
    harness.offer.drain_file_bucket("objects").await.unwrap();
    wait_on_tape(&harness.referential, CONTAINER, object_id).await;

    let archive = backing_archive(&harness.referential, CONTAINER, object_id).await;
    let mut filler = 0;
    wait_until("tar evicted from cache", || {
        filler += 1;
        let harness = &harness;
        let archive = &archive;
        async move {
            let id = format!("evict-filler-{filler}");
            put(&harness.offer, CONTAINER, &id, &vec![0u8; 1500])
                .await
                .unwrap();
            wait_packed(&harness.referential, CONTAINER, &id).await;
            harness.offer.drain_file_bucket("objects").await.unwrap();
            wait_on_tape(&harness.referential, CONTAINER, &id).await;
            harness.offer.cache().wait_for_eviction().await;
            !harness
                .offer
                .cache()
                .contains_archive(&archive.file_bucket, &archive.tar_id)
        }
    })
    .await;
}

fn tight_cache_options() -> TestOfferOptions {
    TestOfferOptions {
        cache_max: 8192,
        cache_eviction: 4096,
        cache_safe: 2048,
        ..Default::default()
    }
}

#[tokio::test]
async fn no_request_needed_when_objects_are_on_disk() {
    let harness = default_offer().await;

    put(&harness.offer, CONTAINER, "obj1", b"hot data").await.unwrap();

    let request = harness
        .offer
        .create_access_request_if_required(CONTAINER, &["obj1".to_string()])
        .await
        .unwrap();
    assert!(request.is_none());

    // Absent objects are immediately accessible too (immediate 404).
    let request = harness
        .offer
        .create_access_request_if_required(CONTAINER, &["ghost".to_string()])
        .await
        .unwrap();
    assert!(request.is_none());
}

#[tokio::test]
async fn request_transitions_pending_to_ready() {
    let harness = build_offer(tight_cache_options()).await;
    archive_and_evict(&harness, "cold1", &vec![4u8; 1100]).await;

    let request_id = harness
        .offer
        .create_access_request_if_required(CONTAINER, &["cold1".to_string()])
        .await
        .unwrap()
        .expect("request required for tape-only object");

    wait_until("request ready", || async {
        let statuses = harness
            .offer
            .check_access_request_statuses(&[request_id.clone()])
            .await
            .unwrap();
        statuses[&request_id] == AccessRequestStatus::Ready
    })
    .await;

    // Staged and pinned: the object reads fine now.
    assert_eq!(
        get_bytes(&harness.offer, CONTAINER, "cold1").await.unwrap(),
        vec![4u8; 1100]
    );
}

#[tokio::test]
async fn unknown_and_removed_requests_are_not_found() {
    let harness = default_offer().await;

    let unknown = bobine_core::new_access_request_id();
    let statuses = harness
        .offer
        .check_access_request_statuses(&[unknown.clone()])
        .await
        .unwrap();
    assert_eq!(statuses[&unknown], AccessRequestStatus::NotFound);

    // Removal of an unknown id is idempotent.
    harness.offer.remove_access_request(&unknown).await.unwrap();

    // Malformed ids are rejected.
    assert!(matches!(
        harness
            .offer
            .check_access_request_statuses(&["not-a-request-id".to_string()])
            .await,
        Err(OfferError::Core(_))
    ));
}

#[tokio::test]
async fn removed_request_becomes_not_found() {
    let harness = build_offer(tight_cache_options()).await;
    archive_and_evict(&harness, "cold1", &vec![6u8; 900]).await;

    let request_id = harness
        .offer
        .create_access_request_if_required(CONTAINER, &["cold1".to_string()])
        .await
        .unwrap()
        .unwrap();

    harness.offer.remove_access_request(&request_id).await.unwrap();
    let statuses = harness
        .offer
        .check_access_request_statuses(&[request_id.clone()])
        .await
        .unwrap();
    assert_eq!(statuses[&request_id], AccessRequestStatus::NotFound);

    // Idempotent.
    harness.offer.remove_access_request(&request_id).await.unwrap();
}

#[tokio::test]
async fn ready_request_expires_then_purges() {
    let mut options = tight_cache_options();
    options.expiration_secs = 1;
    options.purge_secs = 3;
    options.cleanup_interval_secs = 1;
    let harness = build_offer(options).await;
    archive_and_evict(&harness, "cold1", &vec![8u8; 1000]).await;

    let request_id = harness
        .offer
        .create_access_request_if_required(CONTAINER, &["cold1".to_string()])
        .await
        .unwrap()
        .unwrap();

    wait_until("request ready", || async {
        harness
            .offer
            .check_access_request_statuses(&[request_id.clone()])
            .await
            .unwrap()[&request_id]
            == AccessRequestStatus::Ready
    })
    .await;

    // No activity: the TTL runs out.
    wait_until("request expired", || async {
        harness
            .offer
            .check_access_request_statuses(&[request_id.clone()])
            .await
            .unwrap()[&request_id]
            == AccessRequestStatus::Expired
    })
    .await;

    // The purge deadline removes the row entirely.
    wait_until("request purged", || async {
        harness
            .offer
            .check_access_request_statuses(&[request_id.clone()])
            .await
            .unwrap()[&request_id]
            == AccessRequestStatus::NotFound
    })
    .await;
}

#[tokio::test]
async fn object_deletion_does_not_fail_ready_request() {
    let harness = build_offer(tight_cache_options()).await;
    archive_and_evict(&harness, "cold1", &vec![2u8; 800]).await;

    let request_id = harness
        .offer
        .create_access_request_if_required(CONTAINER, &["cold1".to_string()])
        .await
        .unwrap()
        .unwrap();

    wait_until("request ready", || async {
        harness
            .offer
            .check_access_request_statuses(&[request_id.clone()])
            .await
            .unwrap()[&request_id]
            == AccessRequestStatus::Ready
    })
    .await;

    harness.offer.delete_object(CONTAINER, "cold1").await.unwrap();
    assert!(!harness.offer.object_exists(CONTAINER, "cold1").await.unwrap());

    // The request stays READY, independent of the object's fate.
    let statuses = harness
        .offer
        .check_access_request_statuses(&[request_id.clone()])
        .await
        .unwrap();
    assert_eq!(statuses[&request_id], AccessRequestStatus::Ready);
}

#[tokio::test]
async fn duplicate_object_ids_are_rejected() {
    let harness = default_offer().await;

    let result = harness
        .offer
        .create_access_request_if_required(
            CONTAINER,
            &["obj1".to_string(), "obj1".to_string()],
        )
        .await;
    assert!(matches!(result, Err(OfferError::BadRequest(_))));

    let result = harness
        .offer
        .create_access_request_if_required(CONTAINER, &[])
        .await;
    assert!(matches!(result, Err(OfferError::BadRequest(_))));
}
