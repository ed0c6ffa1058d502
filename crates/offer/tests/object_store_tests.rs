// Object store surface: put/get/head/delete/list, offer log, write-once
// policy, bulk writes.

mod common;

use common::*;
use futures::StreamExt;
use bobine_core::{DigestAlgorithm, LogOrder, ObjectDigest, OfferLogAction};
use bobine_offer::OfferError;
use bobine_referential::ObjectReferentialRepo;

#[tokio::test]
async fn put_then_get_roundtrip() {
    let harness = default_offer().await;

    let data = b"the quick brown fox".to_vec();
    let digest = put(&harness.offer, CONTAINER, "obj1", &data).await.unwrap();
    assert_eq!(digest, ObjectDigest::compute(DigestAlgorithm::Sha256, &data));

    let read = get_bytes(&harness.offer, CONTAINER, "obj1").await.unwrap();
    assert_eq!(read, data);

    let metadata = harness
        .offer
        .object_metadata(CONTAINER, "obj1")
        .await
        .unwrap();
    assert_eq!(metadata.size, data.len() as u64);
    assert_eq!(metadata.digest, digest);

    let stored = harness
        .offer
        .object_digest(CONTAINER, "obj1", DigestAlgorithm::Sha256)
        .await
        .unwrap();
    assert_eq!(stored, digest);

    // Algorithm mismatch is rejected, not silently served.
    assert!(matches!(
        harness
            .offer
            .object_digest(CONTAINER, "obj1", DigestAlgorithm::Sha512)
            .await,
        Err(OfferError::BadRequest(_))
    ));
}

#[tokio::test]
async fn get_works_after_packing() {
    let harness = default_offer().await;

    let data = vec![7u8; 1500];
    put(&harness.offer, CONTAINER, "obj1", &data).await.unwrap();
    wait_packed(&harness.referential, CONTAINER, "obj1").await;

    // Input file is gone, the building tar serves the read.
    let read = get_bytes(&harness.offer, CONTAINER, "obj1").await.unwrap();
    assert_eq!(read, data);
}

#[tokio::test]
async fn missing_object_is_not_found() {
    let harness = default_offer().await;

    assert!(!harness
        .offer
        .object_exists(CONTAINER, "ghost")
        .await
        .unwrap());
    assert!(matches!(
        harness.offer.get_object(CONTAINER, "ghost").await,
        Err(OfferError::NotFound(_))
    ));
}

#[tokio::test]
async fn overwrite_serves_new_content_and_bumps_version() {
    let harness = default_offer().await;

    put(&harness.offer, CONTAINER, "obj1", b"version one").await.unwrap();
    put(&harness.offer, CONTAINER, "obj1", b"version two!").await.unwrap();

    let read = get_bytes(&harness.offer, CONTAINER, "obj1").await.unwrap();
    assert_eq!(read, b"version two!");

    let row = harness
        .referential
        .get_object(CONTAINER, "obj1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.version, 1);
}

#[tokio::test]
async fn write_once_container_rejects_different_content() {
    let harness = default_offer().await;

    let digest = put(&harness.offer, WRITE_ONCE_CONTAINER, "report", b"immutable")
        .await
        .unwrap();

    // Identical rewrite is an idempotent no-op.
    let again = put(&harness.offer, WRITE_ONCE_CONTAINER, "report", b"immutable")
        .await
        .unwrap();
    assert_eq!(again, digest);

    // Different content is a conflict.
    assert!(matches!(
        put(&harness.offer, WRITE_ONCE_CONTAINER, "report", b"tampered!").await,
        Err(OfferError::AlreadyExists(_))
    ));

    // And so is deletion.
    assert!(matches!(
        harness
            .offer
            .delete_object(WRITE_ONCE_CONTAINER, "report")
            .await,
        Err(OfferError::Conflict(_))
    ));
}

#[tokio::test]
async fn delete_is_idempotent_and_hides_object() {
    let harness = default_offer().await;

    put(&harness.offer, CONTAINER, "obj1", b"data").await.unwrap();
    assert!(harness.offer.object_exists(CONTAINER, "obj1").await.unwrap());

    harness.offer.delete_object(CONTAINER, "obj1").await.unwrap();
    assert!(!harness.offer.object_exists(CONTAINER, "obj1").await.unwrap());
    assert!(matches!(
        harness.offer.get_object(CONTAINER, "obj1").await,
        Err(OfferError::NotFound(_))
    ));

    // Deleting again is OK.
    harness.offer.delete_object(CONTAINER, "obj1").await.unwrap();
}

#[tokio::test]
async fn listing_is_ordered_and_reflects_live_objects() {
    let harness = default_offer().await;

    for id in ["obj3", "obj1", "obj2"] {
        put(&harness.offer, CONTAINER, id, id.as_bytes()).await.unwrap();
    }
    harness.offer.delete_object(CONTAINER, "obj2").await.unwrap();

    let entries: Vec<_> = harness
        .offer
        .list_objects(CONTAINER)
        .map(|e| e.unwrap())
        .collect()
        .await;
    let ids: Vec<&str> = entries.iter().map(|e| e.object_id.as_str()).collect();
    assert_eq!(ids, vec!["obj1", "obj3"]);
    assert_eq!(entries[0].size, 4);
}

#[tokio::test]
async fn offer_log_records_writes_and_deletes_in_order() {
    let harness = default_offer().await;

    put(&harness.offer, CONTAINER, "a", b"1").await.unwrap();
    put(&harness.offer, CONTAINER, "b", b"2").await.unwrap();
    harness.offer.delete_object(CONTAINER, "a").await.unwrap();

    let log = harness
        .offer
        .offer_log(CONTAINER, None, 100, LogOrder::Ascending)
        .await
        .unwrap();
    assert_eq!(log.len(), 3);
    assert_eq!(log[0].object_id, "a");
    assert_eq!(log[0].action, OfferLogAction::Write);
    assert_eq!(log[2].object_id, "a");
    assert_eq!(log[2].action, OfferLogAction::Delete);
    assert!(log.windows(2).all(|w| w[0].offset < w[1].offset));

    // Descending query, bounded offset.
    let tail = harness
        .offer
        .offer_log(CONTAINER, None, 1, LogOrder::Descending)
        .await
        .unwrap();
    assert_eq!(tail[0].action, OfferLogAction::Delete);
}

#[tokio::test]
async fn concurrent_overwrite_yields_consistent_read() {
    let harness = default_offer().await;

    let old = vec![b'o'; 4000];
    let new = vec![b'n'; 4000];
    put(&harness.offer, CONTAINER, "obj1", &old).await.unwrap();

    // Open the read stream, then overwrite before consuming it.
    let content = harness.offer.get_object(CONTAINER, "obj1").await.unwrap();
    put(&harness.offer, CONTAINER, "obj1", &new).await.unwrap();

    // The digest-verified stream delivers fully one version, never a mix.
    let read = bobine_offer::stream::collect_stream(content.stream)
        .await
        .unwrap();
    assert!(read == old || read == new);
}

fn multiplexed(parts: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for part in parts {
        out.extend_from_slice(&(part.len() as u64).to_be_bytes());
        out.extend_from_slice(part);
    }
    out
}

#[tokio::test]
async fn bulk_put_stores_all_objects() {
    let harness = default_offer().await;

    let ids = vec!["bulk1".to_string(), "bulk2".to_string(), "bulk3".to_string()];
    let stream = multiplexed(&[b"first", b"second payload", b""]);

    let digests = harness
        .offer
        .bulk_put_objects(CONTAINER, &ids, DigestAlgorithm::Sha256, &stream[..])
        .await
        .unwrap();
    assert_eq!(digests.len(), 3);
    assert_eq!(
        digests[1],
        ObjectDigest::compute(DigestAlgorithm::Sha256, b"second payload")
    );

    assert_eq!(
        get_bytes(&harness.offer, CONTAINER, "bulk1").await.unwrap(),
        b"first"
    );
    assert_eq!(
        get_bytes(&harness.offer, CONTAINER, "bulk3").await.unwrap(),
        b""
    );
}

#[tokio::test]
async fn truncated_bulk_put_leaves_nothing_visible() {
    let harness = default_offer().await;

    let ids = vec!["bulk1".to_string(), "bulk2".to_string()];
    // Second object's frame is missing.
    let stream = multiplexed(&[b"only one"]);

    let result = harness
        .offer
        .bulk_put_objects(CONTAINER, &ids, DigestAlgorithm::Sha256, &stream[..])
        .await;
    assert!(result.is_err());

    for id in &ids {
        assert!(!harness.offer.object_exists(CONTAINER, id).await.unwrap());
    }
    assert!(harness
        .offer
        .offer_log(CONTAINER, None, 10, LogOrder::Ascending)
        .await
        .unwrap()
        .is_empty());
}
