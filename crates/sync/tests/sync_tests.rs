// Offer synchronization: full log replay, idempotent re-runs, partial
// repair, run/status contract.

mod common;

use common::*;
use std::sync::Arc;

use bobine_core::DigestAlgorithm;
use bobine_offer::TapeOfferStore;
use bobine_sync::{JobStatus, OfferAccess, OfferSyncService, SyncItem};

fn as_offer(offer: &Arc<TapeOfferStore>) -> Arc<dyn OfferAccess> {
    Arc::clone(offer) as Arc<dyn OfferAccess>
}

#[tokio::test]
async fn full_sync_reproduces_live_object_set() {
    let source = build_offer().await;
    let target = build_offer().await;

    // N writes, one overwrite, M deletes on the source.
    put(&source.offer, "obj1", b"one").await.unwrap();
    put(&source.offer, "obj2", b"two").await.unwrap();
    put(&source.offer, "obj3", b"three").await.unwrap();
    put(&source.offer, "obj2", b"two, revised").await.unwrap();
    source.offer.delete_object(CONTAINER, "obj3").await.unwrap();

    let service = OfferSyncService::new(DigestAlgorithm::Sha256);
    let report = service
        .synchronize(as_offer(&source.offer), as_offer(&target.offer), CONTAINER, 0)
        .await
        .unwrap();

    assert_eq!(report.status, JobStatus::Ok);
    assert!(report.anomalies.is_empty());
    // obj3's two WRITE entries replay as skips-or-copies, its DELETE lands
    // last; obj1 and obj2 are copied.
    assert_eq!(report.deleted, 1);

    assert_eq!(get_bytes(&target.offer, "obj1").await.unwrap(), b"one");
    assert_eq!(
        get_bytes(&target.offer, "obj2").await.unwrap(),
        b"two, revised"
    );
    assert!(!target.offer.object_exists(CONTAINER, "obj3").await.unwrap());

    assert!(!service.is_running());
    assert!(service.last_report().is_some());
}

#[tokio::test]
async fn rerunning_sync_is_idempotent() {
    let source = build_offer().await;
    let target = build_offer().await;

    put(&source.offer, "obj1", b"payload").await.unwrap();
    put(&source.offer, "obj2", b"other").await.unwrap();
    source.offer.delete_object(CONTAINER, "obj2").await.unwrap();

    let service = OfferSyncService::new(DigestAlgorithm::Sha256);
    let first = service
        .synchronize(as_offer(&source.offer), as_offer(&target.offer), CONTAINER, 0)
        .await
        .unwrap();
    let second = service
        .synchronize(as_offer(&source.offer), as_offer(&target.offer), CONTAINER, 0)
        .await
        .unwrap();

    assert_eq!(first.status, JobStatus::Ok);
    assert_eq!(second.status, JobStatus::Ok);
    assert_eq!(get_bytes(&target.offer, "obj1").await.unwrap(), b"payload");
    assert!(!target.offer.object_exists(CONTAINER, "obj2").await.unwrap());
}

#[tokio::test]
async fn sync_resumes_from_offset() {
    let source = build_offer().await;
    let target = build_offer().await;

    put(&source.offer, "obj1", b"early").await.unwrap();

    let service = OfferSyncService::new(DigestAlgorithm::Sha256);
    let first = service
        .synchronize(as_offer(&source.offer), as_offer(&target.offer), CONTAINER, 0)
        .await
        .unwrap();

    put(&source.offer, "obj2", b"late").await.unwrap();
    let second = service
        .synchronize(
            as_offer(&source.offer),
            as_offer(&target.offer),
            CONTAINER,
            first.current_offset,
        )
        .await
        .unwrap();

    // Only the new entry replayed.
    assert_eq!(second.copied, 1);
    assert_eq!(get_bytes(&target.offer, "obj2").await.unwrap(), b"late");
}

#[tokio::test]
async fn partial_sync_repairs_explicit_items() {
    let source = build_offer().await;
    let target = build_offer().await;

    put(&source.offer, "good", b"fresh").await.unwrap();
    // Target has a stale extra object and a stale version of "good".
    put(&target.offer, "good", b"stale").await.unwrap();
    put(&target.offer, "orphan", b"should go").await.unwrap();

    let service = OfferSyncService::new(DigestAlgorithm::Sha256);
    let report = service
        .synchronize_items(
            as_offer(&source.offer),
            as_offer(&target.offer),
            &[
                SyncItem {
                    container: CONTAINER.to_string(),
                    object_id: "good".to_string(),
                },
                SyncItem {
                    container: CONTAINER.to_string(),
                    object_id: "orphan".to_string(),
                },
            ],
        )
        .await
        .unwrap();

    assert_eq!(report.status, JobStatus::Ok);
    assert_eq!(report.copied, 1);
    assert_eq!(report.deleted, 1);
    assert_eq!(get_bytes(&target.offer, "good").await.unwrap(), b"fresh");
    assert!(!target.offer.object_exists(CONTAINER, "orphan").await.unwrap());
}

#[tokio::test]
async fn concurrent_sync_start_conflicts() {
    let source = build_offer().await;
    let target = build_offer().await;

    // Enough entries to keep the first run busy for a moment.
    for i in 0..50 {
        put(&source.offer, &format!("obj{i}"), &vec![i as u8; 256])
            .await
            .unwrap();
    }

    let service = Arc::new(OfferSyncService::new(DigestAlgorithm::Sha256));
    let first = {
        let service = Arc::clone(&service);
        let source = as_offer(&source.offer);
        let target = as_offer(&target.offer);
        tokio::spawn(async move { service.synchronize(source, target, CONTAINER, 0).await })
    };

    // Starting while the first run is in flight must conflict; poll until
    // the first run finishes to avoid racing its startup.
    let mut saw_conflict = false;
    while !first.is_finished() {
        match service
            .synchronize(as_offer(&source.offer), as_offer(&target.offer), CONTAINER, 0)
            .await
        {
            Err(bobine_sync::SyncError::Conflict(_)) => {
                saw_conflict = true;
                break;
            }
            Ok(_) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    let report = first.await.unwrap().unwrap();
    assert_eq!(report.copied, 50);
    if saw_conflict {
        assert!(service.last_report().is_some());
    }
}
