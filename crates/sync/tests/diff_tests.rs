// Offer diff: lock-step listing comparison, anomaly reporting.

mod common;

use common::*;
use std::sync::Arc;

use bobine_offer::TapeOfferStore;
use bobine_sync::{DiffReportEntry, JobStatus, OfferAccess, OfferDiffService};

fn as_offer(offer: &Arc<TapeOfferStore>) -> Arc<dyn OfferAccess> {
    Arc::clone(offer) as Arc<dyn OfferAccess>
}

async fn report_entries(report: &bobine_sync::DiffReport) -> Vec<DiffReportEntry> {
    let content = tokio::fs::read_to_string(&report.report_path).await.unwrap();
    content
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test]
async fn identical_offers_diff_clean() {
    let offer1 = build_offer().await;
    let offer2 = build_offer().await;

    for harness in [&offer1, &offer2] {
        put(&harness.offer, "obj1", b"same").await.unwrap();
        put(&harness.offer, "obj2", b"also same").await.unwrap();
    }

    let temp = tempfile::TempDir::new().unwrap();
    let service = OfferDiffService::new(temp.path());
    let report = service
        .diff(as_offer(&offer1.offer), as_offer(&offer2.offer), CONTAINER)
        .await
        .unwrap();

    assert_eq!(report.status, JobStatus::Ok);
    assert_eq!(report.anomalies, 0);
    assert_eq!(report.compared, 2);
    assert!(report_entries(&report).await.is_empty());

    assert!(!service.is_running());
    assert!(service.last_report().is_some());
}

#[tokio::test]
async fn missing_and_mismatched_objects_are_reported() {
    let offer1 = build_offer().await;
    let offer2 = build_offer().await;

    // only1: present on offer1 only. only2: present on offer2 only.
    // skewed: different sizes. same: identical.
    put(&offer1.offer, "only1", b"aaaa").await.unwrap();
    put(&offer2.offer, "only2", b"bb").await.unwrap();
    put(&offer1.offer, "same", b"equal").await.unwrap();
    put(&offer2.offer, "same", b"equal").await.unwrap();
    put(&offer1.offer, "skewed", b"short").await.unwrap();
    put(&offer2.offer, "skewed", b"much longer content").await.unwrap();

    let temp = tempfile::TempDir::new().unwrap();
    let service = OfferDiffService::new(temp.path());
    let report = service
        .diff(as_offer(&offer1.offer), as_offer(&offer2.offer), CONTAINER)
        .await
        .unwrap();

    assert_eq!(report.status, JobStatus::Warning);
    assert_eq!(report.anomalies, 3);

    let mut entries = report_entries(&report).await;
    entries.sort_by(|a, b| a.object_id.cmp(&b.object_id));
    assert_eq!(
        entries,
        vec![
            DiffReportEntry {
                object_id: "only1".to_string(),
                size_in_offer1: Some(4),
                size_in_offer2: None,
            },
            DiffReportEntry {
                object_id: "only2".to_string(),
                size_in_offer1: None,
                size_in_offer2: Some(2),
            },
            DiffReportEntry {
                object_id: "skewed".to_string(),
                size_in_offer1: Some(5),
                size_in_offer2: Some(19),
            },
        ]
    );
}

#[tokio::test]
async fn empty_containers_diff_clean() {
    let offer1 = build_offer().await;
    let offer2 = build_offer().await;

    let temp = tempfile::TempDir::new().unwrap();
    let service = OfferDiffService::new(temp.path());
    let report = service
        .diff(as_offer(&offer1.offer), as_offer(&offer2.offer), CONTAINER)
        .await
        .unwrap();

    assert_eq!(report.status, JobStatus::Ok);
    assert_eq!(report.compared, 0);
    assert_eq!(report.anomalies, 0);
}
