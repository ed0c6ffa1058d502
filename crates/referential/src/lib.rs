//! Durable referential stores for the bobine storage offer.
//!
//! This crate is the system of record: object referential, archive (tar)
//! referential, tape catalog, per-container offer log and access requests.
//! Repositories are traits (one per concern); [`SqliteStore`] implements all
//! of them over a single SQLite database.

pub mod error;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{ReferentialError, ReferentialResult};
pub use repos::{
    AccessRequestRepo, ArchiveReferentialRepo, ObjectReferentialRepo, OfferLogRepo,
    TapeCatalogRepo,
};
pub use store::{ReferentialStore, SqliteStore};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccessRequestRow, ObjectRow, TapeRow};
    use bobine_core::{
        DigestAlgorithm, LogOrder, ObjectDigest, ObjectLocation, OfferLogAction, TapeLocation,
        TapeState, TarEntryDescription,
    };
    use tempfile::TempDir;
    use time::OffsetDateTime;

    async fn open_store() -> (TempDir, SqliteStore) {
        let temp = TempDir::new().unwrap();
        let store = SqliteStore::open(temp.path().join("referential.db"))
            .await
            .unwrap();
        (temp, store)
    }

    fn object_row(container: &str, object_id: &str, storage_id: &str, data: &[u8]) -> ObjectRow {
        let now = OffsetDateTime::now_utc();
        let digest = ObjectDigest::compute(DigestAlgorithm::Sha256, data);
        ObjectRow {
            container: container.to_string(),
            object_id: object_id.to_string(),
            storage_id: storage_id.to_string(),
            size: data.len() as i64,
            digest_algorithm: digest.algorithm.as_str().to_string(),
            digest: digest.hex,
            location: serde_json::to_string(&ObjectLocation::NotYetPacked).unwrap(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn object_upsert_bumps_version() {
        let (_temp, store) = open_store().await;

        store
            .upsert_object(&object_row("0_object", "obj1", "obj1-a", b"v1"))
            .await
            .unwrap();
        store
            .upsert_object(&object_row("0_object", "obj1", "obj1-b", b"v2"))
            .await
            .unwrap();

        let row = store.get_object("0_object", "obj1").await.unwrap().unwrap();
        assert_eq!(row.version, 1);
        assert_eq!(row.storage_id, "obj1-b");
    }

    #[tokio::test]
    async fn packed_location_guarded_by_storage_id() {
        let (_temp, store) = open_store().await;

        store
            .upsert_object(&object_row("0_object", "obj1", "obj1-a", b"v1"))
            .await
            .unwrap();

        let entries = vec![TarEntryDescription {
            tar_id: "20260101-x.tar".to_string(),
            entry_name: "obj1-a-0".to_string(),
            offset: 0,
            size: 2,
            digest: ObjectDigest::compute(DigestAlgorithm::Sha256, b"v1"),
        }];

        // Stale storage id: object was overwritten meanwhile.
        let updated = store
            .set_packed_location("0_object", "obj1", "obj1-stale", &entries)
            .await
            .unwrap();
        assert!(!updated);

        let updated = store
            .set_packed_location("0_object", "obj1", "obj1-a", &entries)
            .await
            .unwrap();
        assert!(updated);

        let row = store.get_object("0_object", "obj1").await.unwrap().unwrap();
        assert!(matches!(row.location().unwrap(), ObjectLocation::InTar { .. }));
    }

    #[tokio::test]
    async fn offer_log_offsets_are_strictly_increasing() {
        let (_temp, store) = open_store().await;

        let o1 = store
            .append_log("0_object", "a", OfferLogAction::Write)
            .await
            .unwrap();
        let o2 = store
            .append_log("0_object", "b", OfferLogAction::Write)
            .await
            .unwrap();
        let o3 = store
            .append_log("0_object", "a", OfferLogAction::Delete)
            .await
            .unwrap();
        assert!(o1 < o2 && o2 < o3);

        let entries = store
            .list_log("0_object", None, 100, LogOrder::Ascending)
            .await
            .unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].object_id, "a");
        assert_eq!(entries[2].action, OfferLogAction::Delete);

        assert_eq!(store.tail_offset("0_object").await.unwrap(), o3);
        assert_eq!(store.tail_offset("0_empty").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn tape_claim_prefers_open_over_empty() {
        let (_temp, store) = open_store().await;
        let now = OffsetDateTime::now_utc();

        for (code, state) in [("T0001", TapeState::Empty), ("T0002", TapeState::Open)] {
            store
                .insert_tape(&TapeRow {
                    tape_code: code.to_string(),
                    bucket: "main".to_string(),
                    state: state.as_str().to_string(),
                    location: serde_json::to_string(&TapeLocation::Slot { slot: 1 }).unwrap(),
                    home_slot: 1,
                    label_written: state == TapeState::Open,
                    capacity: 1_000_000,
                    written_bytes: 0,
                    file_position: 0,
                    created_at: now,
                    updated_at: now,
                })
                .await
                .unwrap();
        }

        let claimed = store.claim_writable_tape("main", 0).await.unwrap().unwrap();
        assert_eq!(claimed.tape_code, "T0002");
        assert!(matches!(
            claimed.location().unwrap(),
            TapeLocation::Drive { drive_index: 0 }
        ));

        // A mounted tape cannot be claimed again.
        assert!(store.claim_tape("T0002", 1).await.unwrap().is_none());

        // No writable tape of an unknown bucket.
        assert!(store.claim_writable_tape("other", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn access_request_version_checked_updates() {
        let (_temp, store) = open_store().await;
        let now = OffsetDateTime::now_utc();

        let mut row = AccessRequestRow {
            request_id: bobine_core::new_access_request_id(),
            container: "0_object".to_string(),
            object_ids: serde_json::to_string(&["obj1"]).unwrap(),
            unavailable_tar_ids: serde_json::to_string(&["t1.tar", "t2.tar"]).unwrap(),
            created_at: now,
            ready_at: None,
            expires_at: None,
            purge_at: None,
            version: 0,
        };
        store.insert_request(&row).await.unwrap();

        let found = store.find_by_unavailable_tar("t1.tar").await.unwrap();
        assert_eq!(found.len(), 1);

        row.unavailable_tar_ids = serde_json::to_string(&["t2.tar"]).unwrap();
        row.version = 1;
        assert!(store.update_request(&row, 0).await.unwrap());
        // Second update with the stale version loses the race.
        assert!(!store.update_request(&row, 0).await.unwrap());
    }
}
