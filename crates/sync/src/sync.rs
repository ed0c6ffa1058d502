//! Offer synchronization.
//!
//! Full sync replays the source offer's change log from a start offset:
//! `WRITE` entries are copied (overwriting the target's version), `DELETE`
//! entries are applied (no-op when absent). Partial sync takes an explicit
//! item list instead, for targeted repair. A single sync job runs at a
//! time; the last report stays queryable.
//!
//! Per-object failures never abort the run: they are recorded as anomalies
//! and the replay continues (final status `Warning`).

use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::error::SyncResult;
use crate::job::RunGate;
use crate::offer::OfferAccess;
use crate::report::{JobStatus, SyncAnomaly, SyncReport};
use bobine_core::{DigestAlgorithm, OfferLogAction};
use bobine_offer::OfferError;

const LOG_PAGE_SIZE: u32 = 1000;

/// Targeted-repair item for partial synchronization.
#[derive(Clone, Debug)]
pub struct SyncItem {
    pub container: String,
    pub object_id: String,
}

/// Offer synchronization service.
pub struct OfferSyncService {
    gate: RunGate,
    last_report: Mutex<Option<SyncReport>>,
    digest_algorithm: DigestAlgorithm,
}

impl OfferSyncService {
    pub fn new(digest_algorithm: DigestAlgorithm) -> Self {
        Self {
            gate: RunGate::new(),
            last_report: Mutex::new(None),
            digest_algorithm,
        }
    }

    /// Whether a synchronization is currently running.
    pub fn is_running(&self) -> bool {
        self.gate.is_running()
    }

    /// Report of the last finished run, if any.
    pub fn last_report(&self) -> Option<SyncReport> {
        self.last_report
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replay the source's offer log for `container` from `start_offset`
    /// onto the target. Fails with `Conflict` when a sync already runs.
    pub async fn synchronize(
        &self,
        source: Arc<dyn OfferAccess>,
        target: Arc<dyn OfferAccess>,
        container: &str,
        start_offset: i64,
    ) -> SyncResult<SyncReport> {
        let _token = self.gate.try_start("offer synchronization")?;
        let started_at = OffsetDateTime::now_utc();
        info!(container, start_offset, "offer synchronization started");

        let mut copied = 0u64;
        let mut deleted = 0u64;
        let mut anomalies = Vec::new();
        let mut offset = start_offset;

        loop {
            let entries = match source.read_log(container, offset, LOG_PAGE_SIZE).await {
                Ok(entries) => entries,
                Err(e) => {
                    // Fatal: the log itself is unreadable. Persist a KO
                    // report and abort.
                    let report = SyncReport {
                        container: container.to_string(),
                        start_offset,
                        current_offset: offset,
                        copied,
                        deleted,
                        anomalies,
                        status: JobStatus::Ko,
                        started_at,
                        ended_at: OffsetDateTime::now_utc(),
                    };
                    *self.last_report.lock().unwrap_or_else(|p| p.into_inner()) = Some(report);
                    return Err(e.into());
                }
            };
            if entries.is_empty() {
                break;
            }
            for entry in entries {
                offset = entry.offset + 1;
                match entry.action {
                    OfferLogAction::Write => {
                        match self
                            .copy_object(&source, &target, container, &entry.object_id)
                            .await
                        {
                            Ok(true) => copied += 1,
                            Ok(false) => {}
                            Err(e) => anomalies.push(SyncAnomaly {
                                offset: Some(entry.offset),
                                object_id: entry.object_id.clone(),
                                message: e.to_string(),
                            }),
                        }
                    }
                    OfferLogAction::Delete => {
                        match target.delete_object(container, &entry.object_id).await {
                            Ok(()) => deleted += 1,
                            Err(e) => anomalies.push(SyncAnomaly {
                                offset: Some(entry.offset),
                                object_id: entry.object_id.clone(),
                                message: e.to_string(),
                            }),
                        }
                    }
                }
            }
        }

        let report = self.finish_report(container, start_offset, offset, copied, deleted, anomalies, started_at);
        Ok(report)
    }

    /// Copy/delete an explicit list of objects so the target matches the
    /// source for exactly those objects.
    pub async fn synchronize_items(
        &self,
        source: Arc<dyn OfferAccess>,
        target: Arc<dyn OfferAccess>,
        items: &[SyncItem],
    ) -> SyncResult<SyncReport> {
        let _token = self.gate.try_start("offer synchronization")?;
        let started_at = OffsetDateTime::now_utc();
        info!(items = items.len(), "partial offer synchronization started");

        let mut copied = 0u64;
        let mut deleted = 0u64;
        let mut anomalies = Vec::new();
        let container = items
            .first()
            .map(|item| item.container.clone())
            .unwrap_or_default();

        for item in items {
            match self
                .copy_object(&source, &target, &item.container, &item.object_id)
                .await
            {
                Ok(true) => copied += 1,
                Ok(false) => {
                    // Absent on the source: align the target by deleting.
                    match target.delete_object(&item.container, &item.object_id).await {
                        Ok(()) => deleted += 1,
                        Err(e) => anomalies.push(SyncAnomaly {
                            offset: None,
                            object_id: item.object_id.clone(),
                            message: e.to_string(),
                        }),
                    }
                }
                Err(e) => anomalies.push(SyncAnomaly {
                    offset: None,
                    object_id: item.object_id.clone(),
                    message: e.to_string(),
                }),
            }
        }

        let report =
            self.finish_report(&container, 0, 0, copied, deleted, anomalies, started_at);
        Ok(report)
    }

    /// Copy one object. `Ok(false)` means the object no longer exists on
    /// the source (a later DELETE entry, or a repair of a deleted object).
    async fn copy_object(
        &self,
        source: &Arc<dyn OfferAccess>,
        target: &Arc<dyn OfferAccess>,
        container: &str,
        object_id: &str,
    ) -> SyncResult<bool> {
        let (size, stream) = match source.read_object(container, object_id).await {
            Ok(read) => read,
            Err(OfferError::NotFound(_)) => {
                debug!(container, object_id, "object gone from source, skipping copy");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        target
            .write_object(container, object_id, self.digest_algorithm, size, stream)
            .await?;
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_report(
        &self,
        container: &str,
        start_offset: i64,
        current_offset: i64,
        copied: u64,
        deleted: u64,
        anomalies: Vec<SyncAnomaly>,
        started_at: OffsetDateTime,
    ) -> SyncReport {
        let status = if anomalies.is_empty() {
            JobStatus::Ok
        } else {
            warn!(anomalies = anomalies.len(), "synchronization finished with anomalies");
            JobStatus::Warning
        };
        let report = SyncReport {
            container: container.to_string(),
            start_offset,
            current_offset,
            copied,
            deleted,
            anomalies,
            status,
            started_at,
            ended_at: OffsetDateTime::now_utc(),
        };
        info!(
            container,
            copied = report.copied,
            deleted = report.deleted,
            status = ?report.status,
            "offer synchronization finished"
        );
        *self.last_report.lock().unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
        report
    }
}
