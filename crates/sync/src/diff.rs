//! Offer diff.
//!
//! Walks two offers' ordered object listings in lock-step and reports every
//! object present on only one side, or present on both with mismatched
//! sizes. Anomalies go to a JSON-lines report file; the summary carries the
//! count and final status. A single diff job runs at a time.

use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::SyncResult;
use crate::job::RunGate;
use crate::offer::{ListingStream, OfferAccess};
use crate::report::{DiffReport, DiffReportEntry, JobStatus};
use bobine_offer::OfferResult;
use bobine_referential::models::ObjectListingEntry;

/// Offer diff service.
pub struct OfferDiffService {
    gate: RunGate,
    report_dir: PathBuf,
    last_report: Mutex<Option<DiffReport>>,
}

impl OfferDiffService {
    pub fn new(report_dir: impl AsRef<Path>) -> Self {
        Self {
            gate: RunGate::new(),
            report_dir: report_dir.as_ref().to_path_buf(),
            last_report: Mutex::new(None),
        }
    }

    /// Whether a diff is currently running.
    pub fn is_running(&self) -> bool {
        self.gate.is_running()
    }

    /// Report of the last finished run, if any.
    pub fn last_report(&self) -> Option<DiffReport> {
        self.last_report
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Compare `container` across two offers. Fails with `Conflict` when a
    /// diff already runs.
    pub async fn diff(
        &self,
        offer1: Arc<dyn OfferAccess>,
        offer2: Arc<dyn OfferAccess>,
        container: &str,
    ) -> SyncResult<DiffReport> {
        let _token = self.gate.try_start("offer diff")?;
        let started_at = OffsetDateTime::now_utc();
        info!(container, "offer diff started");

        tokio::fs::create_dir_all(&self.report_dir).await?;
        let report_path = self.report_dir.join(format!(
            "diff_{container}_{}.jsonl",
            started_at.unix_timestamp()
        ));
        let mut report_file = tokio::io::BufWriter::new(
            tokio::fs::File::create(&report_path).await?,
        );

        let mut listing1 = offer1.list_objects(container);
        let mut listing2 = offer2.list_objects(container);
        let mut next1 = next_entry(&mut listing1).await?;
        let mut next2 = next_entry(&mut listing2).await?;

        let mut compared = 0u64;
        let mut anomalies = 0u64;

        loop {
            let entry = match (&next1, &next2) {
                (None, None) => break,
                (Some(a), None) => {
                    let entry = one_sided(a, true);
                    next1 = next_entry(&mut listing1).await?;
                    Some(entry)
                }
                (None, Some(b)) => {
                    let entry = one_sided(b, false);
                    next2 = next_entry(&mut listing2).await?;
                    Some(entry)
                }
                (Some(a), Some(b)) => match a.object_id.cmp(&b.object_id) {
                    std::cmp::Ordering::Less => {
                        let entry = one_sided(a, true);
                        next1 = next_entry(&mut listing1).await?;
                        Some(entry)
                    }
                    std::cmp::Ordering::Greater => {
                        let entry = one_sided(b, false);
                        next2 = next_entry(&mut listing2).await?;
                        Some(entry)
                    }
                    std::cmp::Ordering::Equal => {
                        let entry = (a.size != b.size).then(|| DiffReportEntry {
                            object_id: a.object_id.clone(),
                            size_in_offer1: Some(a.size),
                            size_in_offer2: Some(b.size),
                        });
                        next1 = next_entry(&mut listing1).await?;
                        next2 = next_entry(&mut listing2).await?;
                        entry
                    }
                },
            };

            compared += 1;
            if let Some(entry) = entry {
                anomalies += 1;
                let line = serde_json::to_string(&entry)?;
                report_file.write_all(line.as_bytes()).await?;
                report_file.write_all(b"\n").await?;
            }
        }

        report_file.flush().await?;

        let status = if anomalies == 0 {
            JobStatus::Ok
        } else {
            warn!(container, anomalies, "offer diff found anomalies");
            JobStatus::Warning
        };
        let report = DiffReport {
            container: container.to_string(),
            compared,
            anomalies,
            status,
            report_path,
            started_at,
            ended_at: OffsetDateTime::now_utc(),
        };
        info!(
            container,
            compared = report.compared,
            anomalies = report.anomalies,
            status = ?report.status,
            "offer diff finished"
        );
        *self.last_report.lock().unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
        Ok(report)
    }
}

async fn next_entry(listing: &mut ListingStream) -> OfferResult<Option<ObjectListingEntry>> {
    listing.next().await.transpose()
}

fn one_sided(entry: &ObjectListingEntry, in_offer1: bool) -> DiffReportEntry {
    DiffReportEntry {
        object_id: entry.object_id.clone(),
        size_in_offer1: in_offer1.then_some(entry.size),
        size_in_offer2: (!in_offer1).then_some(entry.size),
    }
}
