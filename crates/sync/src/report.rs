//! Job reports for offer synchronization and diff.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::OffsetDateTime;

/// Final status of a sync/diff job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    /// Completed without anomalies.
    Ok,
    /// Completed, anomalies recorded.
    Warning,
    /// Aborted.
    Ko,
}

/// One object-level anomaly recorded during a sync run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncAnomaly {
    /// Offer log offset of the failed entry, if the failure is log-driven.
    pub offset: Option<i64>,
    pub object_id: String,
    pub message: String,
}

/// Report of a (full or partial) synchronization run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncReport {
    pub container: String,
    pub start_offset: i64,
    /// Offset after the last replayed entry.
    pub current_offset: i64,
    pub copied: u64,
    pub deleted: u64,
    pub anomalies: Vec<SyncAnomaly>,
    pub status: JobStatus,
    pub started_at: OffsetDateTime,
    pub ended_at: OffsetDateTime,
}

/// One diff anomaly: an object present on only one side, or present on both
/// with mismatched sizes. `None` marks the side where the object is absent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffReportEntry {
    pub object_id: String,
    pub size_in_offer1: Option<i64>,
    pub size_in_offer2: Option<i64>,
}

/// Summary of a diff run. Anomaly details are written to the report file,
/// one JSON object per line.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiffReport {
    pub container: String,
    pub compared: u64,
    pub anomalies: u64,
    pub status: JobStatus,
    pub report_path: PathBuf,
    pub started_at: OffsetDateTime,
    pub ended_at: OffsetDateTime,
}
