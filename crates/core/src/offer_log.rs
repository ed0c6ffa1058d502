//! Offer log model.
//!
//! Each container carries an append-only, strictly-ordered change log. The
//! log is the single source of truth for "what changed since offset N" and
//! drives offer synchronization and diffing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Action recorded by an offer log entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfferLogAction {
    Write,
    Delete,
}

impl OfferLogAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OfferLogAction::Write => "WRITE",
            OfferLogAction::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "WRITE" => Ok(OfferLogAction::Write),
            "DELETE" => Ok(OfferLogAction::Delete),
            other => Err(crate::Error::Serialization(format!(
                "unknown offer log action: {other}"
            ))),
        }
    }
}

impl fmt::Display for OfferLogAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single offer log entry. Offsets are strictly increasing per container
/// and immutable once written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferLogEntry {
    pub offset: i64,
    pub container: String,
    pub object_id: String,
    pub action: OfferLogAction,
}

/// Ordering of an offer log query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogOrder {
    Ascending,
    Descending,
}
