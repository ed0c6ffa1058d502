//! Offer log repository trait.

use crate::error::ReferentialResult;
use async_trait::async_trait;
use bobine_core::{LogOrder, OfferLogAction, OfferLogEntry};

/// Repository for the append-only per-container change log.
#[async_trait]
pub trait OfferLogRepo: Send + Sync {
    /// Append an entry and return its offset. Offsets are strictly
    /// increasing per container and never reordered.
    async fn append_log(
        &self,
        container: &str,
        object_id: &str,
        action: OfferLogAction,
    ) -> ReferentialResult<i64>;

    /// Query log entries of a container. `offset` is an inclusive bound on
    /// the starting offset (lower bound ascending, upper bound descending).
    async fn list_log(
        &self,
        container: &str,
        offset: Option<i64>,
        limit: u32,
        order: LogOrder,
    ) -> ReferentialResult<Vec<OfferLogEntry>>;

    /// Current tail offset of a container's log (0 when empty).
    async fn tail_offset(&self, container: &str) -> ReferentialResult<i64>;
}
