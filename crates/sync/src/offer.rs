//! The inter-offer seam.
//!
//! Sync and diff jobs see an offer through [`OfferAccess`]: streamed reads
//! and writes, idempotent deletes, an ordered listing and the offer log.
//! [`TapeOfferStore`] implements it directly; a second implementation may
//! wrap any other backend.

use async_trait::async_trait;
use bobine_core::{DigestAlgorithm, LogOrder, ObjectDigest, OfferLogEntry};
use bobine_offer::error::{OfferError, OfferResult};
use bobine_offer::stream::ByteStream;
use bobine_offer::TapeOfferStore;
use bobine_referential::models::ObjectListingEntry;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// Ordered stream of (object id, size) listing entries.
pub type ListingStream = Pin<Box<dyn Stream<Item = OfferResult<ObjectListingEntry>> + Send>>;

/// One independent storage offer, as seen by sync/diff jobs.
#[async_trait]
pub trait OfferAccess: Send + Sync {
    /// Read an object: size plus verified byte stream.
    async fn read_object(&self, container: &str, object_id: &str)
        -> OfferResult<(u64, ByteStream)>;

    /// Write (or overwrite) an object from a byte stream.
    async fn write_object(
        &self,
        container: &str,
        object_id: &str,
        algorithm: DigestAlgorithm,
        size: u64,
        stream: ByteStream,
    ) -> OfferResult<ObjectDigest>;

    /// Delete an object (no-op when absent).
    async fn delete_object(&self, container: &str, object_id: &str) -> OfferResult<()>;

    /// Live objects of a container, ordered by id.
    fn list_objects(&self, container: &str) -> ListingStream;

    /// Offer log entries from `offset` (inclusive), ascending.
    async fn read_log(
        &self,
        container: &str,
        offset: i64,
        limit: u32,
    ) -> OfferResult<Vec<OfferLogEntry>>;
}

#[async_trait]
impl OfferAccess for TapeOfferStore {
    async fn read_object(
        &self,
        container: &str,
        object_id: &str,
    ) -> OfferResult<(u64, ByteStream)> {
        let content = self.get_object(container, object_id).await?;
        Ok((content.size, content.stream))
    }

    async fn write_object(
        &self,
        container: &str,
        object_id: &str,
        algorithm: DigestAlgorithm,
        size: u64,
        stream: ByteStream,
    ) -> OfferResult<ObjectDigest> {
        let reader = ByteStreamReader::new(stream);
        self.put_object(container, object_id, algorithm, size, reader)
            .await
    }

    async fn delete_object(&self, container: &str, object_id: &str) -> OfferResult<()> {
        TapeOfferStore::delete_object(self, container, object_id).await
    }

    fn list_objects(&self, container: &str) -> ListingStream {
        TapeOfferStore::list_objects(self, container)
    }

    async fn read_log(
        &self,
        container: &str,
        offset: i64,
        limit: u32,
    ) -> OfferResult<Vec<OfferLogEntry>> {
        self.offer_log(container, Some(offset), limit, LogOrder::Ascending)
            .await
    }
}

/// `AsyncRead` adapter over a byte stream (bridges streamed reads into the
/// offer's `AsyncRead`-based write path).
pub struct ByteStreamReader {
    stream: ByteStream,
    pending: Option<Bytes>,
}

impl ByteStreamReader {
    pub fn new(stream: ByteStream) -> Self {
        Self {
            stream,
            pending: None,
        }
    }
}

impl AsyncRead for ByteStreamReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            if let Some(chunk) = self.pending.as_mut() {
                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk.split_to(n));
                if chunk.is_empty() {
                    self.pending = None;
                }
                return Poll::Ready(Ok(()));
            }

            match futures::ready!(self.stream.poll_next_unpin(cx)) {
                Some(Ok(chunk)) => {
                    if !chunk.is_empty() {
                        self.pending = Some(chunk);
                    }
                }
                Some(Err(e)) => {
                    return Poll::Ready(Err(std::io::Error::other(offer_error_message(e))));
                }
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

fn offer_error_message(e: OfferError) -> String {
    e.to_string()
}
