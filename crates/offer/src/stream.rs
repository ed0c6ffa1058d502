//! Exact-length, digest-verified byte streams.
//!
//! Reads never silently serve damaged data: a stream yields exactly the
//! referential's byte count and fails if the recomputed digest does not
//! match the stored one. Tar-backed streams additionally verify each
//! entry's header against the referential description before touching its
//! payload, and open backing tars lazily (one at a time).

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::Stream;
use std::pin::Pin;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{OfferError, OfferResult};
use crate::tar::entry;
use bobine_core::{Hasher, ObjectDigest, TarEntryDescription};

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = OfferResult<Bytes>> + Send>>;

/// An object's content: exact size plus the verified byte stream.
pub struct ObjectContent {
    pub size: u64,
    pub digest: ObjectDigest,
    pub stream: ByteStream,
}

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Stream a whole staged input file, verifying length and digest.
pub fn verified_file_stream(
    mut file: tokio::fs::File,
    size: u64,
    expected: ObjectDigest,
) -> ByteStream {
    let stream = async_stream::try_stream! {
        let mut hasher = Hasher::new(expected.algorithm);
        let mut remaining = size;
        let mut buf = vec![0u8; READ_CHUNK_SIZE];

        while remaining > 0 {
            let max = (remaining as usize).min(buf.len());
            let n = file.read(&mut buf[..max]).await?;
            if n == 0 {
                Err(OfferError::Technical(format!(
                    "truncated object stream: {remaining} bytes missing"
                )))?;
            }
            hasher.update(&buf[..n]);
            remaining -= n as u64;
            yield Bytes::copy_from_slice(&buf[..n]);
        }

        let actual = hasher.finalize();
        if actual != expected {
            Err(OfferError::DigestMismatch {
                expected: expected.hex.clone(),
                actual: actual.hex,
            })?;
        }
    };
    Box::pin(stream)
}

/// Opens the tar file backing an entry, lazily, at stream-consumption time.
pub type TarOpener =
    Box<dyn Fn(TarEntryDescription) -> BoxFuture<'static, OfferResult<tokio::fs::File>> + Send>;

/// Stream an object out of its tar entries, verifying entry headers, the
/// total length and the whole-object digest. `guard` is held for the
/// stream's lifetime (it carries the cache pins protecting the tars from
/// eviction) and released when the stream is dropped or fully consumed.
pub fn verified_tar_stream<G>(
    entries: Vec<TarEntryDescription>,
    size: u64,
    expected: ObjectDigest,
    opener: TarOpener,
    guard: G,
) -> ByteStream
where
    G: Send + 'static,
{
    let stream = async_stream::try_stream! {
        let _guard = guard;
        let mut hasher = Hasher::new(expected.algorithm);
        let mut produced = 0u64;

        for entry_desc in entries {
            let mut file = opener(entry_desc.clone()).await?;
            file.seek(std::io::SeekFrom::Start(entry_desc.offset)).await?;

            let mut block = [0u8; entry::BLOCK_LEN as usize];
            file.read_exact(&mut block).await?;
            entry::check_header(&block, &entry_desc.entry_name, entry_desc.size)?;

            let mut remaining = entry_desc.size;
            let mut buf = vec![0u8; READ_CHUNK_SIZE];
            while remaining > 0 {
                let max = (remaining as usize).min(buf.len());
                let n = file.read(&mut buf[..max]).await?;
                if n == 0 {
                    Err(OfferError::Technical(format!(
                        "truncated tar entry {}: {remaining} bytes missing",
                        entry_desc.entry_name
                    )))?;
                }
                hasher.update(&buf[..n]);
                remaining -= n as u64;
                produced += n as u64;
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        }

        if produced != size {
            Err(OfferError::Technical(format!(
                "object size mismatch: expected {size}, streamed {produced}"
            )))?;
        }
        let actual = hasher.finalize();
        if actual != expected {
            Err(OfferError::DigestMismatch {
                expected: expected.hex.clone(),
                actual: actual.hex,
            })?;
        }
    };
    Box::pin(stream)
}

/// Collect a whole stream into memory (test and sync-job helper).
pub async fn collect_stream(mut stream: ByteStream) -> OfferResult<Vec<u8>> {
    use futures::StreamExt;
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}
