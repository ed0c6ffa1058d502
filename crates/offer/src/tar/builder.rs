//! Per-bucket tar builders.
//!
//! One worker task per file bucket consumes pack requests in order, appends
//! the staged input file to the bucket's open tar, updates the object
//! referential to the packed location (guarded by storage id) and deletes
//! the input file. A tar is sealed when it crosses the configured size
//! threshold, or on explicit drain; sealing hands a write order to the
//! drive pool.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bucket::BucketTopology;
use crate::drive::{DrivePool, WriteOrder};
use crate::error::{OfferError, OfferResult};
use crate::file_storage::InputFileStorage;
use crate::tar::entry;
use crate::tar::storage::TarFileStorage;
use bobine_core::config::TarBuilderConfig;
use bobine_core::{new_tar_id, Hasher, TarEntryDescription};
use bobine_referential::ReferentialStore;

/// Request to pack one staged input file into the bucket's open tar.
#[derive(Debug, Clone)]
pub struct PackRequest {
    pub container: String,
    pub object_id: String,
    pub storage_id: String,
    pub size: u64,
    pub digest_algorithm: bobine_core::DigestAlgorithm,
}

enum Command {
    Pack(PackRequest),
    Drain(oneshot::Sender<OfferResult<()>>),
}

/// Front handle over the per-bucket builder workers.
pub struct TarBuilderManager {
    senders: HashMap<String, mpsc::UnboundedSender<Command>>,
    workers: Vec<JoinHandle<()>>,
}

impl TarBuilderManager {
    /// Spawn one builder per configured file bucket, after re-queueing
    /// sealed tars that never reached tape (crash recovery).
    pub async fn new(
        store: Arc<dyn ReferentialStore>,
        input_files: Arc<InputFileStorage>,
        tar_storage: Arc<TarFileStorage>,
        topology: Arc<BucketTopology>,
        drive_pool: Arc<DrivePool>,
        config: TarBuilderConfig,
    ) -> OfferResult<Self> {
        resubmit_ready_archives(&store, &tar_storage, &topology, &drive_pool).await?;

        let mut senders = HashMap::new();
        let mut workers = Vec::new();
        for file_bucket in topology.file_buckets() {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(file_bucket.to_string(), tx);

            let worker = BucketWorker {
                file_bucket: file_bucket.to_string(),
                bucket: topology.bucket_of(file_bucket)?,
                store: Arc::clone(&store),
                input_files: Arc::clone(&input_files),
                tar_storage: Arc::clone(&tar_storage),
                drive_pool: Arc::clone(&drive_pool),
                config: config.clone(),
                open: None,
            };
            workers.push(tokio::spawn(worker.run(rx)));
        }

        Ok(Self { senders, workers })
    }

    /// Queue a pack request for the file bucket's builder.
    pub fn enqueue(&self, file_bucket: &str, request: PackRequest) -> OfferResult<()> {
        let sender = self.senders.get(file_bucket).ok_or_else(|| {
            OfferError::BadRequest(format!("unknown file bucket {file_bucket}"))
        })?;
        sender
            .send(Command::Pack(request))
            .map_err(|_| OfferError::Technical(format!("builder for {file_bucket} is gone")))
    }

    /// Seal the bucket's open tar regardless of fill level, so long-tail
    /// writes reach tape promptly. No-op when nothing is open.
    pub async fn drain(&self, file_bucket: &str) -> OfferResult<()> {
        let sender = self.senders.get(file_bucket).ok_or_else(|| {
            OfferError::BadRequest(format!("unknown file bucket {file_bucket}"))
        })?;
        let (tx, rx) = oneshot::channel();
        sender
            .send(Command::Drain(tx))
            .map_err(|_| OfferError::Technical(format!("builder for {file_bucket} is gone")))?;
        rx.await
            .map_err(|_| OfferError::Technical(format!("builder for {file_bucket} died")))?
    }

    /// Drain every bucket's open tar.
    pub async fn drain_all(&self) -> OfferResult<()> {
        let buckets: Vec<String> = self.senders.keys().cloned().collect();
        for file_bucket in buckets {
            self.drain(&file_bucket).await?;
        }
        Ok(())
    }
}

impl Drop for TarBuilderManager {
    fn drop(&mut self) {
        self.senders.clear();
        for worker in &self.workers {
            worker.abort();
        }
    }
}

/// Re-queue write orders for sealed tars still on disk. Runs at startup;
/// covers the crash window between sealing and the tape write.
async fn resubmit_ready_archives(
    store: &Arc<dyn ReferentialStore>,
    tar_storage: &Arc<TarFileStorage>,
    topology: &Arc<BucketTopology>,
    drive_pool: &Arc<DrivePool>,
) -> OfferResult<()> {
    for archive in store.list_ready_archives().await? {
        let tar_path = tar_storage.sealed_path(&archive.file_bucket, &archive.tar_id)?;
        if !tokio::fs::try_exists(&tar_path).await? {
            error!(
                tar_id = %archive.tar_id,
                "sealed tar missing from disk, cannot re-queue tape write"
            );
            continue;
        }
        let Some(size) = archive.size else {
            error!(tar_id = %archive.tar_id, "sealed tar has no recorded size");
            continue;
        };

        info!(tar_id = %archive.tar_id, "re-queueing sealed tar for tape archival");
        drive_pool.submit_write(WriteOrder {
            tar_id: archive.tar_id.clone(),
            file_bucket: archive.file_bucket.clone(),
            bucket: topology.bucket_of(&archive.file_bucket)?,
            size: size as u64,
            tar_path,
        });
    }
    Ok(())
}

struct OpenTar {
    tar_id: String,
    file: Option<std::fs::File>,
    written: u64,
    entry_count: u64,
}

struct BucketWorker {
    file_bucket: String,
    bucket: String,
    store: Arc<dyn ReferentialStore>,
    input_files: Arc<InputFileStorage>,
    tar_storage: Arc<TarFileStorage>,
    drive_pool: Arc<DrivePool>,
    config: TarBuilderConfig,
    open: Option<OpenTar>,
}

impl BucketWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Pack(request) => {
                    if let Err(e) = self.pack(&request).await {
                        error!(
                            file_bucket = %self.file_bucket,
                            object_id = %request.object_id,
                            error = %e,
                            "packing failed, object stays as input file"
                        );
                    }
                }
                Command::Drain(reply) => {
                    let result = self.seal_if_open().await;
                    let _ = reply.send(result);
                }
            }
        }
    }

    async fn pack(&mut self, request: &PackRequest) -> OfferResult<()> {
        let input_path = self
            .input_files
            .file_path(&request.container, &request.storage_id)?;
        if !tokio::fs::try_exists(&input_path).await? {
            // Deleted or superseded since the request was queued.
            warn!(
                object_id = %request.object_id,
                storage_id = %request.storage_id,
                "input file vanished before packing"
            );
            return Ok(());
        }

        self.ensure_open_tar().await?;
        let mut open = self.open.take().ok_or_else(|| {
            OfferError::Technical("no open tar after ensure_open_tar".to_string())
        })?;

        // Append on a blocking thread; the file moves in and out of the
        // closure.
        let file = open.file.take().ok_or_else(|| {
            OfferError::Technical(format!("open tar {} lost its file handle", open.tar_id))
        })?;
        let tar_id = open.tar_id.clone();
        let offset = open.written;
        let size = request.size;
        let max_entry_size = self.config.max_entry_size;
        let algorithm = request.digest_algorithm;

        let append = tokio::task::spawn_blocking(move || {
            append_chunked(file, &tar_id, input_path, offset, size, max_entry_size, algorithm)
        })
        .await
        .map_err(|e| OfferError::Technical(format!("tar append task failed: {e}")))?;

        let (file, entries, appended) = match append {
            Ok(ok) => ok,
            Err((file, e)) => {
                // Roll the building tar back to the last entry boundary so
                // the partial append leaves no garbage behind.
                let rollback = file
                    .set_len(open.written)
                    .and_then(|_| {
                        use std::io::Seek;
                        let mut file = file;
                        file.seek(std::io::SeekFrom::End(0))?;
                        Ok(file)
                    });
                match rollback {
                    Ok(file) => {
                        open.file = Some(file);
                        self.open = Some(open);
                    }
                    Err(rollback_error) => {
                        error!(
                            tar_id = %open.tar_id,
                            error = %rollback_error,
                            "could not roll back partial append, discarding open tar handle"
                        );
                    }
                }
                return Err(e.into());
            }
        };
        open.file = Some(file);
        open.written += appended;
        open.entry_count += entries.len() as u64;
        self.open = Some(open);

        let updated = self
            .store
            .set_packed_location(
                &request.container,
                &request.object_id,
                &request.storage_id,
                &entries,
            )
            .await?;
        if !updated {
            // Object deleted or overwritten while queued; the appended bytes
            // are garbage reclaimed by compaction.
            warn!(
                object_id = %request.object_id,
                storage_id = %request.storage_id,
                "object superseded during packing, tar entries orphaned"
            );
        }
        self.input_files
            .delete_file(&request.container, &request.storage_id)
            .await?;

        if self.open.as_ref().is_some_and(|o| o.written >= self.config.max_tar_size) {
            self.seal_if_open().await?;
        }
        Ok(())
    }

    async fn ensure_open_tar(&mut self) -> OfferResult<()> {
        if self.open.is_some() {
            return Ok(());
        }

        let tar_id = new_tar_id(time::OffsetDateTime::now_utc());
        self.store.insert_archive(&tar_id, &self.file_bucket).await?;

        let path = self.tar_storage.building_path(&self.file_bucket, &tar_id)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = std::fs::File::create(&path)?;

        info!(file_bucket = %self.file_bucket, tar_id = %tar_id, "opened new tar");
        self.open = Some(OpenTar {
            tar_id,
            file: Some(file),
            written: 0,
            entry_count: 0,
        });
        Ok(())
    }

    async fn seal_if_open(&mut self) -> OfferResult<()> {
        let Some(open) = self.open.take() else {
            return Ok(());
        };
        if open.entry_count == 0 {
            // Nothing packed yet; keep the empty building tar for reuse.
            self.open = Some(open);
            return Ok(());
        }

        let mut file = open.file.ok_or_else(|| {
            OfferError::Technical(format!("open tar {} lost its file handle", open.tar_id))
        })?;
        let total_size = tokio::task::spawn_blocking(move || -> std::io::Result<u64> {
            entry::write_trailer(&mut file)?;
            file.flush()?;
            file.sync_all()?;
            Ok(file.metadata()?.len())
        })
        .await
        .map_err(|e| OfferError::Technical(format!("tar seal task failed: {e}")))??;

        let sealed_path = self
            .tar_storage
            .seal_tar(&self.file_bucket, &open.tar_id)
            .await?;
        self.store.seal_archive(&open.tar_id, total_size).await?;

        info!(
            file_bucket = %self.file_bucket,
            tar_id = %open.tar_id,
            size = total_size,
            entries = open.entry_count,
            "sealed tar, queueing tape write"
        );
        self.drive_pool.submit_write(WriteOrder {
            tar_id: open.tar_id,
            file_bucket: self.file_bucket.clone(),
            bucket: self.bucket.clone(),
            size: total_size,
            tar_path: sealed_path,
        });
        Ok(())
    }
}

type AppendOk = (std::fs::File, Vec<TarEntryDescription>, u64);

/// Append an input file as one or more tar entries (chunked at
/// `max_entry_size`), returning the entry descriptions and bytes appended.
/// On failure the file handle is returned alongside the error so the caller
/// can seal the tar.
#[allow(clippy::type_complexity)]
fn append_chunked(
    mut file: std::fs::File,
    tar_id: &str,
    input_path: std::path::PathBuf,
    start_offset: u64,
    size: u64,
    max_entry_size: u64,
    algorithm: bobine_core::DigestAlgorithm,
) -> Result<AppendOk, (std::fs::File, std::io::Error)> {
    let mut input = match std::fs::File::open(&input_path) {
        Ok(input) => input,
        Err(e) => return Err((file, e)),
    };

    let mut entries = Vec::new();
    let mut offset = start_offset;
    let mut remaining = size;
    let mut index = 0u32;

    loop {
        let chunk = remaining.min(max_entry_size);
        let entry_name = format!("{}-{index}", uuid::Uuid::new_v4());

        let mut hashing = HashingReader {
            inner: (&mut input).take(chunk),
            hasher: Hasher::new(algorithm),
        };
        if let Err(e) = entry::append_entry(&mut file, &entry_name, &mut hashing, chunk) {
            return Err((file, e));
        }

        entries.push(TarEntryDescription {
            tar_id: tar_id.to_string(),
            entry_name,
            offset,
            size: chunk,
            digest: hashing.hasher.finalize(),
        });
        offset += entry::entry_footprint(chunk);
        remaining -= chunk;
        index += 1;

        if remaining == 0 {
            break;
        }
    }

    if let Err(e) = file.flush().and_then(|_| file.sync_data()) {
        return Err((file, e));
    }
    Ok((file, entries, offset - start_offset))
}

struct HashingReader<R> {
    inner: R,
    hasher: Hasher,
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}
