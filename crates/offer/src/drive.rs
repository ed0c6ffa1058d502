//! Drive pool: bounded set of tape drive workers.
//!
//! Each physical drive is owned by one worker task consuming its own order
//! queue; orders are dispatched at submission to the drive whose mounted
//! tape (or tape bucket) matches, falling back to the least-loaded drive.
//! Within a drive, orders execute in arrival order; drives proceed in
//! parallel.
//!
//! Write orders archive a sealed tar to a tape of the tar's bucket; read
//! orders stage a tar from tape into the disk cache. Failed orders are
//! retried with exponential backoff up to a bounded attempt count; a
//! mechanical fault marks the tape `corrupted`, excluding it from further
//! allocation. Read order completion is reported on the staging event
//! channel consumed by the access request manager.

use rand::Rng;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::fs;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::ArchiveCacheStorage;
use crate::error::{OfferError, OfferResult};
use crate::library::TapeLibrary;
use bobine_core::config::DrivePoolConfig;
use bobine_core::TapeState;
use bobine_referential::models::TapeRow;
use bobine_referential::ReferentialStore;

/// Order to archive a sealed on-disk tar to tape.
#[derive(Debug, Clone)]
pub struct WriteOrder {
    pub tar_id: String,
    pub file_bucket: String,
    pub bucket: String,
    pub size: u64,
    pub tar_path: PathBuf,
}

/// Order to stage a tar from tape back into the disk cache.
#[derive(Debug, Clone)]
pub struct ReadOrder {
    pub tar_id: String,
    pub file_bucket: String,
    pub tape_code: String,
    pub file_position: u64,
    pub size: u64,
}

/// Completion notification of a read (staging) order.
#[derive(Debug)]
pub struct StagingEvent {
    pub tar_id: String,
    pub file_bucket: String,
    pub outcome: Result<(), String>,
}

#[derive(Debug)]
enum Order {
    Write(WriteOrder),
    Read(ReadOrder),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Queued,
    Started,
    Cancelled,
}

/// Dispatch state shared between the pool handle and the workers.
#[derive(Default)]
struct RouteTable {
    /// tape code -> drive currently holding it mounted.
    mounted_tape: HashMap<String, u32>,
    /// drive -> bucket of its mounted tape.
    mounted_bucket: HashMap<u32, String>,
    /// Pending order count per drive.
    queue_depth: HashMap<u32, usize>,
}

/// Bounded pool of drive workers.
pub struct DrivePool {
    queues: Vec<mpsc::UnboundedSender<Order>>,
    routes: Arc<StdMutex<RouteTable>>,
    read_state: Arc<StdMutex<HashMap<String, ReadState>>>,
    workers: Vec<JoinHandle<()>>,
}

impl DrivePool {
    /// Spawn the drive workers. Returns the pool handle and the staging
    /// event channel.
    pub fn new(
        store: Arc<dyn ReferentialStore>,
        library: Arc<dyn TapeLibrary>,
        cache: Arc<ArchiveCacheStorage>,
        config: DrivePoolConfig,
        work_dir: PathBuf,
    ) -> (Self, mpsc::UnboundedReceiver<StagingEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let routes = Arc::new(StdMutex::new(RouteTable::default()));
        let read_state = Arc::new(StdMutex::new(HashMap::new()));

        let mut queues = Vec::new();
        let mut workers = Vec::new();
        for drive_index in 0..config.drive_count {
            let (tx, mut rx) = mpsc::unbounded_channel::<Order>();
            queues.push(tx);

            let mut worker = DriveWorker {
                drive_index,
                store: Arc::clone(&store),
                library: Arc::clone(&library),
                cache: Arc::clone(&cache),
                config: config.clone(),
                work_dir: work_dir.clone(),
                mounted: None,
                events: event_tx.clone(),
                routes: Arc::clone(&routes),
                read_state: Arc::clone(&read_state),
            };
            workers.push(tokio::spawn(async move {
                while let Some(order) = rx.recv().await {
                    worker.process(order).await;
                    worker.note_order_done();
                }
            }));
        }

        (
            Self {
                queues,
                routes,
                read_state,
                workers,
            },
            event_rx,
        )
    }

    /// Queue a write order on the drive already serving the tar's bucket,
    /// or the least-loaded drive.
    pub fn submit_write(&self, order: WriteOrder) {
        let drive = self.pick_drive(None, Some(&order.bucket));
        self.dispatch(drive, Order::Write(order));
    }

    /// Queue a read order unless one for the same tar is already queued or
    /// in flight. Returns `true` when the order is (still) scheduled.
    pub fn submit_read_if_absent(&self, order: ReadOrder) -> bool {
        {
            let mut state = self.read_state.lock().unwrap_or_else(|e| e.into_inner());
            match state.get(&order.tar_id) {
                Some(ReadState::Queued) | Some(ReadState::Started) => {
                    debug!(tar_id = %order.tar_id, "read order already scheduled");
                    return true;
                }
                Some(ReadState::Cancelled) => {
                    // The queued order has not been consumed yet; revive it.
                    state.insert(order.tar_id.clone(), ReadState::Queued);
                    return true;
                }
                None => {
                    state.insert(order.tar_id.clone(), ReadState::Queued);
                }
            }
        }
        let drive = self.pick_drive(Some(&order.tape_code), None);
        self.dispatch(drive, Order::Read(order));
        true
    }

    /// Cancel a queued read order if its execution has not started.
    /// An in-flight staging is abandoned instead: it finishes and leaves an
    /// unpinned, evictable cache entry.
    pub fn try_cancel_read(&self, tar_id: &str) -> bool {
        let mut state = self.read_state.lock().unwrap_or_else(|e| e.into_inner());
        match state.get(tar_id) {
            Some(ReadState::Queued) => {
                state.insert(tar_id.to_string(), ReadState::Cancelled);
                true
            }
            _ => false,
        }
    }

    fn pick_drive(&self, tape_code: Option<&str>, bucket: Option<&str>) -> u32 {
        let routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(tape_code) = tape_code {
            if let Some(drive) = routes.mounted_tape.get(tape_code) {
                return *drive;
            }
        }
        if let Some(bucket) = bucket {
            if let Some((drive, _)) = routes
                .mounted_bucket
                .iter()
                .find(|(_, mounted)| mounted.as_str() == bucket)
            {
                return *drive;
            }
        }

        (0..self.queues.len() as u32)
            .min_by_key(|drive| routes.queue_depth.get(drive).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn dispatch(&self, drive: u32, order: Order) {
        {
            let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
            *routes.queue_depth.entry(drive).or_insert(0) += 1;
        }
        if self.queues[drive as usize].send(order).is_err() {
            error!(drive, "drive worker is gone, dropping order");
        }
    }
}

impl Drop for DrivePool {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

struct MountedTape {
    code: String,
    bucket: String,
    home_slot: u32,
}

struct DriveWorker {
    drive_index: u32,
    store: Arc<dyn ReferentialStore>,
    library: Arc<dyn TapeLibrary>,
    cache: Arc<ArchiveCacheStorage>,
    config: DrivePoolConfig,
    work_dir: PathBuf,
    mounted: Option<MountedTape>,
    events: mpsc::UnboundedSender<StagingEvent>,
    routes: Arc<StdMutex<RouteTable>>,
    read_state: Arc<StdMutex<HashMap<String, ReadState>>>,
}

impl DriveWorker {
    async fn process(&mut self, order: Order) {
        match order {
            Order::Write(order) => self.process_write(order).await,
            Order::Read(order) => self.process_read(order).await,
        }
    }

    fn note_order_done(&self) {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(depth) = routes.queue_depth.get_mut(&self.drive_index) {
            *depth = depth.saturating_sub(1);
        }
    }

    fn note_mounted(&self, tape_code: &str, bucket: &str) {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        routes
            .mounted_tape
            .insert(tape_code.to_string(), self.drive_index);
        routes
            .mounted_bucket
            .insert(self.drive_index, bucket.to_string());
    }

    fn note_unmounted(&self, tape_code: &str) {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        routes.mounted_tape.remove(tape_code);
        routes.mounted_bucket.remove(&self.drive_index);
    }

    async fn process_write(&mut self, order: WriteOrder) {
        for attempt in 1..=self.config.max_order_attempts {
            match self.execute_write(&order).await {
                Ok(()) => {
                    info!(
                        drive = self.drive_index,
                        tar_id = %order.tar_id,
                        "archived tar to tape"
                    );
                    return;
                }
                Err(e) if attempt < self.config.max_order_attempts => {
                    warn!(
                        drive = self.drive_index,
                        tar_id = %order.tar_id,
                        attempt,
                        error = %e,
                        "tar archival failed, retrying"
                    );
                    self.backoff(attempt).await;
                }
                Err(e) => {
                    // The tar stays ready-on-disk; it is re-queued at next
                    // startup from the archive referential.
                    error!(
                        drive = self.drive_index,
                        tar_id = %order.tar_id,
                        error = %e,
                        "tar archival failed permanently"
                    );
                    return;
                }
            }
        }
    }

    async fn execute_write(&mut self, order: &WriteOrder) -> OfferResult<()> {
        let tape = self.ensure_writable_tape(&order.bucket, order.size).await?;

        if let Err(e) = self
            .library
            .write_file(self.drive_index, tape.file_position as u64, &order.tar_path)
            .await
        {
            self.quarantine_mounted_tape().await;
            return Err(e);
        }

        self.store
            .set_on_tape(&order.tar_id, &tape.tape_code, tape.file_position as u64)
            .await?;
        self.store
            .record_tape_write(&tape.tape_code, order.size)
            .await?;

        if tape.written_bytes + order.size as i64 >= tape.capacity {
            info!(tape_code = %tape.tape_code, "tape capacity reached, marking full");
            self.store
                .set_tape_state(&tape.tape_code, TapeState::Full)
                .await?;
        }

        // The tar now lives on tape; move the local copy into the cache so
        // recently archived objects stay immediately readable. Under cache
        // pressure the copy is simply dropped.
        self.move_archived_tar_to_cache(order).await;
        Ok(())
    }

    async fn move_archived_tar_to_cache(&self, order: &WriteOrder) {
        let admitted = match self
            .cache
            .reserve_archive_space(&order.file_bucket, &order.tar_id, order.size)
        {
            Ok(()) => {
                match self
                    .cache
                    .move_archive_into_cache(&order.tar_path, &order.file_bucket, &order.tar_id)
                    .await
                {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(tar_id = %order.tar_id, error = %e, "could not move archived tar into cache");
                        if let Err(e) = self
                            .cache
                            .cancel_reserved_archive(&order.file_bucket, &order.tar_id)
                        {
                            warn!(tar_id = %order.tar_id, error = %e, "could not cancel cache reservation");
                        }
                        false
                    }
                }
            }
            Err(e) => {
                warn!(tar_id = %order.tar_id, error = %e, "no cache room for archived tar");
                false
            }
        };

        if !admitted {
            if let Err(e) = fs::remove_file(&order.tar_path).await {
                warn!(tar_id = %order.tar_id, error = %e, "could not delete archived tar file");
            }
        }
    }

    /// Mount (keeping the current tape when possible) a writable tape of the
    /// bucket with room for `size` bytes, and return its fresh catalog row.
    async fn ensure_writable_tape(&mut self, bucket: &str, size: u64) -> OfferResult<TapeRow> {
        loop {
            if let Some(mounted) = &self.mounted {
                if mounted.bucket == bucket {
                    let row = self
                        .store
                        .get_tape(&mounted.code)
                        .await?
                        .ok_or_else(|| OfferError::NotFound(format!("tape {}", mounted.code)))?;
                    let state = row.state()?;
                    if state.is_writable() && row.remaining_capacity() >= size as i64 {
                        let row = self.label_tape_if_needed(row).await?;
                        return Ok(row);
                    }
                    if state == TapeState::Open {
                        info!(tape_code = %row.tape_code, "tape too full for order, marking full");
                        self.store
                            .set_tape_state(&row.tape_code, TapeState::Full)
                            .await?;
                    } else if state == TapeState::Empty {
                        // A blank tape that cannot hold the tar would make
                        // the claim loop spin forever.
                        return Err(OfferError::Technical(format!(
                            "tar of {size} bytes exceeds capacity of blank tape {}",
                            row.tape_code
                        )));
                    }
                }
                self.unmount_current().await?;
                continue;
            }

            let Some(row) = self
                .store
                .claim_writable_tape(bucket, self.drive_index)
                .await?
            else {
                return Err(OfferError::Technical(format!(
                    "no writable tape available for bucket {bucket}"
                )));
            };

            if let Err(e) = self.library.load_tape(self.drive_index, &row.tape_code).await {
                self.store
                    .release_tape(&row.tape_code, row.home_slot as u32)
                    .await?;
                return Err(e);
            }
            self.note_mounted(&row.tape_code, &row.bucket);
            self.mounted = Some(MountedTape {
                code: row.tape_code.clone(),
                bucket: row.bucket.clone(),
                home_slot: row.home_slot as u32,
            });
        }
    }

    /// Write the tape label (position 0) on a fresh tape and open it.
    async fn label_tape_if_needed(&mut self, row: TapeRow) -> OfferResult<TapeRow> {
        if row.label_written {
            return Ok(row);
        }

        let label = serde_json::json!({
            "tape_code": row.tape_code,
            "bucket": row.bucket,
            "labelled_at": time::OffsetDateTime::now_utc().to_string(),
        })
        .to_string();
        let label_path = self.work_dir.join(format!("{}.label", row.tape_code));
        fs::write(&label_path, label.as_bytes()).await?;

        let write_result = self
            .library
            .write_file(self.drive_index, row.file_position as u64, &label_path)
            .await;
        let _ = fs::remove_file(&label_path).await;

        if let Err(e) = write_result {
            self.quarantine_mounted_tape().await;
            return Err(e);
        }

        self.store
            .record_tape_write(&row.tape_code, label.len() as u64)
            .await?;
        self.store.set_label_written(&row.tape_code).await?;
        self.store
            .set_tape_state(&row.tape_code, TapeState::Open)
            .await?;

        self.store
            .get_tape(&row.tape_code)
            .await?
            .ok_or_else(|| OfferError::NotFound(format!("tape {}", row.tape_code)))
    }

    async fn process_read(&mut self, order: ReadOrder) {
        // Consume the cancellation mark, if any.
        {
            let mut state = self.read_state.lock().unwrap_or_else(|e| e.into_inner());
            match state.get(&order.tar_id) {
                Some(ReadState::Cancelled) => {
                    state.remove(&order.tar_id);
                    debug!(tar_id = %order.tar_id, "read order cancelled before start");
                    return;
                }
                _ => {
                    state.insert(order.tar_id.clone(), ReadState::Started);
                }
            }
        }

        let mut last_error = None;
        for attempt in 1..=self.config.max_order_attempts {
            match self.execute_read(&order).await {
                Ok(()) => {
                    info!(
                        drive = self.drive_index,
                        tar_id = %order.tar_id,
                        "staged tar into cache"
                    );
                    self.finish_read(&order, Ok(()));
                    return;
                }
                Err(e) if attempt < self.config.max_order_attempts => {
                    warn!(
                        drive = self.drive_index,
                        tar_id = %order.tar_id,
                        attempt,
                        error = %e,
                        "tar staging failed, retrying"
                    );
                    self.backoff(attempt).await;
                    last_error = Some(e);
                }
                Err(e) => {
                    error!(
                        drive = self.drive_index,
                        tar_id = %order.tar_id,
                        error = %e,
                        "tar staging failed permanently"
                    );
                    // Only a drive fault on the order's own tape quarantines
                    // it; cache pressure is not a tape problem.
                    let tape_fault = matches!(e, OfferError::Technical(_) | OfferError::Io(_))
                        && self
                            .mounted
                            .as_ref()
                            .is_some_and(|mounted| mounted.code == order.tape_code);
                    if tape_fault {
                        self.quarantine_mounted_tape().await;
                    }
                    last_error = Some(e);
                    break;
                }
            }
        }

        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "staging aborted".to_string());
        self.finish_read(&order, Err(message));
    }

    fn finish_read(&self, order: &ReadOrder, outcome: Result<(), String>) {
        self.read_state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&order.tar_id);
        let _ = self.events.send(StagingEvent {
            tar_id: order.tar_id.clone(),
            file_bucket: order.file_bucket.clone(),
            outcome,
        });
    }

    async fn execute_read(&mut self, order: &ReadOrder) -> OfferResult<()> {
        // Staged meanwhile by a concurrent order: nothing to do.
        if self.cache.contains_archive(&order.file_bucket, &order.tar_id) {
            return Ok(());
        }

        match self
            .cache
            .reserve_archive_space(&order.file_bucket, &order.tar_id, order.size)
        {
            Ok(()) => {}
            Err(OfferError::CapacityExceeded(message)) => {
                // Give the eviction sweep a chance before the retry.
                self.cache.wait_for_eviction().await;
                return Err(OfferError::CapacityExceeded(message));
            }
            Err(e) => return Err(e),
        }

        let result = self.stage_into_reservation(order).await;
        if result.is_err() {
            self.cache
                .cancel_reserved_archive(&order.file_bucket, &order.tar_id)?;
        }
        result
    }

    async fn stage_into_reservation(&mut self, order: &ReadOrder) -> OfferResult<()> {
        if let Some(mounted) = &self.mounted {
            if mounted.code != order.tape_code {
                self.unmount_current().await?;
            }
        }
        if self.mounted.is_none() {
            let Some(row) = self.store.claim_tape(&order.tape_code, self.drive_index).await?
            else {
                return Err(OfferError::Technical(format!(
                    "tape {} is mounted in another drive",
                    order.tape_code
                )));
            };
            if let Err(e) = self.library.load_tape(self.drive_index, &row.tape_code).await {
                self.store
                    .release_tape(&row.tape_code, row.home_slot as u32)
                    .await?;
                return Err(e);
            }
            self.note_mounted(&row.tape_code, &row.bucket);
            self.mounted = Some(MountedTape {
                code: row.tape_code.clone(),
                bucket: row.bucket.clone(),
                home_slot: row.home_slot as u32,
            });
        }

        let staged = self.cache.staging_dir().join(&order.tar_id);
        let read = self
            .library
            .read_file(self.drive_index, order.file_position, &staged)
            .await?;
        if read != order.size {
            let _ = fs::remove_file(&staged).await;
            return Err(OfferError::Technical(format!(
                "staged tar {} size mismatch: expected {}, read {read}",
                order.tar_id, order.size
            )));
        }

        self.cache
            .move_archive_into_cache(&staged, &order.file_bucket, &order.tar_id)
            .await
    }

    /// Mark the mounted tape corrupted after a mechanical fault and put it
    /// back in its slot.
    async fn quarantine_mounted_tape(&mut self) {
        let Some(mounted) = self.mounted.take() else {
            return;
        };
        warn!(tape_code = %mounted.code, "quarantining tape after mechanical fault");
        self.note_unmounted(&mounted.code);
        if let Err(e) = self
            .store
            .set_tape_state(&mounted.code, TapeState::Corrupted)
            .await
        {
            error!(tape_code = %mounted.code, error = %e, "could not mark tape corrupted");
        }
        if let Err(e) = self.library.unload_tape(self.drive_index, &mounted.code).await {
            error!(tape_code = %mounted.code, error = %e, "could not unload faulty tape");
        }
        if let Err(e) = self.store.release_tape(&mounted.code, mounted.home_slot).await {
            error!(tape_code = %mounted.code, error = %e, "could not release faulty tape");
        }
    }

    async fn unmount_current(&mut self) -> OfferResult<()> {
        if let Some(mounted) = self.mounted.take() {
            self.note_unmounted(&mounted.code);
            self.library
                .unload_tape(self.drive_index, &mounted.code)
                .await?;
            self.store
                .release_tape(&mounted.code, mounted.home_slot)
                .await?;
        }
        Ok(())
    }

    async fn backoff(&self, attempt: u32) {
        let base = self.config.retry_base_delay_ms;
        let exp = base.saturating_mul(1u64 << (attempt - 1).min(8));
        let jitter = rand::thread_rng().gen_range(0..=base);
        tokio::time::sleep(Duration::from_millis(exp + jitter)).await;
    }
}
