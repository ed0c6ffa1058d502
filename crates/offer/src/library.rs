//! Tape library abstraction.
//!
//! [`TapeLibrary`] is the seam to the physical robot/drive hardware. The
//! in-tree [`VirtualTapeLibrary`] emulates a library on the local filesystem
//! (one directory per tape, one file per tape position) and supports fault
//! injection; it backs every test and doubles as a development backend.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::fs;
use tracing::debug;

use crate::error::{OfferError, OfferResult};
use crate::file_storage::check_path_component;

/// Driver interface to the tape hardware.
///
/// One logical operation runs per drive at a time; the drive pool enforces
/// this, the library only checks mount consistency.
#[async_trait]
pub trait TapeLibrary: Send + Sync {
    /// Mount a tape into a drive. Fails if the tape is already mounted in
    /// another drive or the drive is occupied.
    async fn load_tape(&self, drive_index: u32, tape_code: &str) -> OfferResult<()>;

    /// Unmount the tape currently in a drive, returning it to its slot.
    async fn unload_tape(&self, drive_index: u32, tape_code: &str) -> OfferResult<()>;

    /// Write the file at `source` to the given tape file position. Returns
    /// the number of bytes written.
    async fn write_file(
        &self,
        drive_index: u32,
        file_position: u64,
        source: &Path,
    ) -> OfferResult<u64>;

    /// Read the file at the given tape position into `dest`. Returns the
    /// number of bytes read.
    async fn read_file(
        &self,
        drive_index: u32,
        file_position: u64,
        dest: &Path,
    ) -> OfferResult<u64>;
}

/// Filesystem-backed tape library emulation.
pub struct VirtualTapeLibrary {
    root: PathBuf,
    /// drive index -> mounted tape code.
    mounted: Mutex<HashMap<u32, String>>,
    /// Simulated mount/IO latency.
    latency: Duration,
    /// Remaining injected write faults.
    write_faults: AtomicU32,
    /// Remaining injected read faults.
    read_faults: AtomicU32,
}

impl VirtualTapeLibrary {
    pub async fn new(root: impl AsRef<Path>, latency: Duration) -> OfferResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            mounted: Mutex::new(HashMap::new()),
            latency,
            write_faults: AtomicU32::new(0),
            read_faults: AtomicU32::new(0),
        })
    }

    /// Provision a new (blank) tape cartridge.
    pub async fn add_tape(&self, tape_code: &str) -> OfferResult<()> {
        check_path_component(tape_code)?;
        fs::create_dir_all(self.root.join(tape_code)).await?;
        Ok(())
    }

    /// Make the next `count` writes fail with a mechanical error.
    pub fn inject_write_faults(&self, count: u32) {
        self.write_faults.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` reads fail with a mechanical error.
    pub fn inject_read_faults(&self, count: u32) {
        self.read_faults.store(count, Ordering::SeqCst);
    }

    fn position_path(&self, tape_code: &str, file_position: u64) -> PathBuf {
        self.root.join(tape_code).join(format!("{file_position:08}"))
    }

    fn mounted_tape(&self, drive_index: u32) -> OfferResult<String> {
        let mounted = self.mounted.lock().unwrap_or_else(|e| e.into_inner());
        mounted.get(&drive_index).cloned().ok_or_else(|| {
            OfferError::Technical(format!("no tape mounted in drive {drive_index}"))
        })
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl TapeLibrary for VirtualTapeLibrary {
    async fn load_tape(&self, drive_index: u32, tape_code: &str) -> OfferResult<()> {
        check_path_component(tape_code)?;
        tokio::time::sleep(self.latency).await;

        if !self.root.join(tape_code).is_dir() {
            return Err(OfferError::NotFound(format!("tape {tape_code}")));
        }

        let mut mounted = self.mounted.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(occupant) = mounted.get(&drive_index) {
            return Err(OfferError::Technical(format!(
                "drive {drive_index} already holds tape {occupant}"
            )));
        }
        if mounted.values().any(|code| code == tape_code) {
            return Err(OfferError::Technical(format!(
                "tape {tape_code} already mounted in another drive"
            )));
        }
        mounted.insert(drive_index, tape_code.to_string());
        debug!(drive_index, tape_code, "tape loaded");
        Ok(())
    }

    async fn unload_tape(&self, drive_index: u32, tape_code: &str) -> OfferResult<()> {
        tokio::time::sleep(self.latency).await;

        let mut mounted = self.mounted.lock().unwrap_or_else(|e| e.into_inner());
        match mounted.get(&drive_index) {
            Some(occupant) if occupant == tape_code => {
                mounted.remove(&drive_index);
                debug!(drive_index, tape_code, "tape unloaded");
                Ok(())
            }
            Some(occupant) => Err(OfferError::Technical(format!(
                "drive {drive_index} holds tape {occupant}, not {tape_code}"
            ))),
            None => Err(OfferError::Technical(format!("drive {drive_index} is empty"))),
        }
    }

    async fn write_file(
        &self,
        drive_index: u32,
        file_position: u64,
        source: &Path,
    ) -> OfferResult<u64> {
        let tape_code = self.mounted_tape(drive_index)?;
        tokio::time::sleep(self.latency).await;

        if Self::take_fault(&self.write_faults) {
            return Err(OfferError::Technical(format!(
                "mechanical write fault on tape {tape_code}"
            )));
        }

        let dest = self.position_path(&tape_code, file_position);
        if fs::try_exists(&dest).await? {
            return Err(OfferError::Technical(format!(
                "tape {tape_code} position {file_position} already written"
            )));
        }
        let written = fs::copy(source, &dest).await?;
        Ok(written)
    }

    async fn read_file(
        &self,
        drive_index: u32,
        file_position: u64,
        dest: &Path,
    ) -> OfferResult<u64> {
        let tape_code = self.mounted_tape(drive_index)?;
        tokio::time::sleep(self.latency).await;

        if Self::take_fault(&self.read_faults) {
            return Err(OfferError::Technical(format!(
                "mechanical read fault on tape {tape_code}"
            )));
        }

        let source = self.position_path(&tape_code, file_position);
        if !fs::try_exists(&source).await? {
            return Err(OfferError::NotFound(format!(
                "tape {tape_code} position {file_position}"
            )));
        }
        let read = fs::copy(&source, dest).await?;
        Ok(read)
    }
}
