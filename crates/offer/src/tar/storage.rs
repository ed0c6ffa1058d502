//! On-disk storage of building and sealed tars awaiting tape archival.
//!
//! Layout: `{root}/{file_bucket}/{tar_id}.tmp` while building,
//! `{root}/{file_bucket}/{tar_id}` once sealed. Both remain readable; the
//! sealed copy is deleted by the drive worker after the tape write.

use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::{OfferError, OfferResult};
use crate::file_storage::check_path_component;

const BUILDING_SUFFIX: &str = ".tmp";

/// Store for tars not yet (fully) on tape.
pub struct TarFileStorage {
    root: PathBuf,
}

impl TarFileStorage {
    pub async fn new(root: impl AsRef<Path>) -> OfferResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn building_path(&self, file_bucket: &str, tar_id: &str) -> OfferResult<PathBuf> {
        check_path_component(file_bucket)?;
        check_path_component(tar_id)?;
        Ok(self
            .root
            .join(file_bucket)
            .join(format!("{tar_id}{BUILDING_SUFFIX}")))
    }

    pub fn sealed_path(&self, file_bucket: &str, tar_id: &str) -> OfferResult<PathBuf> {
        check_path_component(file_bucket)?;
        check_path_component(tar_id)?;
        Ok(self.root.join(file_bucket).join(tar_id))
    }

    /// Open a tar for read: the sealed copy if present, else the building
    /// one. Entries already flushed to a building tar are readable.
    pub async fn try_open_tar(
        &self,
        file_bucket: &str,
        tar_id: &str,
    ) -> OfferResult<Option<fs::File>> {
        for path in [
            self.sealed_path(file_bucket, tar_id)?,
            self.building_path(file_bucket, tar_id)?,
        ] {
            match fs::File::open(&path).await {
                Ok(file) => return Ok(Some(file)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Whether the tar is present on disk (building or sealed).
    pub async fn contains_tar(&self, file_bucket: &str, tar_id: &str) -> OfferResult<bool> {
        Ok(fs::try_exists(self.sealed_path(file_bucket, tar_id)?).await?
            || fs::try_exists(self.building_path(file_bucket, tar_id)?).await?)
    }

    /// Atomically promote a building tar to sealed. Returns the sealed path.
    pub async fn seal_tar(&self, file_bucket: &str, tar_id: &str) -> OfferResult<PathBuf> {
        let building = self.building_path(file_bucket, tar_id)?;
        let sealed = self.sealed_path(file_bucket, tar_id)?;
        if !fs::try_exists(&building).await? {
            return Err(OfferError::NotFound(format!(
                "building tar {file_bucket}/{tar_id}"
            )));
        }
        fs::rename(&building, &sealed).await?;
        Ok(sealed)
    }
}
