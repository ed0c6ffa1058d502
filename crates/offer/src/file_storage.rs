//! Input file staging area.
//!
//! Incoming objects are streamed to `{root}/{container}/{storage_id}` while
//! their digest is computed; they stay there, readable, until the tar
//! builder packs them and deletes the staged copy. Each write gets a fresh
//! storage id, so an overwrite never truncates a file a reader holds open.

use bobine_core::{DigestAlgorithm, Hasher, ObjectDigest};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::warn;

use crate::error::{OfferError, OfferResult};

const WRITE_CHUNK_SIZE: usize = 64 * 1024;

/// Disk staging area for not-yet-packed objects.
pub struct InputFileStorage {
    root: PathBuf,
}

impl InputFileStorage {
    pub async fn new(root: impl AsRef<Path>) -> OfferResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Stream an object to disk, computing its digest on the way. The file
    /// is flushed and synced before the storage id is returned; a crash
    /// before return leaves at most an orphan file.
    ///
    /// Fails with a digest-mismatch-style size error when the stream does
    /// not carry exactly `expected_size` bytes.
    pub async fn write_file<R>(
        &self,
        container: &str,
        storage_id: &str,
        algorithm: DigestAlgorithm,
        expected_size: u64,
        mut reader: R,
    ) -> OfferResult<ObjectDigest>
    where
        R: AsyncRead + Send + Unpin,
    {
        let path = self.file_path(container, storage_id)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(&path).await?;
        let mut hasher = Hasher::new(algorithm);
        let mut remaining = expected_size;
        let mut buf = vec![0u8; WRITE_CHUNK_SIZE];

        loop {
            let max = (remaining as usize).min(buf.len());
            if max == 0 {
                break;
            }
            let n = reader.read(&mut buf[..max]).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
            remaining -= n as u64;
        }

        if remaining > 0 {
            drop(file);
            let _ = fs::remove_file(&path).await;
            return Err(OfferError::BadRequest(format!(
                "truncated stream for {container}/{storage_id}: missing {remaining} bytes"
            )));
        }

        // Reject trailing bytes beyond the declared size.
        let mut probe = [0u8; 1];
        if reader.read(&mut probe).await? != 0 {
            drop(file);
            let _ = fs::remove_file(&path).await;
            return Err(OfferError::BadRequest(format!(
                "stream for {container}/{storage_id} exceeds declared size {expected_size}"
            )));
        }

        file.flush().await?;
        file.sync_all().await?;

        Ok(hasher.finalize())
    }

    /// Open a staged file for read.
    pub async fn read_file(&self, container: &str, storage_id: &str) -> OfferResult<fs::File> {
        let path = self.file_path(container, storage_id)?;
        match fs::File::open(&path).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(OfferError::NotFound(
                format!("input file {container}/{storage_id}"),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Full path of a staged file (used by the tar builder to pack it).
    pub fn file_path(&self, container: &str, storage_id: &str) -> OfferResult<PathBuf> {
        check_path_component(container)?;
        check_path_component(storage_id)?;
        Ok(self.root.join(container).join(storage_id))
    }

    /// Delete a staged file. Missing files are ignored (already packed).
    pub async fn delete_file(&self, container: &str, storage_id: &str) -> OfferResult<()> {
        let path = self.file_path(container, storage_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(container, storage_id, "input file already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Reject path components that could escape the storage root.
pub(crate) fn check_path_component(component: &str) -> OfferResult<()> {
    if component.is_empty()
        || component == "."
        || component == ".."
        || component.contains('/')
        || component.contains('\\')
        || component.contains('\0')
    {
        return Err(OfferError::BadRequest(format!(
            "unsafe path component: {component:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let temp = TempDir::new().unwrap();
        let storage = InputFileStorage::new(temp.path()).await.unwrap();

        let digest = storage
            .write_file("0_object", "obj1-a", DigestAlgorithm::Sha256, 5, &b"hello"[..])
            .await
            .unwrap();
        assert_eq!(digest, ObjectDigest::compute(DigestAlgorithm::Sha256, b"hello"));

        let mut file = storage.read_file("0_object", "obj1-a").await.unwrap();
        let mut content = Vec::new();
        file.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, b"hello");

        storage.delete_file("0_object", "obj1-a").await.unwrap();
        assert!(matches!(
            storage.read_file("0_object", "obj1-a").await,
            Err(OfferError::NotFound(_))
        ));
        // Idempotent delete.
        storage.delete_file("0_object", "obj1-a").await.unwrap();
    }

    #[tokio::test]
    async fn size_mismatch_is_rejected() {
        let temp = TempDir::new().unwrap();
        let storage = InputFileStorage::new(temp.path()).await.unwrap();

        let short = storage
            .write_file("0_object", "short", DigestAlgorithm::Sha256, 10, &b"hi"[..])
            .await;
        assert!(matches!(short, Err(OfferError::BadRequest(_))));

        let long = storage
            .write_file("0_object", "long", DigestAlgorithm::Sha256, 2, &b"hello"[..])
            .await;
        assert!(matches!(long, Err(OfferError::BadRequest(_))));
    }

    #[tokio::test]
    async fn rejects_path_traversal() {
        let temp = TempDir::new().unwrap();
        let storage = InputFileStorage::new(temp.path()).await.unwrap();
        assert!(storage.read_file("..", "x").await.is_err());
        assert!(storage.read_file("0_object", "../escape").await.is_err());
    }
}
