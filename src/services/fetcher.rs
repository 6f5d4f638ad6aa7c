//! Downloads objects into request-scoped scratch files.

use crate::services::blob_store::{BlobStore, BlobStoreError};
use futures::{StreamExt, pin_mut};
use std::{
    fs as std_fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, warn};
use uuid::Uuid;

const DEFAULT_SUFFIX: &str = ".jpg";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("object `{key}` not found in bucket `{bucket}`")]
    NotFound { bucket: String, key: String },
    #[error("download of `{bucket}/{key}` failed: {source}")]
    Download {
        bucket: String,
        key: String,
        #[source]
        source: BlobStoreError,
    },
}

impl FetchError {
    fn from_store(bucket: &str, key: &str, err: BlobStoreError) -> Self {
        if err.is_not_found() {
            Self::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }
        } else {
            Self::Download {
                bucket: bucket.to_string(),
                key: key.to_string(),
                source: err,
            }
        }
    }
}

/// A downloaded object on local disk. The file is removed when this is dropped.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
    size_bytes: u64,
}

impl ScratchFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        match std_fs::remove_file(&self.path) {
            Ok(()) => debug!("removed scratch file {}", self.path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!("could not remove scratch file {}: {}", self.path.display(), err),
        }
    }
}

/// Streams objects from a `BlobStore` into uniquely named files under `scratch_dir`.
#[derive(Clone)]
pub struct BlobFetcher {
    store: Arc<dyn BlobStore>,
    scratch_dir: PathBuf,
}

impl BlobFetcher {
    pub fn new(store: Arc<dyn BlobStore>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Download `bucket/key` to a fresh scratch file.
    ///
    /// The file keeps the object's extension so format sniffing has a hint.
    /// Bytes land in a hidden temp name first and are renamed once synced, so a
    /// failed download never leaves a partial file behind.
    pub async fn fetch(&self, bucket: &str, key: &str) -> Result<ScratchFile, FetchError> {
        let fail = |err: BlobStoreError| FetchError::from_store(bucket, key, err);

        let stream = self.store.open_object(bucket, key).await.map_err(fail)?;

        fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(|err| fail(err.into()))?;

        let name = Uuid::new_v4();
        let final_path = self
            .scratch_dir
            .join(format!("{}{}", name, scratch_suffix(key)));
        let tmp_path = self.scratch_dir.join(format!(".tmp-{}", name));
        let mut file = File::create(&tmp_path)
            .await
            .map_err(|err| fail(err.into()))?;

        let mut size_bytes: u64 = 0;
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(fail(err.into()));
                }
            };
            size_bytes += chunk.len() as u64;
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(fail(err.into()));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(fail(err.into()));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(fail(err.into()));
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(fail(err.into()));
        }

        debug!(
            "downloaded {}/{} ({} bytes) to {}",
            bucket,
            key,
            size_bytes,
            final_path.display()
        );
        Ok(ScratchFile {
            path: final_path,
            size_bytes,
        })
    }
}

/// Extension of the object's file name including the dot, or `.jpg`.
fn scratch_suffix(key: &str) -> String {
    Path::new(key)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext))
        .unwrap_or_else(|| DEFAULT_SUFFIX.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::blob_store::MemoryBlobStore;

    fn fetcher(dir: &Path) -> (Arc<MemoryBlobStore>, BlobFetcher) {
        let store = Arc::new(MemoryBlobStore::new());
        let fetcher = BlobFetcher::new(store.clone(), dir.join("scratch"));
        (store, fetcher)
    }

    #[test]
    fn suffix_follows_object_extension() {
        assert_eq!(scratch_suffix("uploads/a.png"), ".png");
        assert_eq!(scratch_suffix("uploads/a"), ".jpg");
        assert_eq!(scratch_suffix("uploads/.hidden"), ".jpg");
        assert_eq!(scratch_suffix("weights/best.onnx"), ".onnx");
    }

    #[tokio::test]
    async fn fetch_writes_unique_files_and_cleans_up_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let (store, fetcher) = fetcher(dir.path());
        store.put("scans", "u/a.png", &b"0123456789"[..]);

        let first = fetcher.fetch("scans", "u/a.png").await.unwrap();
        let second = fetcher.fetch("scans", "u/a.png").await.unwrap();
        assert_ne!(first.path(), second.path());
        assert_eq!(first.size_bytes(), 10);
        assert_eq!(std::fs::read(first.path()).unwrap(), b"0123456789");
        assert_eq!(first.path().extension().unwrap(), "png");

        let path = first.path().to_path_buf();
        drop(first);
        assert!(!path.exists());
        assert!(second.path().exists());
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, fetcher) = fetcher(dir.path());

        let err = fetcher.fetch("scans", "missing.jpg").await.unwrap_err();
        assert!(matches!(err, FetchError::NotFound { .. }));
    }

    #[tokio::test]
    async fn empty_object_is_downloaded_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let (store, fetcher) = fetcher(dir.path());
        store.put("scans", "empty.jpg", Vec::<u8>::new());

        let file = fetcher.fetch("scans", "empty.jpg").await.unwrap();
        assert_eq!(file.size_bytes(), 0);
        assert!(file.path().exists());
    }
}
