use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{validate_object_key, BlobFetcher, FetchError};

/// Serves objects from a directory tree laid out as `<root>/<bucket>/<key>`.
///
/// Meant for local runs against a copied inventory and for tests.
#[derive(Debug, Clone)]
pub struct FsBlobFetcher {
    root: PathBuf,
}

impl FsBlobFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_path(&self, bucket: &str) -> Result<PathBuf, FetchError> {
        if bucket.trim().is_empty() || bucket.contains('/') || bucket.contains("..") {
            return Err(FetchError::NoSuchBucket(bucket.to_string()));
        }
        Ok(self.root.join(bucket))
    }

    /// Writes `bytes` to `<root>/<bucket>/<key>`, creating parent directories.
    pub fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<(), FetchError> {
        if !validate_object_key(key) {
            return Err(FetchError::InvalidKey(key.to_string()));
        }
        let path = self.bucket_path(bucket)?.join(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

#[async_trait]
impl BlobFetcher for FsBlobFetcher {
    async fn fetch(&self, bucket: &str, key: &str) -> Result<Bytes, FetchError> {
        if !validate_object_key(key) {
            return Err(FetchError::InvalidKey(key.to_string()));
        }
        let bucket_dir = self.bucket_path(bucket)?;
        let bucket = bucket.to_string();
        let key = key.to_string();

        tokio::task::spawn_blocking(move || read_object(&bucket_dir, bucket, key))
            .await
            .map_err(|e| FetchError::Transport(format!("fs read task failed: {e}")))?
    }
}

fn read_object(bucket_dir: &Path, bucket: String, key: String) -> Result<Bytes, FetchError> {
    match std::fs::read(bucket_dir.join(&key)) {
        Ok(bytes) => Ok(Bytes::from(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            if bucket_dir.is_dir() {
                Err(FetchError::NotFound { bucket, key })
            } else {
                Err(FetchError::NoSuchBucket(bucket))
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(FetchError::AccessDenied { bucket, key })
        }
        Err(err) => Err(FetchError::Io(err)),
    }
}
