#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod fs;
pub mod resolver;
#[cfg(feature = "s3")]
pub mod s3;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use du_core::types::ErrorClass;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },
    #[error("bucket not found: {0}")]
    NoSuchBucket(String),
    #[error("access denied: {bucket}/{key}")]
    AccessDenied { bucket: String, key: String },
    #[error("invalid object key: {0:?}")]
    InvalidKey(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// True only for "the key is not present"; drives the manifest fallback.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::NotFound { .. })
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            FetchError::NotFound { .. } => ErrorClass::NotFound,
            FetchError::InvalidKey(_) => ErrorClass::Malformed,
            FetchError::NoSuchBucket(_)
            | FetchError::AccessDenied { .. }
            | FetchError::Transport(_)
            | FetchError::Io(_) => ErrorClass::Transport,
        }
    }
}

/// Object download capability used by the refresh pipeline.
///
/// Implementations must report a missing key as [`FetchError::NotFound`] and must not use
/// that variant for any other failure.
#[async_trait]
pub trait BlobFetcher: Send + Sync + 'static {
    async fn fetch(&self, bucket: &str, key: &str) -> Result<Bytes, FetchError>;
}

/// Static access key pair for the object store.
#[derive(Clone, PartialEq, Eq)]
pub struct StaticCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

fn validate_object_key(key: &str) -> bool {
    if key.trim().is_empty() {
        return false;
    }
    if key.contains('\\') {
        return false;
    }
    !key.split('/').any(|seg| seg == "..")
}
