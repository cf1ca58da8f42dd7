use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The only inventory `fileFormat` the aggregator can decode.
pub const PARQUET_FILE_FORMAT: &str = "Parquet";

/// One data file listed by an inventory manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// Object key of the data file inside the inventory destination bucket.
    pub key: String,
    pub size: u64,
    #[serde(rename = "MD5checksum", default)]
    pub md5_checksum: String,
}

/// Storage-inventory `manifest.json`.
///
/// Field names follow the published inventory format and must round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryManifest {
    pub source_bucket: String,
    #[serde(default)]
    pub destination_bucket: String,
    #[serde(default)]
    pub version: String,
    /// Unix milliseconds, encoded as a string by the producer.
    #[serde(default)]
    pub creation_timestamp: String,
    pub file_format: String,
    #[serde(default)]
    pub file_schema: String,
    pub files: Vec<FileDescriptor>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManifestError {
    #[error("manifest is not valid json: {0}")]
    Json(String),
    #[error("sourceBucket must be non-empty")]
    EmptySourceBucket,
    #[error("files[{0}].key must be non-empty")]
    EmptyFileKey(usize),
}

impl InventoryManifest {
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, ManifestError> {
        let manifest: InventoryManifest =
            serde_json::from_slice(bytes).map_err(|e| ManifestError::Json(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.source_bucket.trim().is_empty() {
            return Err(ManifestError::EmptySourceBucket);
        }
        for (i, f) in self.files.iter().enumerate() {
            if f.key.trim().is_empty() {
                return Err(ManifestError::EmptyFileKey(i));
            }
        }
        Ok(())
    }

    pub fn is_parquet(&self) -> bool {
        self.file_format.eq_ignore_ascii_case(PARQUET_FILE_FORMAT)
    }

    /// Sum of the `size` field over all listed files.
    pub fn total_file_bytes(&self) -> u64 {
        self.files
            .iter()
            .fold(0u64, |acc, f| acc.saturating_add(f.size))
    }
}

/// Aggregated usage of one owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub owner_key: String,
    pub size_bytes: u64,
    pub file_count: u64,
}

impl UsageRecord {
    pub fn new(owner_key: impl Into<String>) -> Self {
        Self {
            owner_key: owner_key.into(),
            size_bytes: 0,
            file_count: 0,
        }
    }

    /// Accounts one more object of `size_bytes`.
    pub fn add_object(&mut self, size_bytes: u64) {
        self.size_bytes = self.size_bytes.saturating_add(size_bytes);
        self.file_count = self.file_count.saturating_add(1);
    }

    /// Folds another partial record for the same owner into this one.
    pub fn merge(&mut self, other: &UsageRecord) {
        self.size_bytes = self.size_bytes.saturating_add(other.size_bytes);
        self.file_count = self.file_count.saturating_add(other.file_count);
    }
}

/// Coarse error classes shared by every stage of a refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Expected absence (object or manifest missing).
    NotFound,
    /// Document or columnar payload could not be decoded.
    Malformed,
    /// Transport, permission or missing-bucket failure.
    Transport,
    /// Decoded data disagrees with itself or with the manifest.
    Inconsistent,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::NotFound => "not_found",
            ErrorClass::Malformed => "malformed",
            ErrorClass::Transport => "transport",
            ErrorClass::Inconsistent => "inconsistent",
        }
    }
}
