use std::fmt;

use thiserror::Error;

pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Where inventory manifests are delivered: `[s3://]<bucket>/<item-prefix>`.
///
/// The prefix is the full inventory configuration path inside the destination bucket,
/// i.e. `<destination-prefix>/<source-bucket>/<config-id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InventoryLocation {
    pub bucket: String,
    pub prefix: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InventoryLocationError {
    #[error("empty inventory location")]
    Empty,
    #[error("invalid inventory location (empty bucket): {0}")]
    EmptyBucket(String),
    #[error("invalid inventory location (missing item prefix after bucket): {0}")]
    MissingPrefix(String),
}

impl InventoryLocation {
    pub fn parse(input: &str) -> Result<Self, InventoryLocationError> {
        let raw = input.trim();
        if raw.is_empty() {
            return Err(InventoryLocationError::Empty);
        }
        let rest = raw.strip_prefix("s3://").unwrap_or(raw);
        let rest = rest.trim_start_matches('/');

        let Some((bucket, prefix)) = rest.split_once('/') else {
            return Err(InventoryLocationError::MissingPrefix(input.to_string()));
        };
        let bucket = bucket.trim();
        if bucket.is_empty() {
            return Err(InventoryLocationError::EmptyBucket(input.to_string()));
        }
        let prefix = prefix.trim().trim_matches('/');
        if prefix.is_empty() {
            return Err(InventoryLocationError::MissingPrefix(input.to_string()));
        }

        Ok(Self {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
        })
    }

    /// Key of the manifest delivered under the folder named `stamp`
    /// (`YYYY-MM-DDTHH-MMZ`).
    pub fn manifest_key(&self, stamp: &str) -> String {
        format!("{}/{stamp}/{MANIFEST_FILE_NAME}", self.prefix)
    }
}

impl fmt::Display for InventoryLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.prefix)
    }
}
