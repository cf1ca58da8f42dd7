//! Locates and decodes the inventory manifest for a refresh cycle.
//!
//! Inventory reports are delivered once a day into a folder named after the publication
//! instant (`YYYY-MM-DDTHH-MMZ`). The resolver looks for today's folder first and, only when
//! that manifest does not exist yet, for yesterday's.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use du_core::location::InventoryLocation;
use du_core::types::{ErrorClass, InventoryManifest};
use thiserror::Error;
use tracing::{info, warn};

use crate::{BlobFetcher, FetchError};

/// Folder name format of a daily inventory delivery.
pub const MANIFEST_STAMP_FORMAT: &str = "%Y-%m-%dT%H-%MZ";

pub const DEFAULT_CUTOFF_HOUR_UTC: u32 = 1;

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// UTC hour of the daily inventory publication boundary.
    pub cutoff_hour_utc: u32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cutoff_hour_utc: DEFAULT_CUTOFF_HOUR_UTC,
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid resolver config: {0}")]
    InvalidConfig(String),
    #[error("manifest not found at {scheduled_key} nor at fallback {prior_key}")]
    NotFound {
        scheduled_key: String,
        prior_key: String,
    },
    #[error("fetch manifest {key} failed: {source}")]
    Fetch {
        key: String,
        #[source]
        source: FetchError,
    },
    #[error("manifest {key} is malformed: {message}")]
    Malformed { key: String, message: String },
    #[error("manifest {key} has unsupported fileFormat {format:?} (expected Parquet)")]
    UnsupportedFormat { key: String, format: String },
}

impl ResolveError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ResolveError::NotFound { .. } => ErrorClass::NotFound,
            ResolveError::Fetch { source, .. } => source.class(),
            ResolveError::InvalidConfig(_)
            | ResolveError::Malformed { .. }
            | ResolveError::UnsupportedFormat { .. } => ErrorClass::Malformed,
        }
    }
}

/// Which delivery the manifest came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestSource {
    /// The delivery for the publication boundary of `now`'s day.
    Scheduled,
    /// The previous day's delivery, used because the scheduled one was absent.
    PriorDay,
}

impl ManifestSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ManifestSource::Scheduled => "scheduled",
            ManifestSource::PriorDay => "prior_day",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    pub manifest: InventoryManifest,
    pub manifest_key: String,
    pub source: ManifestSource,
}

enum FetchAttempt {
    Found(Bytes),
    Absent,
}

#[derive(Clone)]
pub struct ManifestResolver {
    fetcher: Arc<dyn BlobFetcher>,
    location: InventoryLocation,
    cfg: ResolverConfig,
}

impl ManifestResolver {
    pub fn new(
        fetcher: Arc<dyn BlobFetcher>,
        location: InventoryLocation,
        cfg: ResolverConfig,
    ) -> Result<Self, ResolveError> {
        if cfg.cutoff_hour_utc > 23 {
            return Err(ResolveError::InvalidConfig(format!(
                "cutoff_hour_utc must be in 0..=23, got {}",
                cfg.cutoff_hour_utc
            )));
        }
        Ok(Self {
            fetcher,
            location,
            cfg,
        })
    }

    pub fn location(&self) -> &InventoryLocation {
        &self.location
    }

    /// Manifest keys for `now`: the scheduled delivery and the prior day's.
    pub fn candidate_keys(&self, now: DateTime<Utc>) -> Result<(String, String), ResolveError> {
        let scheduled = publication_instant(now, self.cfg.cutoff_hour_utc)?;
        let prior = scheduled - Duration::days(1);
        Ok((
            self.location.manifest_key(&manifest_stamp(scheduled)),
            self.location.manifest_key(&manifest_stamp(prior)),
        ))
    }

    pub async fn resolve(&self, now: DateTime<Utc>) -> Result<ResolvedManifest, ResolveError> {
        let (scheduled_key, prior_key) = self.candidate_keys(now)?;

        let (bytes, manifest_key, source) = match self.try_fetch(&scheduled_key).await? {
            FetchAttempt::Found(bytes) => (bytes, scheduled_key, ManifestSource::Scheduled),
            FetchAttempt::Absent => {
                warn!(
                    target: "du_proof",
                    event = "manifest_fallback",
                    bucket = %self.location.bucket,
                    scheduled_key = %scheduled_key,
                    prior_key = %prior_key,
                    "scheduled manifest absent; trying prior day"
                );
                match self.try_fetch(&prior_key).await? {
                    FetchAttempt::Found(bytes) => (bytes, prior_key, ManifestSource::PriorDay),
                    FetchAttempt::Absent => {
                        return Err(ResolveError::NotFound {
                            scheduled_key,
                            prior_key,
                        })
                    }
                }
            }
        };

        let manifest = InventoryManifest::from_json_slice(&bytes).map_err(|e| {
            ResolveError::Malformed {
                key: manifest_key.clone(),
                message: e.to_string(),
            }
        })?;
        if !manifest.is_parquet() {
            return Err(ResolveError::UnsupportedFormat {
                key: manifest_key,
                format: manifest.file_format,
            });
        }

        info!(
            target: "du_proof",
            event = "manifest_resolved",
            source = source.as_str(),
            manifest_key = %manifest_key,
            source_bucket = %manifest.source_bucket,
            files = manifest.files.len() as u64,
            listed_bytes = manifest.total_file_bytes(),
            "resolved inventory manifest"
        );

        Ok(ResolvedManifest {
            manifest,
            manifest_key,
            source,
        })
    }

    async fn try_fetch(&self, key: &str) -> Result<FetchAttempt, ResolveError> {
        match self.fetcher.fetch(&self.location.bucket, key).await {
            Ok(bytes) => Ok(FetchAttempt::Found(bytes)),
            Err(err) if err.is_not_found() => Ok(FetchAttempt::Absent),
            Err(err) => Err(ResolveError::Fetch {
                key: key.to_string(),
                source: err,
            }),
        }
    }
}

/// Moves `now` to the publication boundary (`cutoff_hour_utc`:00 UTC) of the same day.
pub fn publication_instant(
    now: DateTime<Utc>,
    cutoff_hour_utc: u32,
) -> Result<DateTime<Utc>, ResolveError> {
    now.date_naive()
        .and_hms_opt(cutoff_hour_utc, 0, 0)
        .map(|naive| naive.and_utc())
        .ok_or_else(|| {
            ResolveError::InvalidConfig(format!("invalid cutoff hour {cutoff_hour_utc}"))
        })
}

pub fn manifest_stamp(at: DateTime<Utc>) -> String {
    at.format(MANIFEST_STAMP_FORMAT).to_string()
}
