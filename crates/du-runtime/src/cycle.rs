//! One refresh cycle: resolve the manifest, fold every data file, publish.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use du_core::types::{ErrorClass, FileDescriptor, InventoryManifest};
use du_inventory::resolver::{ManifestResolver, ManifestSource, ResolveError};
use du_inventory::BlobFetcher;
use du_observe::metrics::ScopedTimer;
use thiserror::Error;
use tracing::{info, warn};

use crate::aggregate::{fold_parquet, AggregateConfig, FileError, FileUsage, UsageAccumulator};
use crate::metrics::HandlerMetrics;
use crate::snapshot::{SnapshotPublisher, UsageSnapshot};

pub const DEFAULT_MAX_CONCURRENT_FILES: usize = 4;

const S3_ARN_PREFIX: &str = "arn:aws:s3:::";

/// Bucket the manifest's data file keys are fetched from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DataBucket {
    /// The manifest's `sourceBucket`.
    #[default]
    Source,
    /// The manifest's `destinationBucket` (ARN prefix stripped), falling back to the
    /// inventory bucket when it is empty.
    Destination,
}

#[derive(Debug, Clone)]
pub struct CycleConfig {
    pub max_concurrent_files: usize,
    pub aggregate: AggregateConfig,
    /// Drop files whose downloaded length differs from the manifest's `size`.
    pub verify_file_sizes: bool,
    pub data_bucket: DataBucket,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            max_concurrent_files: DEFAULT_MAX_CONCURRENT_FILES,
            aggregate: AggregateConfig::default(),
            verify_file_sizes: true,
            data_bucket: DataBucket::Source,
        }
    }
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("manifest resolution failed: {0}")]
    Resolve(#[from] ResolveError),
}

impl CycleError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CycleError::Resolve(e) => e.class(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub manifest_key: String,
    pub source: ManifestSource,
    pub files_total: u64,
    pub files_ok: u64,
    pub files_failed: u64,
    pub rows_folded: u64,
    pub rows_skipped: u64,
    pub owners: u64,
    pub generation: u64,
}

pub struct CycleRunner {
    resolver: ManifestResolver,
    fetcher: Arc<dyn BlobFetcher>,
    publisher: Arc<SnapshotPublisher>,
    metrics: Arc<HandlerMetrics>,
    cfg: CycleConfig,
}

impl CycleRunner {
    pub fn new(
        resolver: ManifestResolver,
        fetcher: Arc<dyn BlobFetcher>,
        publisher: Arc<SnapshotPublisher>,
        metrics: Arc<HandlerMetrics>,
        cfg: CycleConfig,
    ) -> Self {
        Self {
            resolver,
            fetcher,
            publisher,
            metrics,
            cfg,
        }
    }

    pub fn inventory(&self) -> String {
        self.resolver.location().to_string()
    }

    pub fn metrics(&self) -> &Arc<HandlerMetrics> {
        &self.metrics
    }

    /// Runs a full cycle for `now` and publishes the result.
    ///
    /// On error the previously published snapshot is left untouched. Dropping the returned
    /// future abandons the cycle without publishing and counts it as cancelled.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<CycleReport, CycleError> {
        self.metrics.cycles_started.inc();
        let _timer = ScopedTimer::new(&self.metrics.cycle_duration);
        let mut in_flight = InFlight::new(&self.metrics);

        let resolved = match self.resolver.resolve(now).await {
            Ok(r) => r,
            Err(err) => {
                in_flight.finish();
                self.metrics.cycles_failed.inc();
                warn!(
                    target: "du_proof",
                    event = "cycle_abandoned",
                    inventory = %self.resolver.location(),
                    error_class = err.class().as_str(),
                    error = %err,
                    "manifest resolution failed; keeping previous snapshot"
                );
                return Err(err.into());
            }
        };
        if resolved.source == ManifestSource::PriorDay {
            self.metrics.manifest_fallbacks.inc();
        }

        let bucket = self.data_bucket(&resolved.manifest);
        let files = resolved.manifest.files;
        let files_total = files.len() as u64;

        let mut usage = UsageAccumulator::default();
        let mut files_ok: u64 = 0;
        let mut files_failed: u64 = 0;
        let mut rows_folded: u64 = 0;
        let mut rows_skipped: u64 = 0;

        let limit = self.cfg.max_concurrent_files.max(1);
        let mut joinset = tokio::task::JoinSet::new();
        let mut pending = files.into_iter();
        let mut exhausted = false;

        while !exhausted || !joinset.is_empty() {
            while !exhausted && joinset.len() < limit {
                let Some(file) = pending.next() else {
                    exhausted = true;
                    break;
                };
                let fetcher = self.fetcher.clone();
                let bucket = bucket.clone();
                let cfg = self.cfg.clone();
                joinset.spawn(async move {
                    let res = process_file(fetcher.as_ref(), &bucket, &file, &cfg).await;
                    (file, res)
                });
            }

            let Some(joined) = joinset.join_next().await else {
                break;
            };
            let (file, res) = match joined {
                Ok(done) => done,
                Err(e) => {
                    files_failed = files_failed.saturating_add(1);
                    self.metrics.files_failed.inc();
                    warn!(
                        target: "du_proof",
                        event = "file_failed",
                        manifest_key = %resolved.manifest_key,
                        error_class = ErrorClass::Malformed.as_str(),
                        error = %e,
                        "file task failed"
                    );
                    continue;
                }
            };

            match res {
                Ok((file_usage, downloaded)) => {
                    files_ok = files_ok.saturating_add(1);
                    rows_folded = rows_folded.saturating_add(file_usage.rows_folded);
                    rows_skipped = rows_skipped.saturating_add(file_usage.rows_skipped);
                    self.metrics.files_ok.inc();
                    self.metrics.rows_folded.inc_by(file_usage.rows_folded);
                    self.metrics.rows_skipped.inc_by(file_usage.rows_skipped);
                    self.metrics.bytes_downloaded.inc_by(downloaded);
                    if file_usage.rows_skipped > 0 {
                        warn!(
                            target: "du_proof",
                            event = "rows_skipped",
                            manifest_key = %resolved.manifest_key,
                            file_key = %file.key,
                            rows_skipped = file_usage.rows_skipped,
                            diagnostics = ?file_usage.diagnostics,
                            "skipped invalid inventory rows"
                        );
                    }
                    usage.merge(file_usage.usage);
                }
                Err(err) => {
                    files_failed = files_failed.saturating_add(1);
                    self.metrics.files_failed.inc();
                    warn!(
                        target: "du_proof",
                        event = "file_failed",
                        manifest_key = %resolved.manifest_key,
                        file_key = %file.key,
                        bucket = %bucket,
                        error_class = err.class().as_str(),
                        error = %err,
                        "inventory file dropped from cycle"
                    );
                }
            }
        }

        if files_total > 0 && files_ok == 0 {
            warn!(
                target: "du_proof",
                event = "all_files_failed",
                manifest_key = %resolved.manifest_key,
                files_failed = files_failed,
                error_class = ErrorClass::Inconsistent.as_str(),
                "every inventory file failed; publishing empty snapshot"
            );
        }

        let snapshot = UsageSnapshot {
            records: usage.into_records(),
            generation: 0,
            manifest_key: Some(resolved.manifest_key.clone()),
            built_at_unix_ms: du_observe::time::unix_time_ms(),
            files_included: files_ok,
            files_failed,
        };
        let owners = snapshot.owners() as u64;
        let total_bytes = snapshot.total_bytes();
        let generation = self.publisher.publish(snapshot);
        in_flight.finish();
        self.metrics.cycles_published.inc();
        self.metrics.snapshot_owners.set(owners);
        self.metrics.snapshot_owners_peak.max(owners);
        self.metrics.snapshot_bytes.set(total_bytes);
        self.metrics.snapshot_generation.set(generation);

        info!(
            target: "du_proof",
            event = "snapshot_published",
            manifest_key = %resolved.manifest_key,
            source = resolved.source.as_str(),
            generation = generation,
            owners = owners,
            total_bytes = total_bytes,
            files_ok = files_ok,
            files_failed = files_failed,
            rows_folded = rows_folded,
            rows_skipped = rows_skipped,
            "published usage snapshot"
        );

        Ok(CycleReport {
            manifest_key: resolved.manifest_key,
            source: resolved.source,
            files_total,
            files_ok,
            files_failed,
            rows_folded,
            rows_skipped,
            owners,
            generation,
        })
    }

    fn data_bucket(&self, manifest: &InventoryManifest) -> String {
        match self.cfg.data_bucket {
            DataBucket::Source => manifest.source_bucket.clone(),
            DataBucket::Destination => {
                let dest = manifest
                    .destination_bucket
                    .strip_prefix(S3_ARN_PREFIX)
                    .unwrap_or(&manifest.destination_bucket);
                if dest.is_empty() {
                    self.resolver.location().bucket.clone()
                } else {
                    dest.to_string()
                }
            }
        }
    }
}

/// Counts the cycle as cancelled if it is dropped before reaching a terminal state.
struct InFlight<'a> {
    metrics: &'a HandlerMetrics,
    done: bool,
}

impl<'a> InFlight<'a> {
    fn new(metrics: &'a HandlerMetrics) -> Self {
        Self {
            metrics,
            done: false,
        }
    }

    fn finish(&mut self) {
        self.done = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.metrics.cycles_cancelled.inc();
        }
    }
}

/// Fetches and folds one data file. Returns its usage and the downloaded byte count.
async fn process_file(
    fetcher: &dyn BlobFetcher,
    bucket: &str,
    file: &FileDescriptor,
    cfg: &CycleConfig,
) -> Result<(FileUsage, u64), FileError> {
    let bytes: Bytes = fetcher.fetch(bucket, &file.key).await?;
    let downloaded = bytes.len() as u64;
    if cfg.verify_file_sizes && downloaded != file.size {
        return Err(FileError::SizeMismatch {
            expected: file.size,
            actual: downloaded,
        });
    }

    let agg = cfg.aggregate.clone();
    let usage = tokio::task::spawn_blocking(move || fold_parquet(bytes, &agg))
        .await
        .map_err(|e| FileError::Task(e.to_string()))??;
    Ok((usage, downloaded))
}
