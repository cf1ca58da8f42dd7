//! Public entry point: owns the snapshot, the refresh scheduler and the query surface.

use std::sync::Arc;
use std::time::Duration;

use du_core::location::{InventoryLocation, InventoryLocationError};
use du_core::types::UsageRecord;
use du_inventory::resolver::{
    ManifestResolver, ResolveError, ResolverConfig, DEFAULT_CUTOFF_HOUR_UTC,
};
use du_inventory::{BlobFetcher, FetchError, StaticCredentials};
use thiserror::Error;
use tracing::{info, warn};

use crate::aggregate::{AggregateConfig, DEFAULT_BATCH_SIZE};
use crate::cycle::{CycleConfig, CycleRunner, DataBucket, DEFAULT_MAX_CONCURRENT_FILES};
use crate::metrics::HandlerMetrics;
use crate::scheduler::{CycleOutcome, Scheduler};
use crate::snapshot::{SnapshotPublisher, UsageSnapshot};

/// How the first cycle after start is run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InitialCycle {
    /// `start` waits for the first cycle to finish (successfully or not).
    #[default]
    Blocking,
    /// `start` returns immediately; the first cycle runs on the worker.
    Background,
}

#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// `[s3://]<bucket>/<destination-prefix>/<source-bucket>/<config-id>`.
    pub inventory_path: String,
    pub region: Option<String>,
    pub credentials: Option<StaticCredentials>,
    pub refresh_period: Duration,
    pub cutoff_hour_utc: u32,
    pub max_concurrent_files: usize,
    pub batch_size: usize,
    pub verify_file_sizes: bool,
    pub data_bucket: DataBucket,
    pub initial_cycle: InitialCycle,
}

impl HandlerConfig {
    pub fn new(inventory_path: impl Into<String>, refresh_period_secs: u64) -> Self {
        Self {
            inventory_path: inventory_path.into(),
            refresh_period: Duration::from_secs(refresh_period_secs),
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<InventoryLocation, DiskUsageError> {
        let location = InventoryLocation::parse(&self.inventory_path)?;
        if self.refresh_period.is_zero() {
            return Err(DiskUsageError::InvalidConfig(
                "refresh period must be > 0".to_string(),
            ));
        }
        if self.max_concurrent_files == 0 {
            return Err(DiskUsageError::InvalidConfig(
                "max_concurrent_files must be > 0".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(DiskUsageError::InvalidConfig(
                "batch_size must be > 0".to_string(),
            ));
        }
        Ok(location)
    }

    fn cycle_config(&self) -> CycleConfig {
        CycleConfig {
            max_concurrent_files: self.max_concurrent_files,
            aggregate: AggregateConfig {
                batch_size: self.batch_size,
                ..AggregateConfig::default()
            },
            verify_file_sizes: self.verify_file_sizes,
            data_bucket: self.data_bucket,
        }
    }
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            inventory_path: String::new(),
            region: None,
            credentials: None,
            refresh_period: Duration::from_secs(3600),
            cutoff_hour_utc: DEFAULT_CUTOFF_HOUR_UTC,
            max_concurrent_files: DEFAULT_MAX_CONCURRENT_FILES,
            batch_size: DEFAULT_BATCH_SIZE,
            verify_file_sizes: true,
            data_bucket: DataBucket::Source,
            initial_cycle: InitialCycle::Blocking,
        }
    }
}

#[derive(Debug, Error)]
pub enum DiskUsageError {
    #[error(transparent)]
    InvalidLocation(#[from] InventoryLocationError),
    #[error("invalid handler config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Resolver(#[from] ResolveError),
    #[error("object store setup failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("no usage recorded for owner {0:?}")]
    NotFound(String),
}

/// Serves per-owner disk usage from the latest published snapshot and keeps it fresh.
pub struct DiskUsageHandler {
    inventory: String,
    publisher: Arc<SnapshotPublisher>,
    metrics: Arc<HandlerMetrics>,
    scheduler: Scheduler,
}

impl DiskUsageHandler {
    /// Builds an S3-backed handler and starts refreshing.
    #[cfg(feature = "s3")]
    pub async fn start(cfg: HandlerConfig) -> Result<Self, DiskUsageError> {
        use du_inventory::s3::{S3BlobFetcher, S3ClientConfig};

        cfg.validate()?;
        let s3_cfg = S3ClientConfig {
            region: cfg.region.clone(),
            credentials: cfg.credentials.clone(),
            ..S3ClientConfig::default()
        }
        .with_env_overrides()?;
        let fetcher = S3BlobFetcher::from_config(&s3_cfg).await;
        Self::with_fetcher(Arc::new(fetcher), cfg).await
    }

    /// Starts refreshing with a caller-supplied object fetcher.
    pub async fn with_fetcher(
        fetcher: Arc<dyn BlobFetcher>,
        cfg: HandlerConfig,
    ) -> Result<Self, DiskUsageError> {
        let location = cfg.validate()?;
        let inventory = location.to_string();
        let resolver = ManifestResolver::new(
            fetcher.clone(),
            location,
            ResolverConfig {
                cutoff_hour_utc: cfg.cutoff_hour_utc,
            },
        )?;

        let publisher = Arc::new(SnapshotPublisher::new());
        let metrics = Arc::new(HandlerMetrics::default());
        let runner = Arc::new(CycleRunner::new(
            resolver,
            fetcher,
            publisher.clone(),
            metrics.clone(),
            cfg.cycle_config(),
        ));
        let scheduler = Scheduler::new(runner);

        info!(
            target: "du_proof",
            event = "handler_start",
            inventory = %inventory,
            refresh_period_ms = cfg.refresh_period.as_millis() as u64,
            cutoff_hour_utc = cfg.cutoff_hour_utc,
            max_concurrent_files = cfg.max_concurrent_files as u64,
            initial_cycle = ?cfg.initial_cycle,
            "starting disk usage handler"
        );

        let now = tokio::time::Instant::now();
        match cfg.initial_cycle {
            InitialCycle::Blocking => {
                if let CycleOutcome::Failed(err) = scheduler.run_now().await {
                    warn!(
                        target: "du_proof",
                        event = "initial_cycle_failed",
                        inventory = %inventory,
                        error_class = err.class().as_str(),
                        error = %err,
                        "initial cycle failed; serving empty snapshot until next tick"
                    );
                }
                scheduler.spawn(cfg.refresh_period, now + cfg.refresh_period);
            }
            InitialCycle::Background => scheduler.spawn(cfg.refresh_period, now),
        }

        Ok(Self {
            inventory,
            publisher,
            metrics,
            scheduler,
        })
    }

    /// Usage of `owner` in the current snapshot.
    pub fn disk_usage(&self, owner: &str) -> Result<UsageRecord, DiskUsageError> {
        self.lookup(owner)
            .ok_or_else(|| DiskUsageError::NotFound(owner.to_string()))
    }

    pub fn lookup(&self, owner: &str) -> Option<UsageRecord> {
        self.publisher.lookup(owner)
    }

    pub fn snapshot(&self) -> Arc<UsageSnapshot> {
        self.publisher.current()
    }

    /// Runs a cycle immediately; returns `Skipped` when one is already running.
    pub async fn refresh_now(&self) -> CycleOutcome {
        self.scheduler.run_now().await
    }

    pub fn metrics(&self) -> &Arc<HandlerMetrics> {
        &self.metrics
    }

    pub fn inventory(&self) -> &str {
        &self.inventory
    }

    pub fn is_refreshing(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Stops periodic refresh. The last published snapshot stays queryable.
    pub async fn stop(&self) {
        self.scheduler.stop().await;
        info!(
            target: "du_proof",
            event = "handler_stopped",
            inventory = %self.inventory,
            generation = self.publisher.current().generation,
            "disk usage handler stopped"
        );
    }
}
