#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing::{info, info_span, warn, Instrument};

use du_inventory::fs::FsBlobFetcher;
use du_inventory::StaticCredentials;
use du_runtime::cycle::DataBucket;
use du_runtime::handler::{DiskUsageError, DiskUsageHandler, HandlerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DataBucketArg {
    Source,
    Destination,
}

impl From<DataBucketArg> for DataBucket {
    fn from(v: DataBucketArg) -> Self {
        match v {
            DataBucketArg::Source => DataBucket::Source,
            DataBucketArg::Destination => DataBucket::Destination,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "du-agent")]
struct Args {
    /// Inventory location: `[s3://]<bucket>/<destination-prefix>/<source-bucket>/<config-id>`.
    #[arg(long, env = "DU_INVENTORY_PATH")]
    inventory_path: String,

    #[arg(long, env = "DU_AWS_REGION")]
    aws_region: Option<String>,

    /// Static credentials; must be given together with the secret.
    #[arg(long, env = "DU_AWS_ACCESS_KEY_ID")]
    aws_access_key_id: Option<String>,

    #[arg(long, env = "DU_AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    aws_secret_access_key: Option<String>,

    #[arg(long, env = "DU_REFRESH_PERIOD_SECS", default_value_t = 3600)]
    refresh_period_secs: u64,

    /// UTC hour at which the daily inventory is published.
    #[arg(long, env = "DU_CUTOFF_HOUR", default_value_t = 1)]
    cutoff_hour: u32,

    #[arg(long, env = "DU_MAX_CONCURRENT_FILES", default_value_t = 4)]
    max_concurrent_files: usize,

    /// Rows per decoded Parquet record batch.
    #[arg(long, env = "DU_BATCH_SIZE", default_value_t = 8192)]
    batch_size: usize,

    /// Which manifest bucket holds the data files.
    #[arg(long, env = "DU_DATA_BUCKET", value_enum, default_value_t = DataBucketArg::Source)]
    data_bucket: DataBucketArg,

    /// Accept data files whose length differs from the manifest.
    #[arg(long, env = "DU_SKIP_SIZE_CHECK", default_value_t = false)]
    skip_size_check: bool,

    /// Serve objects from `<root>/<bucket>/<key>` instead of S3.
    #[arg(long, env = "DU_FS_ROOT")]
    fs_root: Option<PathBuf>,

    /// Periodically emit a metrics snapshot to logs (0 disables).
    #[arg(long, env = "DU_METRICS_SNAPSHOT_INTERVAL_MS", default_value_t = 60_000)]
    metrics_snapshot_interval_ms: u64,

    /// Owners whose usage is logged with every metrics snapshot.
    #[arg(long = "query")]
    query: Vec<String>,
}

impl Args {
    fn credentials(&self) -> Result<Option<StaticCredentials>> {
        match (&self.aws_access_key_id, &self.aws_secret_access_key) {
            (Some(id), Some(secret)) => Ok(Some(StaticCredentials {
                access_key_id: id.clone(),
                secret_access_key: secret.clone(),
            })),
            (None, None) => Ok(None),
            _ => anyhow::bail!(
                "DU_AWS_ACCESS_KEY_ID and DU_AWS_SECRET_ACCESS_KEY must be set together"
            ),
        }
    }

    fn handler_config(&self) -> Result<HandlerConfig> {
        anyhow::ensure!(self.refresh_period_secs > 0, "DU_REFRESH_PERIOD_SECS must be > 0");
        anyhow::ensure!(self.cutoff_hour <= 23, "DU_CUTOFF_HOUR must be in 0..=23");
        Ok(HandlerConfig {
            region: self.aws_region.clone(),
            credentials: self.credentials()?,
            cutoff_hour_utc: self.cutoff_hour,
            max_concurrent_files: self.max_concurrent_files,
            batch_size: self.batch_size,
            verify_file_sizes: !self.skip_size_check,
            data_bucket: self.data_bucket.into(),
            ..HandlerConfig::new(self.inventory_path.clone(), self.refresh_period_secs)
        })
    }
}

async fn build_handler(args: &Args, cfg: HandlerConfig) -> Result<DiskUsageHandler> {
    if let Some(root) = &args.fs_root {
        let fetcher = FsBlobFetcher::new(root);
        info!(root = %fetcher.root().display(), "using filesystem object store");
        return Ok(DiskUsageHandler::with_fetcher(Arc::new(fetcher), cfg).await?);
    }
    #[cfg(feature = "s3")]
    {
        Ok(DiskUsageHandler::start(cfg).await?)
    }
    #[cfg(not(feature = "s3"))]
    {
        anyhow::bail!("built without the s3 feature; set DU_FS_ROOT")
    }
}

fn log_queries(handler: &DiskUsageHandler, owners: &[String]) {
    for owner in owners {
        match handler.disk_usage(owner) {
            Ok(rec) => info!(
                target: "du_metrics",
                event = "owner_usage",
                owner = %owner,
                size_bytes = rec.size_bytes,
                file_count = rec.file_count,
                "owner usage"
            ),
            Err(DiskUsageError::NotFound(_)) => info!(
                target: "du_metrics",
                event = "owner_usage",
                owner = %owner,
                "owner not present in snapshot"
            ),
            Err(e) => warn!(owner = %owner, error = %e, "owner lookup failed"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    du_observe::logging::init_tracing();

    let args = Args::parse();
    let cfg = args.handler_config()?;
    let span = info_span!(
        "du-agent",
        inventory = %args.inventory_path,
        refresh_period_secs = args.refresh_period_secs
    );

    async move {
        info!("starting disk usage agent");
        let handler = Arc::new(build_handler(&args, cfg).await?);

        let reporter = if args.metrics_snapshot_interval_ms > 0 {
            let handler = handler.clone();
            let owners = args.query.clone();
            let interval_ms = args.metrics_snapshot_interval_ms;
            Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
                loop {
                    ticker.tick().await;
                    handler.metrics().emit(handler.inventory());
                    log_queries(&handler, &owners);
                }
            }))
        } else {
            log_queries(&handler, &args.query);
            None
        };

        tokio::signal::ctrl_c().await?;
        info!("shutdown requested");
        if let Some(reporter) = reporter {
            reporter.abort();
        }
        handler.stop().await;
        handler.metrics().emit(handler.inventory());
        Ok(())
    }
    .instrument(span)
    .await
}
