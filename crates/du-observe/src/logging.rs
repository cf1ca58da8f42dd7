use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `DU_LOG` first, then `RUST_LOG`, then a default.
///
/// Log field contract for the refresh pipeline:
/// - Pipeline events use `target: "du_proof"` and carry an `event` field.
/// - Include `manifest_key` once a manifest has been resolved for the cycle.
/// - Include `file_key` on any per-file event and `error_class` on every failure.
/// - Periodic metrics use `target: "du_metrics"` (`metrics_snapshot`, `owner_usage`).
///
/// `du_proof` events by stage:
/// - manifest: `manifest_resolved`, `manifest_fallback`, `s3_get_retry`
/// - files: `file_failed`, `rows_skipped`, `all_files_failed`
/// - cycle: `snapshot_published`, `cycle_abandoned`, `cycle_cancelled`, `cycle_skipped`
/// - scheduler: `scheduler_started`, `tick_done`, `scheduler_stopped`,
///   `scheduler_join_failed`, `scheduler_lock_poisoned`
/// - handler: `handler_start`, `initial_cycle_failed`, `handler_stopped`
pub fn init_tracing() {
    let filter = env_filter();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("DU_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
