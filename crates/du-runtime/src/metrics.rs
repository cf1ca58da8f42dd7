use du_observe::metrics::{Counter, DurationAgg, Gauge};
use tracing::info;

/// Counters for the refresh pipeline, shared by the handler, scheduler and cycle runner.
#[derive(Debug, Default)]
pub struct HandlerMetrics {
    pub cycles_started: Counter,
    pub cycles_published: Counter,
    pub cycles_failed: Counter,
    /// Cycles abandoned by `stop` before they could publish.
    pub cycles_cancelled: Counter,
    /// Ticks dropped because a cycle was already running.
    pub cycles_skipped: Counter,
    pub manifest_fallbacks: Counter,
    pub files_ok: Counter,
    pub files_failed: Counter,
    pub rows_folded: Counter,
    pub rows_skipped: Counter,
    pub bytes_downloaded: Counter,
    pub snapshot_owners: Gauge,
    pub snapshot_owners_peak: Gauge,
    pub snapshot_bytes: Gauge,
    pub snapshot_generation: Gauge,
    pub cycle_duration: DurationAgg,
}

impl HandlerMetrics {
    pub fn emit(&self, inventory: &str) {
        let dur = self.cycle_duration.snapshot();
        info!(
            target: "du_metrics",
            event = "metrics_snapshot",
            inventory = inventory,
            cycles_started = self.cycles_started.get(),
            cycles_published = self.cycles_published.get(),
            cycles_failed = self.cycles_failed.get(),
            cycles_cancelled = self.cycles_cancelled.get(),
            cycles_skipped = self.cycles_skipped.get(),
            manifest_fallbacks = self.manifest_fallbacks.get(),
            files_ok = self.files_ok.get(),
            files_failed = self.files_failed.get(),
            rows_folded = self.rows_folded.get(),
            rows_skipped = self.rows_skipped.get(),
            bytes_downloaded = self.bytes_downloaded.get(),
            snapshot_owners = self.snapshot_owners.get(),
            snapshot_owners_peak = self.snapshot_owners_peak.get(),
            snapshot_bytes = self.snapshot_bytes.get(),
            snapshot_generation = self.snapshot_generation.get(),
            cycle_count = dur.count,
            cycle_avg_ms = dur.avg_ms(),
            cycle_max_ms = dur.max_ms(),
            cycle_last_ms = dur.last_ms(),
            "metrics"
        );
    }
}
