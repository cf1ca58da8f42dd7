//! Periodic re-execution of the refresh cycle.
//!
//! At most one cycle runs at a time. A tick (or a manual refresh) that arrives while a cycle
//! is running is dropped rather than queued, and missed ticks are not replayed in a burst.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cycle::{CycleError, CycleReport, CycleRunner};

#[derive(Debug)]
pub enum CycleOutcome {
    Published(CycleReport),
    Failed(CycleError),
    /// Another cycle was already in progress.
    Skipped,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Published(_) => "published",
            CycleOutcome::Failed(_) => "failed",
            CycleOutcome::Skipped => "skipped",
        }
    }
}

pub struct Scheduler {
    runner: Arc<CycleRunner>,
    busy: Arc<AsyncMutex<()>>,
    shutdown: watch::Sender<bool>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(runner: Arc<CycleRunner>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            runner,
            busy: Arc::new(AsyncMutex::new(())),
            shutdown,
            worker: std::sync::Mutex::new(None),
        }
    }

    /// Runs one cycle now unless one is already running.
    pub async fn run_now(&self) -> CycleOutcome {
        try_run_cycle(&self.runner, &self.busy).await
    }

    /// Starts the background worker. The first tick fires at `first_tick`, then every
    /// `period`. Calling this while a worker is already running does nothing.
    pub fn spawn(&self, period: Duration, first_tick: Instant) {
        let Ok(mut slot) = self.worker.lock() else {
            warn!(target: "du_proof", event = "scheduler_lock_poisoned", "worker slot poisoned");
            return;
        };
        if slot.is_some() {
            return;
        }
        let runner = self.runner.clone();
        let busy = self.busy.clone();
        let shutdown = self.shutdown.subscribe();
        let period = period.max(Duration::from_millis(1));
        *slot = Some(tokio::spawn(worker_loop(
            runner, busy, period, first_tick, shutdown,
        )));
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// Signals the worker and waits for it to exit. An in-flight cycle is abandoned
    /// without publishing.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let handle = match self.worker.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(
                    target: "du_proof",
                    event = "scheduler_join_failed",
                    error = %e,
                    "scheduler worker did not exit cleanly"
                );
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn try_run_cycle(runner: &CycleRunner, busy: &AsyncMutex<()>) -> CycleOutcome {
    let Ok(_guard) = busy.try_lock() else {
        runner.metrics().cycles_skipped.inc();
        debug!(
            target: "du_proof",
            event = "cycle_skipped",
            inventory = %runner.inventory(),
            "cycle already in progress"
        );
        return CycleOutcome::Skipped;
    };
    match runner.run(Utc::now()).await {
        Ok(report) => CycleOutcome::Published(report),
        Err(err) => CycleOutcome::Failed(err),
    }
}

async fn worker_loop(
    runner: Arc<CycleRunner>,
    busy: Arc<AsyncMutex<()>>,
    period: Duration,
    first_tick: Instant,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(first_tick, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(
        target: "du_proof",
        event = "scheduler_started",
        inventory = %runner.inventory(),
        period_ms = period.as_millis() as u64,
        "refresh scheduler started"
    );

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let outcome = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                info!(
                    target: "du_proof",
                    event = "cycle_cancelled",
                    inventory = %runner.inventory(),
                    "stop requested; abandoning in-flight cycle"
                );
                break;
            }
            outcome = try_run_cycle(&runner, &busy) => outcome,
        };
        debug!(
            target: "du_proof",
            event = "tick_done",
            outcome = outcome.as_str(),
            "scheduler tick finished"
        );
    }

    info!(
        target: "du_proof",
        event = "scheduler_stopped",
        inventory = %runner.inventory(),
        "refresh scheduler stopped"
    );
}
