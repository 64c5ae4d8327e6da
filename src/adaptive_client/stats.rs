use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::instant_now;
use super::internal_event::{InternalEventHandle, StatsReportData, StatsReported, register};
use super::worker_pool::WorkerPool;

/// Running totals for one client instance.
///
/// `submitted` counts logical requests (first attempts only). `succeeded` and `failed` count
/// terminal results. Each increment happens after the attempt it describes has finished, so the
/// three are only mutually consistent when nothing is in flight.
#[derive(Debug)]
pub struct ClientStats {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    started_at: Instant,
}

/// A point-in-time copy of [`ClientStats`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub uptime: Duration,
}

impl StatsSnapshot {
    /// Successful requests per second of uptime. Uptime is floored at one second.
    pub fn tps(&self) -> f64 {
        self.succeeded as f64 / self.uptime.as_secs().max(1) as f64
    }
}

impl Default for ClientStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientStats {
    pub fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            started_at: instant_now(),
        }
    }

    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        instant_now().saturating_duration_since(self.started_at)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted(),
            succeeded: self.succeeded(),
            failed: self.failed(),
            uptime: self.uptime(),
        }
    }

    /// Whether `expected` requests were submitted and every one of them has succeeded or failed.
    ///
    /// Rejected requests never reach either total. A request turned away by an open circuit
    /// therefore keeps this false for good once it has been counted as submitted, which happens
    /// on its first attempt whether or not that attempt was the one rejected.
    pub fn is_complete(&self, expected: u64) -> bool {
        let snapshot = self.snapshot();
        snapshot.submitted == expected && snapshot.succeeded + snapshot.failed == expected
    }
}

/// Logs and publishes the counters every `period` until `shutdown` fires.
///
/// The first report is made one period after start.
pub(crate) async fn run_reporter(
    stats: Arc<ClientStats>,
    pool: Arc<WorkerPool>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let handle = register(StatsReported);
    let mut ticks = tokio::time::interval_at(instant_now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticks.tick() => {
                let snapshot = stats.snapshot();
                handle.emit(StatsReportData {
                    tps: snapshot.tps(),
                    submitted: snapshot.submitted,
                    succeeded: snapshot.succeeded,
                    failed: snapshot.failed,
                    active_workers: pool.active_workers(),
                    pool_size: pool.core_size(),
                    uptime: snapshot.uptime,
                });
            }
        }
    }
    debug!(message = "Stats reporter stopped.");
}
