//! Periodic pool sizing from the latency estimate.
//!
//! Sizing follows Little's law: sustaining `tps` completions per second when each attempt holds a
//! worker for `latency` takes `tps * latency` workers in flight.

use std::{sync::Arc, time::Duration};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::instant_now;
use super::internal_event::{
    InternalEventHandle, PoolResizeData, Registered, WorkerPoolResized, register,
};
use super::latency::LatencyEstimator;
use super::worker_pool::WorkerPool;

/// Workers needed to sustain `target_tps` at `latency_ms` per attempt, clamped to `[min, max]`.
pub fn optimal_workers(target_tps: f64, latency_ms: f64, min: usize, max: usize) -> usize {
    let raw = (target_tps * latency_ms / 1000.0).ceil();
    // `as` saturates, and maps NaN to zero.
    (raw as usize).clamp(min, max.max(min))
}

pub struct ConcurrencyController {
    target_tps: f64,
    min_workers: usize,
    max_workers: usize,
    latency: Arc<LatencyEstimator>,
    pool: Arc<WorkerPool>,
    resized: Registered<WorkerPoolResized>,
}

impl ConcurrencyController {
    pub fn new(
        target_tps: f64,
        min_workers: usize,
        max_workers: usize,
        latency: Arc<LatencyEstimator>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            target_tps,
            min_workers,
            max_workers,
            latency,
            pool,
            resized: register(WorkerPoolResized),
        }
    }

    /// Recomputes the pool size once. Returns the new size, or `None` when the pool already had it
    /// and was left untouched.
    pub fn tick(&self) -> Option<usize> {
        let latency_ms = self.latency.estimate_ms();
        let target =
            optimal_workers(self.target_tps, latency_ms, self.min_workers, self.max_workers);
        let previous = self.pool.core_size();
        if target == previous {
            return None;
        }

        if !self.pool.resize(target) {
            return None;
        }
        self.resized.emit(PoolResizeData {
            previous,
            size: target,
            latency_estimate_ms: latency_ms,
        });
        Some(target)
    }

    /// Ticks every `period`, starting one period from now, until `shutdown` fires.
    pub async fn run(self, period: Duration, shutdown: CancellationToken) {
        let mut ticks = tokio::time::interval_at(instant_now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticks.tick() => {
                    self.tick();
                }
            }
        }
        debug!(message = "Concurrency controller stopped.");
    }
}

#[cfg(test)]
mod tests {
    use tokio::time;

    use super::*;

    #[test]
    fn sizing_follows_littles_law() {
        assert_eq!(optimal_workers(1500.0, 200.0, 1, 200), 200);
        assert_eq!(optimal_workers(100.0, 200.0, 1, 200), 20);
        assert_eq!(optimal_workers(10.0, 50.0, 1, 200), 1);
        // 7.5 rounds up.
        assert_eq!(optimal_workers(15.0, 500.0, 1, 200), 8);
    }

    #[test]
    fn sizing_is_clamped() {
        assert_eq!(optimal_workers(10.0, 0.0, 1, 200), 1);
        assert_eq!(optimal_workers(10.0, 0.0, 4, 200), 4);
        assert_eq!(optimal_workers(1500.0, 40_000.0, 1, 200), 200);
        assert_eq!(optimal_workers(10.0, f64::INFINITY, 1, 50), 50);
        assert_eq!(optimal_workers(10.0, f64::NAN, 2, 50), 2);
    }

    fn controller(
        tps: f64,
        latency: &Arc<LatencyEstimator>,
        pool: &Arc<WorkerPool>,
    ) -> ConcurrencyController {
        ConcurrencyController::new(tps, 1, 200, Arc::clone(latency), Arc::clone(pool))
    }

    #[tokio::test]
    async fn tick_is_idempotent() {
        let latency = Arc::new(LatencyEstimator::new(200.0, 0.2));
        let pool = Arc::new(WorkerPool::new(4, 16));
        let controller = controller(100.0, &latency, &pool);

        assert_eq!(controller.tick(), Some(20));
        assert_eq!(pool.core_size(), 20);
        assert_eq!(pool.max_size(), 20);

        assert_eq!(controller.tick(), None);
        assert_eq!(pool.core_size(), 20);
    }

    #[tokio::test]
    async fn tick_follows_latency_down() {
        let latency = Arc::new(LatencyEstimator::new(200.0, 1.0));
        let pool = Arc::new(WorkerPool::new(4, 16));
        let controller = controller(100.0, &latency, &pool);

        controller.tick();
        latency.record(Duration::from_millis(50));
        assert_eq!(controller.tick(), Some(5));
        assert_eq!(pool.max_size(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn run_waits_one_period_before_first_tick() {
        let latency = Arc::new(LatencyEstimator::new(200.0, 0.2));
        let pool = Arc::new(WorkerPool::new(4, 16));
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(
            controller(100.0, &latency, &pool).run(Duration::from_secs(5), shutdown.clone()),
        );

        time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(pool.core_size(), 4);

        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.core_size(), 20);

        shutdown.cancel();
        task.await.unwrap();
    }
}
