use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// Exponentially weighted moving average of attempt latency, in milliseconds.
///
/// The estimate is an `f64` stored as raw bits so it can be updated lock-free from every worker.
#[derive(Debug)]
pub struct LatencyEstimator {
    estimate_bits: AtomicU64,
    alpha: f64,
}

impl LatencyEstimator {
    /// `initial_ms` seeds the estimate; `alpha` is the weight of each new sample.
    pub fn new(initial_ms: f64, alpha: f64) -> Self {
        Self {
            estimate_bits: AtomicU64::new(initial_ms.max(0.0).to_bits()),
            alpha: alpha.clamp(f64::MIN_POSITIVE, 1.0),
        }
    }

    /// Folds one attempt duration into the estimate and returns the new value.
    pub fn record(&self, sample: Duration) -> f64 {
        let sample_ms = sample.as_secs_f64() * 1000.0;
        let mut updated = 0.0;
        // The closure always returns Some, so this cannot fail.
        let _ = self
            .estimate_bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let current = f64::from_bits(bits);
                updated = current * (1.0 - self.alpha) + sample_ms * self.alpha;
                Some(updated.to_bits())
            });
        updated
    }

    pub fn estimate_ms(&self) -> f64 {
        f64::from_bits(self.estimate_bits.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {}, got {}",
            expected,
            actual
        );
    }

    #[test]
    fn single_sample_moves_a_fifth_of_the_way() {
        let estimator = LatencyEstimator::new(200.0, 0.2);
        let estimate = estimator.record(Duration::from_millis(100));
        assert_close(estimate, 200.0 * 0.8 + 100.0 * 0.2);
        assert_close(estimator.estimate_ms(), 180.0);
    }

    #[test]
    fn converges_towards_a_steady_latency() {
        let estimator = LatencyEstimator::new(200.0, 0.2);
        for _ in 0..100 {
            estimator.record(Duration::from_millis(50));
        }
        assert!((estimator.estimate_ms() - 50.0).abs() < 0.01);
    }

    #[test]
    fn spike_is_damped() {
        let estimator = LatencyEstimator::new(100.0, 0.2);
        estimator.record(Duration::from_secs(40));
        assert_close(estimator.estimate_ms(), 100.0 * 0.8 + 40_000.0 * 0.2);
        assert!(estimator.estimate_ms() >= 0.0);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let estimator = Arc::new(LatencyEstimator::new(0.0, 1.0));
        let handles = (0..8)
            .map(|_| {
                let estimator = Arc::clone(&estimator);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        estimator.record(Duration::from_millis(7));
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_close(estimator.estimate_ms(), 7.0);
    }
}
