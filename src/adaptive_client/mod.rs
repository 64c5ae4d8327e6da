//! Throughput-targeting HTTP dispatch.

mod admission;
mod circuit_breaker;
mod client;
mod controller;
mod latency;
mod outcome;
mod request;
mod stats;
mod worker_pool;

pub mod http;
pub mod internal_event;
pub mod reqwest_integration;
pub mod retries;

use std::time::Duration;

use bon::Builder;
use serde::Deserialize;
use snafu::Snafu;

pub use admission::AdmissionGate;
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use client::{AdaptiveHttpClient, ClientError};
pub use controller::{ConcurrencyController, optimal_workers};
pub use latency::LatencyEstimator;
pub use outcome::{AdaptiveResponse, Outcome, RejectReason};
pub use request::{RawResponse, Request};
pub use stats::{ClientStats, StatsSnapshot};
pub use worker_pool::{PoolError, WorkerPool};

use retries::JitterMode;

fn instant_now() -> tokio::time::Instant {
    tokio::time::Instant::now()
}

/// Configuration of the adaptive client.
///
/// Only `target_tps` is required. The remaining defaults reproduce the behavior the client was
/// tuned against: a downstream whose latency is usually a few hundred milliseconds but spikes
/// to tens of seconds for a fraction of requests.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `target_tps` | required | Admission rate in requests/second, also feeds the pool sizing formula |
/// | `max_retries` | 3 | Transport-failure retries before a request fails terminally |
/// | `breaker_failure_threshold` | 5 | Consecutive failures that open the circuit |
/// | `breaker_cooldown_ms` | 35000 | Time after the last failure before a probe is admitted |
/// | `initial_workers` | 4 | Pool size until the first controller tick |
/// | `min_workers` / `max_workers` | 1 / 200 | Clamp applied to the computed pool size |
/// | `initial_latency_ms` | 200 | Seed for the latency estimate |
/// | `ewma_alpha` | 0.2 | Weight of the newest latency sample |
/// | `adjust_interval_ms` | 5000 | Controller period |
/// | `report_interval_ms` | 5000 | Stats report period |
/// | `request_timeout_ms` | 35000 | Default per-request timeout |
/// | `connect_timeout_ms` | 30000 | Connect timeout of the default transport |
/// | `queue_capacity` | 10000 | Attempts that may wait for a worker |
/// | `retry_backoff_ms` | 0 | Base delay between retries, 0 re-enters immediately |
/// | `retry_backoff_max_ms` | 1000 | Cap on a single retry delay |
/// | `retry_jitter` | `full` | Jitter applied to retry delays, `none` or `full` |
///
/// # Example
///
/// ```rust
/// use adaptive_http_client::adaptive_client::AdaptiveClientSettings;
///
/// let settings = AdaptiveClientSettings::builder()
///     .target_tps(250.0)
///     .max_retries(5)
///     .max_workers(64)
///     .build();
/// assert!(settings.validate().is_ok());
/// ```
#[derive(Clone, Copy, Debug, Builder, Deserialize)]
pub struct AdaptiveClientSettings {
    /// Sustained admission rate in requests per second. Fractional rates are allowed.
    pub(super) target_tps: f64,

    /// Number of times a request is re-submitted after a transport failure.
    ///
    /// A request is attempted at most `max_retries + 1` times.
    #[builder(default = default_max_retries())]
    #[serde(default = "default_max_retries")]
    pub(super) max_retries: u32,

    /// Consecutive terminal failures that open the circuit.
    #[builder(default = default_breaker_failure_threshold())]
    #[serde(default = "default_breaker_failure_threshold")]
    pub(super) breaker_failure_threshold: u32,

    /// Milliseconds after the last failure before an open circuit lets a probe through.
    #[builder(default = default_breaker_cooldown_ms())]
    #[serde(default = "default_breaker_cooldown_ms")]
    pub(super) breaker_cooldown_ms: u64,

    /// Pool size used until the controller has run once.
    #[builder(default = default_initial_workers())]
    #[serde(default = "default_initial_workers")]
    pub(super) initial_workers: usize,

    /// Lower bound for the computed pool size.
    #[builder(default = default_min_workers())]
    #[serde(default = "default_min_workers")]
    pub(super) min_workers: usize,

    /// Upper bound for the computed pool size.
    ///
    /// Prevents unbounded growth when the downstream stalls and the latency estimate explodes.
    #[builder(default = default_max_workers())]
    #[serde(default = "default_max_workers")]
    pub(super) max_workers: usize,

    /// Latency estimate, in milliseconds, before any attempt has completed.
    #[builder(default = default_initial_latency_ms())]
    #[serde(default = "default_initial_latency_ms")]
    pub(super) initial_latency_ms: f64,

    /// Smoothing factor for the latency estimate.
    ///
    /// `new = alpha * sample + (1 - alpha) * previous`
    #[builder(default = default_ewma_alpha())]
    #[serde(default = "default_ewma_alpha")]
    pub(super) ewma_alpha: f64,

    /// Period of the concurrency controller, in milliseconds.
    #[builder(default = default_adjust_interval_ms())]
    #[serde(default = "default_adjust_interval_ms")]
    pub(super) adjust_interval_ms: u64,

    /// Period of the stats report, in milliseconds.
    #[builder(default = default_report_interval_ms())]
    #[serde(default = "default_report_interval_ms")]
    pub(super) report_interval_ms: u64,

    /// Timeout applied to requests created through the convenience senders.
    #[builder(default = default_request_timeout_ms())]
    #[serde(default = "default_request_timeout_ms")]
    pub(super) request_timeout_ms: u64,

    /// Connect timeout of the default reqwest transport.
    #[builder(default = default_connect_timeout_ms())]
    #[serde(default = "default_connect_timeout_ms")]
    pub(super) connect_timeout_ms: u64,

    /// Attempts that may be queued waiting for a free worker.
    #[builder(default = default_queue_capacity())]
    #[serde(default = "default_queue_capacity")]
    pub(super) queue_capacity: usize,

    /// Base delay before a retry. Zero means a retry re-enters the pipeline immediately and is
    /// only paced by the admission gate.
    #[builder(default = default_retry_backoff_ms())]
    #[serde(default = "default_retry_backoff_ms")]
    pub(super) retry_backoff_ms: u64,

    /// Upper bound on a single retry delay.
    #[builder(default = default_retry_backoff_max_ms())]
    #[serde(default = "default_retry_backoff_max_ms")]
    pub(super) retry_backoff_max_ms: u64,

    /// Randomization applied to each retry delay.
    #[builder(default)]
    #[serde(default)]
    pub(super) retry_jitter: JitterMode,
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_breaker_failure_threshold() -> u32 {
    5
}

const fn default_breaker_cooldown_ms() -> u64 {
    35_000
}

const fn default_initial_workers() -> usize {
    4
}

const fn default_min_workers() -> usize {
    1
}

/// Returns the default maximum pool size (200).
///
/// Past this point more workers only add queueing on the downstream.
const fn default_max_workers() -> usize {
    200
}

const fn default_initial_latency_ms() -> f64 {
    200.0
}

const fn default_ewma_alpha() -> f64 {
    0.2
}

const fn default_adjust_interval_ms() -> u64 {
    5_000
}

const fn default_report_interval_ms() -> u64 {
    5_000
}

const fn default_request_timeout_ms() -> u64 {
    35_000
}

const fn default_connect_timeout_ms() -> u64 {
    30_000
}

const fn default_queue_capacity() -> usize {
    10_000
}

const fn default_retry_backoff_ms() -> u64 {
    0
}

const fn default_retry_backoff_max_ms() -> u64 {
    1_000
}

/// A configuration value that cannot drive the client.
#[derive(Debug, Snafu, PartialEq)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("target_tps must be a finite number greater than zero, got {}", value))]
    InvalidTargetTps { value: f64 },

    #[snafu(display("min_workers must be at least 1"))]
    ZeroMinWorkers,

    #[snafu(display("min_workers ({}) must not exceed max_workers ({})", min, max))]
    WorkerBounds { min: usize, max: usize },

    #[snafu(display("breaker_failure_threshold must be at least 1"))]
    ZeroFailureThreshold,

    #[snafu(display("ewma_alpha must be in (0, 1], got {}", value))]
    InvalidEwmaAlpha { value: f64 },

    #[snafu(display("initial_latency_ms must be a finite, non-negative number, got {}", value))]
    InvalidInitialLatency { value: f64 },

    #[snafu(display("queue_capacity must be at least 1"))]
    ZeroQueueCapacity,

    #[snafu(display("{} must be greater than zero", field))]
    ZeroInterval { field: &'static str },
}

impl AdaptiveClientSettings {
    /// Settings with every default applied for the given throughput target.
    pub fn new(target_tps: f64) -> Self {
        Self::builder().target_tps(target_tps).build()
    }

    /// Checks the settings for values the client cannot run with.
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if !self.target_tps.is_finite() || self.target_tps <= 0.0 {
            return InvalidTargetTpsSnafu {
                value: self.target_tps,
            }
            .fail();
        }
        if self.min_workers == 0 {
            return ZeroMinWorkersSnafu.fail();
        }
        if self.min_workers > self.max_workers {
            return WorkerBoundsSnafu {
                min: self.min_workers,
                max: self.max_workers,
            }
            .fail();
        }
        if self.breaker_failure_threshold == 0 {
            return ZeroFailureThresholdSnafu.fail();
        }
        if !(self.ewma_alpha > 0.0 && self.ewma_alpha <= 1.0) {
            return InvalidEwmaAlphaSnafu {
                value: self.ewma_alpha,
            }
            .fail();
        }
        if !self.initial_latency_ms.is_finite() || self.initial_latency_ms < 0.0 {
            return InvalidInitialLatencySnafu {
                value: self.initial_latency_ms,
            }
            .fail();
        }
        if self.queue_capacity == 0 {
            return ZeroQueueCapacitySnafu.fail();
        }
        if self.adjust_interval_ms == 0 {
            return ZeroIntervalSnafu {
                field: "adjust_interval_ms",
            }
            .fail();
        }
        if self.report_interval_ms == 0 {
            return ZeroIntervalSnafu {
                field: "report_interval_ms",
            }
            .fail();
        }
        Ok(())
    }

    pub fn target_tps(&self) -> f64 {
        self.target_tps
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn breaker_failure_threshold(&self) -> u32 {
        self.breaker_failure_threshold
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.breaker_cooldown_ms)
    }

    /// Initial pool size, pulled into `[min_workers, max_workers]`.
    pub fn initial_workers(&self) -> usize {
        self.initial_workers
            .clamp(self.min_workers, self.max_workers.max(self.min_workers))
    }

    pub fn min_workers(&self) -> usize {
        self.min_workers
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn initial_latency_ms(&self) -> f64 {
        self.initial_latency_ms
    }

    pub fn ewma_alpha(&self) -> f64 {
        self.ewma_alpha
    }

    pub fn adjust_interval(&self) -> Duration {
        Duration::from_millis(self.adjust_interval_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn retry_backoff_max(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_max_ms)
    }

    pub fn retry_jitter(&self) -> JitterMode {
        self.retry_jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_tuning() {
        let settings = AdaptiveClientSettings::new(1500.0);
        assert_eq!(settings.max_retries(), 3);
        assert_eq!(settings.breaker_failure_threshold(), 5);
        assert_eq!(settings.breaker_cooldown(), Duration::from_secs(35));
        assert_eq!(settings.initial_workers(), 4);
        assert_eq!(settings.max_workers(), 200);
        assert_eq!(settings.initial_latency_ms(), 200.0);
        assert_eq!(settings.ewma_alpha(), 0.2);
        assert_eq!(settings.adjust_interval(), Duration::from_secs(5));
        assert_eq!(settings.request_timeout(), Duration::from_secs(35));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn deserializes_with_defaults() {
        let settings: AdaptiveClientSettings = serde_json::from_value(serde_json::json!({
            "target_tps": 12.5,
            "max_workers": 32,
            "retry_jitter": "none"
        }))
        .unwrap();
        assert_eq!(settings.target_tps(), 12.5);
        assert_eq!(settings.max_workers(), 32);
        assert_eq!(settings.min_workers(), 1);
        assert_eq!(settings.breaker_failure_threshold(), 5);
        assert_eq!(settings.retry_jitter(), JitterMode::None);
    }

    #[test]
    fn rejects_unusable_values() {
        let bad_tps = AdaptiveClientSettings::new(0.0);
        assert_eq!(
            bad_tps.validate(),
            Err(SettingsError::InvalidTargetTps { value: 0.0 })
        );

        let nan = AdaptiveClientSettings::new(f64::NAN);
        assert!(matches!(
            nan.validate(),
            Err(SettingsError::InvalidTargetTps { .. })
        ));

        let inverted = AdaptiveClientSettings::builder()
            .target_tps(10.0)
            .min_workers(20)
            .max_workers(10)
            .build();
        assert_eq!(
            inverted.validate(),
            Err(SettingsError::WorkerBounds { min: 20, max: 10 })
        );

        let alpha = AdaptiveClientSettings::builder()
            .target_tps(10.0)
            .ewma_alpha(1.5)
            .build();
        assert!(matches!(
            alpha.validate(),
            Err(SettingsError::InvalidEwmaAlpha { .. })
        ));

        let threshold = AdaptiveClientSettings::builder()
            .target_tps(10.0)
            .breaker_failure_threshold(0)
            .build();
        assert_eq!(threshold.validate(), Err(SettingsError::ZeroFailureThreshold));
    }

    #[test]
    fn initial_workers_is_clamped() {
        let settings = AdaptiveClientSettings::builder()
            .target_tps(10.0)
            .initial_workers(500)
            .max_workers(16)
            .build();
        assert_eq!(settings.initial_workers(), 16);
    }
}
