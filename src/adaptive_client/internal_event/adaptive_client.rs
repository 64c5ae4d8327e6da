use std::time::Duration;

use metrics::{Counter, Gauge, Histogram, counter, gauge, histogram};

use crate::adaptive_client::CircuitState;
use crate::registered_event;

#[derive(Clone, Copy, Debug)]
pub struct AttemptLatencyData {
    pub observed: Duration,
    pub estimate_ms: f64,
}

registered_event! {
    AttemptLatency => {
        observed: Histogram = histogram!("adaptive_client_attempt_latency_seconds"),
        estimate: Gauge = gauge!("adaptive_client_latency_estimate_ms"),
    }

    fn emit(&self, data: AttemptLatencyData) {
        self.observed.record(data.observed);
        self.estimate.set(data.estimate_ms);
        trace!(
            target: "adaptive_client::stats",
            observed_ms = data.observed.as_millis() as u64,
            estimate_ms = data.estimate_ms,
            "Latency Observed"
        );
    }
}

/// How a submission ended, as far as the counters are concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestResult {
    Succeeded,
    Failed,
    Rejected,
}

registered_event! {
    RequestCompleted => {
        succeeded: Counter = counter!("adaptive_client_requests_total", "result" => "succeeded"),
        failed: Counter = counter!("adaptive_client_requests_total", "result" => "failed"),
        rejected: Counter = counter!("adaptive_client_requests_total", "result" => "rejected"),
    }

    fn emit(&self, result: RequestResult) {
        match result {
            RequestResult::Succeeded => self.succeeded.increment(1),
            RequestResult::Failed => self.failed.increment(1),
            RequestResult::Rejected => self.rejected.increment(1),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RetryData {
    pub attempt: u32,
    pub max_retries: u32,
}

registered_event! {
    RetryScheduled => {
        retries: Counter = counter!("adaptive_client_retries_total"),
    }

    fn emit(&self, data: RetryData) {
        self.retries.increment(1);
        warn!(
            message = "Retrying request.",
            attempt = data.attempt,
            max_retries = data.max_retries,
        );
    }
}

registered_event! {
    CircuitStateChanged => {
        state: Gauge = gauge!("adaptive_client_circuit_state"),
        transitions: Counter = counter!("adaptive_client_circuit_transitions_total"),
    }

    fn emit(&self, state: CircuitState) {
        // 0 = closed, 1 = half-open, 2 = open
        let level = match state {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        };
        self.state.set(level);
        self.transitions.increment(1);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PoolResizeData {
    pub previous: usize,
    pub size: usize,
    pub latency_estimate_ms: f64,
}

registered_event! {
    WorkerPoolResized => {
        pool_size: Gauge = gauge!("adaptive_client_pool_size"),
    }

    fn emit(&self, data: PoolResizeData) {
        self.pool_size.set(data.size as f64);
        info!(
            target: "adaptive_client::stats",
            previous = data.previous,
            size = data.size,
            latency_estimate_ms = data.latency_estimate_ms as u64,
            "Adjusted worker pool size."
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct StatsReportData {
    pub tps: f64,
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub active_workers: usize,
    pub pool_size: usize,
    pub uptime: Duration,
}

registered_event! {
    StatsReported => {
        tps: Gauge = gauge!("adaptive_client_tps"),
        submitted: Gauge = gauge!("adaptive_client_submitted"),
        succeeded: Gauge = gauge!("adaptive_client_succeeded"),
        failed: Gauge = gauge!("adaptive_client_failed"),
        active_workers: Gauge = gauge!("adaptive_client_active_workers"),
    }

    fn emit(&self, data: StatsReportData) {
        self.tps.set(data.tps);
        self.submitted.set(data.submitted as f64);
        self.succeeded.set(data.succeeded as f64);
        self.failed.set(data.failed as f64);
        self.active_workers.set(data.active_workers as f64);
        info!(
            target: "adaptive_client::stats",
            tps = format_args!("{:.2}", data.tps),
            succeeded = data.succeeded,
            failed = data.failed,
            submitted = data.submitted,
            active_workers = data.active_workers,
            pool_size = data.pool_size,
            uptime_secs = data.uptime.as_secs(),
            "Client stats."
        );
    }
}
