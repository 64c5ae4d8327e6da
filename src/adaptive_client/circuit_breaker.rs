//! Three-state circuit breaker for a single downstream.
//!
//! The state, the consecutive failure count and the time of the last failure change together,
//! so they live behind one short-lived lock instead of three independent atomics. No lock is
//! held across an `.await`.

use std::{fmt, time::Duration};

use parking_lot::Mutex;
use tokio::time::Instant;

use super::instant_now;
use super::internal_event::{CircuitStateChanged, InternalEventHandle, Registered, register};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerState>,
    transitions: Registered<CircuitStateChanged>,
}

impl CircuitBreaker {
    /// `failure_threshold` consecutive failures open the circuit; a probe is admitted once
    /// `cooldown` has passed since the last failure.
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
            }),
            transitions: register(CircuitStateChanged),
        }
    }

    /// Decides whether the next attempt may go out.
    ///
    /// An open circuit whose cool-down has elapsed moves to half-open and admits the caller.
    /// While half-open every caller is admitted until a success or failure settles the state.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled_down = inner
                    .last_failure
                    .is_none_or(|at| instant_now().saturating_duration_since(at) >= self.cooldown);
                if cooled_down {
                    inner.state = CircuitState::HalfOpen;
                    drop(inner);
                    self.transitioned(CircuitState::HalfOpen);
                }
                cooled_down
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        let previous = std::mem::replace(&mut inner.state, CircuitState::Closed);
        drop(inner);

        if previous != CircuitState::Closed {
            self.transitioned(CircuitState::Closed);
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(instant_now());

        let opens = match inner.state {
            CircuitState::Closed => inner.consecutive_failures >= self.failure_threshold,
            CircuitState::HalfOpen => true,
            // Already open: the cool-down restarts from this failure.
            CircuitState::Open => false,
        };
        if opens {
            inner.state = CircuitState::Open;
        }
        let failures = inner.consecutive_failures;
        drop(inner);

        if opens {
            warn!(
                message = "Circuit breaker opened.",
                consecutive_failures = failures,
                cooldown_ms = self.cooldown.as_millis() as u64,
            );
            self.transitions.emit(CircuitState::Open);
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    fn transitioned(&self, to: CircuitState) {
        info!(message = "Circuit breaker state changed.", state = %to);
        self.transitions.emit(to);
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("failure_threshold", &self.failure_threshold)
            .field("cooldown", &self.cooldown)
            .field("state", &inner.state)
            .field("consecutive_failures", &inner.consecutive_failures)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::time;

    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(35);

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_probes_after_cooldown() {
        let breaker = CircuitBreaker::new(5, COOLDOWN);

        for _ in 0..4 {
            breaker.record_failure();
            assert!(breaker.allow_request());
        }
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());

        time::advance(COOLDOWN - Duration::from_millis(1)).await;
        assert!(!breaker.allow_request());

        time::advance(Duration::from_millis(1)).await;
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Half-open admits everyone, not just one probe.
        assert!(breaker.allow_request());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn single_failure_while_half_open_reopens() {
        let breaker = CircuitBreaker::new(3, COOLDOWN);
        for _ in 0..3 {
            breaker.record_failure();
        }
        time::advance(COOLDOWN).await;
        assert!(breaker.allow_request());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_streak() {
        let breaker = CircuitBreaker::new(3, COOLDOWN);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_while_open_extends_cooldown() {
        let breaker = CircuitBreaker::new(1, COOLDOWN);
        breaker.record_failure();

        time::advance(Duration::from_secs(30)).await;
        breaker.record_failure();

        time::advance(Duration::from_secs(10)).await;
        assert!(!breaker.allow_request());

        time::advance(Duration::from_secs(25)).await;
        assert!(breaker.allow_request());
    }

    #[tokio::test]
    async fn concurrent_failures_open_exactly_once() {
        let breaker = Arc::new(CircuitBreaker::new(5, COOLDOWN));

        let tasks = (0..5)
            .map(|_| {
                let breaker = Arc::clone(&breaker);
                tokio::spawn(async move { breaker.record_failure() })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.consecutive_failures(), 5);
    }
}
