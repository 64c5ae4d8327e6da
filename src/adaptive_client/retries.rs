use std::{borrow::Cow, time::Duration};

use serde::Deserialize;

use super::http::HttpError;
use super::request::RawResponse;

pub enum RetryAction {
    /// Indicate that this request should be retried with a reason
    Retry(Cow<'static, str>),
    /// Indicate that this request should not be retried with a reason
    DontRetry(Cow<'static, str>),
    /// Indicate that this request should not be retried but the request was successful
    Successful,
}

impl RetryAction {
    pub const fn is_not_retryable(&self) -> bool {
        matches!(self, RetryAction::DontRetry(_))
    }

    pub const fn is_successful(&self) -> bool {
        matches!(self, RetryAction::Successful)
    }
}

/// Classifies attempt results for the dispatch pipeline.
pub trait RetryLogic: Clone + Send + Sync + 'static {
    /// When the transport returns an error, decides whether the attempt may be repeated.
    fn is_retriable_error(&self, error: &HttpError) -> bool;

    /// When the downstream answered, decides whether the status means success, a terminal
    /// failure, or a failure worth another attempt.
    ///
    /// The default treats anything below 400 as success and everything else as terminal.
    fn should_retry_response(&self, response: &RawResponse) -> RetryAction {
        if response.status.as_u16() < 400 {
            RetryAction::Successful
        } else {
            RetryAction::DontRetry(Cow::Owned(format!(
                "Bad status: {}",
                response.status.as_u16()
            )))
        }
    }
}

/// Retries every transport failure except requests that could not be built.
///
/// An error status is never retried: the downstream answered, so the failure is taken to be
/// an application-level rejection.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultRetryLogic;

impl RetryLogic for DefaultRetryLogic {
    fn is_retriable_error(&self, error: &HttpError) -> bool {
        !error.is_request_error()
    }
}

/// The jitter mode to use for retry backoff behavior.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterMode {
    /// No jitter.
    None,

    /// Full jitter.
    ///
    /// The random delay is anywhere from 0 up to the maximum current delay calculated by the backoff
    /// strategy.
    #[default]
    Full,
}

/// Delays between the attempts of one request.
///
/// Doubles from `base` up to `max`. A zero base disables backoff entirely, so retries re-enter
/// the pipeline at once and are paced only by the admission gate.
#[derive(Clone, Copy, Debug)]
pub struct RetryBackoff {
    base: Duration,
    max: Duration,
    jitter: JitterMode,
}

impl RetryBackoff {
    pub const fn new(base: Duration, max: Duration, jitter: JitterMode) -> Self {
        Self { base, max, jitter }
    }

    pub const fn disabled() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, JitterMode::None)
    }

    pub const fn is_enabled(&self) -> bool {
        !self.base.is_zero()
    }

    /// A fresh schedule for one request: the first item is the delay before the first retry.
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + Send + use<> {
        let base_ms = self.base.as_millis().min(u64::MAX as u128) as u64;
        let jitter = self.jitter;
        let enabled = self.is_enabled();

        // base, 2 * base, 4 * base, ...
        std::iter::once(self.base)
            .chain(
                ExponentialBackoff::from_millis(2)
                    .factor(base_ms)
                    .max_delay(self.max.max(self.base)),
            )
            .map(move |delay| match (enabled, jitter) {
                (false, _) => Duration::ZERO,
                (true, JitterMode::None) => delay,
                (true, JitterMode::Full) => full_jitter(delay),
            })
    }
}

fn full_jitter(delay: Duration) -> Duration {
    let ms = delay.as_millis().min(u64::MAX as u128) as u64;
    if ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::random_range(0..=ms))
}

// `tokio-retry` crate related code - ExponentialBackoff
// MIT License
// Copyright (c) 2017 Sam Rijs
//
/// A retry strategy driven by exponential back-off.
///
/// The power corresponds to the number of past attempts.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current: u64,
    base: u64,
    factor: u64,
    max_delay: Option<Duration>,
}

impl ExponentialBackoff {
    /// Constructs a new exponential back-off strategy,
    /// given a base duration in milliseconds.
    ///
    /// The resulting duration is calculated by taking the base to the `n`-th power,
    /// where `n` denotes the number of past attempts.
    pub const fn from_millis(base: u64) -> ExponentialBackoff {
        ExponentialBackoff {
            current: base,
            base,
            factor: 1u64,
            max_delay: None,
        }
    }

    /// A multiplicative factor that will be applied to the retry delay.
    ///
    /// Default factor is `1`.
    pub const fn factor(mut self, factor: u64) -> ExponentialBackoff {
        self.factor = factor;
        self
    }

    /// Apply a maximum delay. No retry delay will be longer than this `Duration`.
    pub const fn max_delay(mut self, duration: Duration) -> ExponentialBackoff {
        self.max_delay = Some(duration);
        self
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let duration = Duration::from_millis(self.current.saturating_mul(self.factor));

        if let Some(max_delay) = self.max_delay {
            if duration > max_delay {
                return Some(max_delay);
            }
        }

        self.current = self.current.saturating_mul(self.base);
        Some(duration)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::StatusCode;

    use super::*;

    #[test]
    fn default_logic_retries_transport_failures_only() {
        let logic = DefaultRetryLogic;
        assert!(logic.is_retriable_error(&HttpError::Timeout));
        assert!(logic.is_retriable_error(&HttpError::Cancelled {
            details: "worker stopped".into()
        }));
        assert!(logic.is_retriable_error(&HttpError::Transport {
            source: "connection reset".into()
        }));
        assert!(!logic.is_retriable_error(&HttpError::InvalidRequest {
            details: "no scheme".into()
        }));
        assert!(!logic.is_retriable_error(&HttpError::BuildRequest {
            details: "bad header".into()
        }));
    }

    #[test]
    fn default_logic_splits_status_at_400() {
        let logic = DefaultRetryLogic;
        let response = |code: u16| RawResponse::new(StatusCode::from_u16(code).unwrap(), Bytes::new());

        assert!(logic.should_retry_response(&response(200)).is_successful());
        assert!(logic.should_retry_response(&response(302)).is_successful());
        assert!(logic.should_retry_response(&response(404)).is_not_retryable());
        assert!(logic.should_retry_response(&response(503)).is_not_retryable());
    }

    #[test]
    fn exponential_backoff_doubles_until_capped() {
        let delays = ExponentialBackoff::from_millis(2)
            .factor(50)
            .max_delay(Duration::from_millis(500))
            .take(5)
            .collect::<Vec<_>>();
        assert_eq!(
            delays,
            [100, 200, 400, 500, 500].map(Duration::from_millis).to_vec()
        );
    }

    #[test]
    fn disabled_backoff_never_waits() {
        let backoff = RetryBackoff::disabled();
        assert!(!backoff.is_enabled());
        assert!(backoff.schedule().take(4).all(|delay| delay.is_zero()));
    }

    #[test]
    fn schedule_without_jitter_starts_at_base() {
        let backoff = RetryBackoff::new(
            Duration::from_millis(100),
            Duration::from_millis(300),
            JitterMode::None,
        );
        let delays = backoff.schedule().take(4).collect::<Vec<_>>();
        assert_eq!(delays, [100, 200, 300, 300].map(Duration::from_millis).to_vec());
    }

    #[test]
    fn schedule_starts_at_an_odd_base() {
        for base in [1, 101] {
            let backoff = RetryBackoff::new(
                Duration::from_millis(base),
                Duration::from_secs(10),
                JitterMode::None,
            );
            let delays = backoff.schedule().take(3).collect::<Vec<_>>();
            assert_eq!(
                delays,
                [base, 2 * base, 4 * base].map(Duration::from_millis).to_vec()
            );
        }
    }

    #[test]
    fn full_jitter_stays_under_the_delay() {
        let backoff = RetryBackoff::new(
            Duration::from_millis(100),
            Duration::from_millis(1_000),
            JitterMode::Full,
        );
        let caps = [100, 200, 400, 800, 1_000].map(Duration::from_millis);
        for (delay, cap) in backoff.schedule().zip(caps) {
            assert!(delay <= cap, "{:?} exceeds {:?}", delay, cap);
        }
    }
}
