use std::{borrow::Cow, fmt, time::Duration};

use bytes::Bytes;
use http::StatusCode;

use super::http::HttpError;

/// Result of one attempt. Exactly one variant is produced per attempt.
#[derive(Debug)]
pub enum Outcome {
    /// The downstream answered with a non-error status.
    Success {
        status: StatusCode,
        body: Bytes,
        latency: Duration,
    },
    /// The downstream answered with an error status.
    RemoteError {
        status: StatusCode,
        body: Bytes,
        latency: Duration,
    },
    /// The call itself failed: I/O, timeout or cancellation.
    TransportError { cause: HttpError, latency: Duration },
    /// The call was never attempted.
    Rejected { reason: RejectReason },
}

/// Why a request never reached the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// The circuit breaker denied the attempt.
    CircuitOpen,
    /// The request could not be constructed from the caller's input.
    InvalidRequest { details: String },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::CircuitOpen => write!(f, "Circuit breaker is open"),
            RejectReason::InvalidRequest { details } => write!(f, "Invalid request: {}", details),
        }
    }
}

impl Outcome {
    /// Wall-clock duration of the attempt; zero when it was never attempted.
    pub fn latency(&self) -> Duration {
        match self {
            Outcome::Success { latency, .. }
            | Outcome::RemoteError { latency, .. }
            | Outcome::TransportError { latency, .. } => *latency,
            Outcome::Rejected { .. } => Duration::ZERO,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Outcome::Success { .. } => "success",
            Outcome::RemoteError { .. } => "remote_error",
            Outcome::TransportError { .. } => "transport_error",
            Outcome::Rejected { .. } => "rejected",
        }
    }
}

/// The terminal result of a submission: the last outcome of its retry chain.
///
/// Failures are values, never errors. Callers check [`AdaptiveResponse::is_successful`] and read
/// [`AdaptiveResponse::error`] for a human-readable reason.
#[derive(Debug)]
pub struct AdaptiveResponse {
    outcome: Outcome,
    attempts: u32,
    retries_exhausted: bool,
}

impl AdaptiveResponse {
    pub(crate) fn new(outcome: Outcome, attempts: u32) -> Self {
        Self {
            outcome,
            attempts,
            retries_exhausted: false,
        }
    }

    /// A failure produced because the retry budget ran out.
    pub(crate) fn exhausted(outcome: Outcome, attempts: u32) -> Self {
        Self {
            outcome,
            attempts,
            retries_exhausted: true,
        }
    }

    pub(crate) fn rejected(reason: RejectReason, attempts: u32) -> Self {
        Self::new(Outcome::Rejected { reason }, attempts)
    }

    pub fn is_successful(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }

    /// Why the submission failed, or `None` on success.
    pub fn error(&self) -> Option<String> {
        match &self.outcome {
            Outcome::Success { .. } => None,
            Outcome::RemoteError { status, .. } if self.retries_exhausted => Some(format!(
                "Retry limit reached: bad status {}",
                status.as_u16()
            )),
            Outcome::RemoteError { status, .. } => Some(format!("Bad status: {}", status.as_u16())),
            Outcome::TransportError { cause, .. } if self.retries_exhausted => {
                Some(format!("Retry limit reached: {}", cause))
            }
            Outcome::TransportError { cause, .. } => Some(format!("Request failed: {}", cause)),
            Outcome::Rejected { reason } => Some(reason.to_string()),
        }
    }

    /// Status code, when the downstream answered.
    pub fn status(&self) -> Option<StatusCode> {
        match &self.outcome {
            Outcome::Success { status, .. } | Outcome::RemoteError { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Response body, when the downstream answered.
    pub fn body(&self) -> Option<&Bytes> {
        match &self.outcome {
            Outcome::Success { body, .. } | Outcome::RemoteError { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Response body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> Option<Cow<'_, str>> {
        self.body().map(|body| String::from_utf8_lossy(body))
    }

    /// Duration of the final attempt.
    pub fn latency(&self) -> Duration {
        self.outcome.latency()
    }

    /// Attempts made, including the final one. Zero when the request was never built.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// True when the request failed only because it ran out of retries.
    pub fn retries_exhausted(&self) -> bool {
        self.retries_exhausted
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.outcome, Outcome::Rejected { .. })
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_has_no_error() {
        let response = AdaptiveResponse::new(
            Outcome::Success {
                status: StatusCode::OK,
                body: Bytes::from_static(b"42"),
                latency: Duration::from_millis(12),
            },
            1,
        );
        assert!(response.is_successful());
        assert_eq!(response.error(), None);
        assert_eq!(response.text().as_deref(), Some("42"));
        assert_eq!(response.latency(), Duration::from_millis(12));
    }

    #[test]
    fn failure_reasons_are_readable() {
        let remote = AdaptiveResponse::new(
            Outcome::RemoteError {
                status: StatusCode::SERVICE_UNAVAILABLE,
                body: Bytes::new(),
                latency: Duration::from_millis(3),
            },
            1,
        );
        assert_eq!(remote.error().as_deref(), Some("Bad status: 503"));
        assert_eq!(remote.status(), Some(StatusCode::SERVICE_UNAVAILABLE));

        let exhausted = AdaptiveResponse::exhausted(
            Outcome::TransportError {
                cause: HttpError::Timeout,
                latency: Duration::from_secs(35),
            },
            4,
        );
        assert_eq!(
            exhausted.error().as_deref(),
            Some("Retry limit reached: HTTP request timed out")
        );
        assert_eq!(exhausted.attempts(), 4);
        assert!(exhausted.retries_exhausted());
        assert!(exhausted.status().is_none());

        let not_retried = AdaptiveResponse::new(
            Outcome::TransportError {
                cause: HttpError::InvalidRequest {
                    details: "no host".to_string(),
                },
                latency: Duration::ZERO,
            },
            1,
        );
        assert_eq!(
            not_retried.error().as_deref(),
            Some("Request failed: Invalid HTTP request: no host")
        );

        let rejected = AdaptiveResponse::rejected(RejectReason::CircuitOpen, 1);
        assert!(rejected.is_rejected());
        assert_eq!(rejected.error().as_deref(), Some("Circuit breaker is open"));
        assert_eq!(rejected.latency(), Duration::ZERO);
    }
}
