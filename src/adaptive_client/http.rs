use crate::Error as CrateError;
use snafu::Snafu;
use tower::timeout::error::Elapsed;

/// Failures of a single attempt where the downstream never produced a status code.
///
/// Transports may return this type directly or any error that converts into
/// [`crate::Error`]; the pipeline recovers an `HttpError` from the boxed value with
/// [`HttpError::from_boxed`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HttpError {
    /// An error occurred during the transport of the request (e.g., network issue, DNS).
    #[snafu(display("HTTP transport error: {}", source))]
    Transport { source: CrateError },

    /// The attempt ran past its per-request timeout.
    #[snafu(display("HTTP request timed out"))]
    Timeout,

    /// The attempt was abandoned before it completed, usually because the client shut down.
    #[snafu(display("HTTP request cancelled: {}", details))]
    Cancelled { details: String },

    /// The request itself was malformed or invalid before sending.
    #[snafu(display("Invalid HTTP request: {}", details))]
    InvalidRequest { details: String },

    /// An error occurred while building the request.
    #[snafu(display("Failed to build HTTP request: {}", details))]
    BuildRequest { details: String },

    /// Other, unspecified HTTP client errors (for example a body that failed to decode).
    #[snafu(display("Generic HTTP client error: {}", source))]
    ClientError { source: CrateError },
}

impl HttpError {
    /// Recovers the attempt error from a transport's boxed error.
    ///
    /// `tower` timeouts become [`HttpError::Timeout`]; anything that is not already an
    /// `HttpError` is treated as a transport failure.
    pub fn from_boxed(error: CrateError) -> Self {
        match error.downcast::<HttpError>() {
            Ok(http_error) => *http_error,
            Err(error) if error.is::<Elapsed>() => HttpError::Timeout,
            Err(error) => HttpError::Transport { source: error },
        }
    }

    /// True when the request was rejected before reaching the network.
    pub const fn is_request_error(&self) -> bool {
        matches!(
            self,
            HttpError::InvalidRequest { .. } | HttpError::BuildRequest { .. }
        )
    }
}
