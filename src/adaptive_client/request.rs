use std::time::Duration;

use bon::Builder;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};

use super::http::HttpError;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(35);

/// An outbound request. Immutable once built; the pipeline clones it for every attempt.
#[derive(Clone, Debug, PartialEq, Builder)]
pub struct Request {
    #[builder(default = Method::GET)]
    method: Method,
    uri: Uri,
    #[builder(default)]
    headers: HeaderMap,
    body: Option<Bytes>,
    /// Deadline of a single attempt, not of the whole retry chain.
    #[builder(default = DEFAULT_REQUEST_TIMEOUT)]
    timeout: Duration,
}

impl Request {
    /// Builds a request from string parts, rejecting unparseable URLs and header pairs.
    pub fn from_parts(
        method: Method,
        url: &str,
        headers: &[(&str, &str)],
        body: Option<Bytes>,
        timeout: Duration,
    ) -> Result<Self, HttpError> {
        let uri = url.parse::<Uri>().map_err(|e| HttpError::InvalidRequest {
            details: format!("Invalid URL '{}': {}", url, e),
        })?;

        let mut header_map = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                HttpError::InvalidRequest {
                    details: format!("Invalid header name '{}': {}", name, e),
                }
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| HttpError::InvalidRequest {
                details: format!("Invalid value for header '{}': {}", name, e),
            })?;
            header_map.append(name, value);
        }

        Ok(Self {
            method,
            uri,
            headers: header_map,
            body,
            timeout,
        })
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// What a transport returns when the downstream answered, whatever the status.
#[derive(Clone, Debug, PartialEq)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RawResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }
}
