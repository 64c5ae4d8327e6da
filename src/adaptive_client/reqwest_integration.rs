use std::{
    task::{Context, Poll},
    time::Duration,
};

use futures::future::BoxFuture;
use tower::Service;

use super::http::HttpError;
use super::request::{RawResponse, Request};

/// A `tower::Service` wrapper for `reqwest::Client`.
///
/// Every answer, whatever its status, is returned as a [`RawResponse`]; classifying the status is
/// left to the retry logic. The per-request timeout of [`Request`] is applied to each call.
#[derive(Clone, Debug)]
pub struct ReqwestService {
    client: reqwest::Client,
}

impl ReqwestService {
    /// Builds a client with the given connect timeout.
    pub fn new(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self::new_with_client(client))
    }

    pub fn new_with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Service<Request> for ReqwestService {
    type Response = RawResponse;
    type Error = HttpError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let url_str = request.uri().to_string();
        let url = match reqwest::Url::parse(&url_str) {
            Ok(url) => url,
            Err(parse_err) => {
                let error = HttpError::InvalidRequest {
                    details: format!("Invalid URL '{}': {}", url_str, parse_err),
                };
                return Box::pin(async move { Err(error) });
            }
        };

        let mut request_builder = self
            .client
            .request(request.method().clone(), url)
            .headers(request.headers().clone())
            .timeout(request.timeout());
        if let Some(body) = request.body() {
            request_builder = request_builder.body(body.clone());
        }

        let request_future = request_builder.send();
        Box::pin(async move {
            let response = request_future.await.map_err(classify)?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await.map_err(classify)?;

            if status.is_server_error() {
                debug!(message = "Downstream answered with a server error.", %status);
            }
            Ok(RawResponse {
                status,
                headers,
                body,
            })
        })
    }
}

fn classify(error: reqwest::Error) -> HttpError {
    if error.is_timeout() {
        HttpError::Timeout
    } else if error.is_builder() {
        HttpError::BuildRequest {
            details: error.to_string(),
        }
    } else if error.is_connect() || error.is_request() || error.is_body() {
        HttpError::Transport {
            source: Box::new(error),
        }
    } else {
        HttpError::ClientError {
            source: Box::new(error),
        }
    }
}
