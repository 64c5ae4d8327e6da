use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;
use http::StatusCode;
use metrics_util::debugging::{DebugValue, Snapshotter};
use tracing_subscriber::EnvFilter;

use crate::adaptive_client::{AdaptiveClientSettings, RawResponse, Request, http::HttpError};

/// Request counters from one snapshot, keyed by their `result` label.
pub fn request_counters(snapshotter: &Snapshotter) -> HashMap<String, u64> {
    snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .filter_map(|(key, _, _, value)| {
            let key = key.key();
            if key.name() != "adaptive_client_requests_total" {
                return None;
            }
            let result = key.labels().find(|label| label.key() == "result")?;
            match value {
                DebugValue::Counter(count) => Some((result.value().to_string(), count)),
                _ => None,
            }
        })
        .collect()
}

pub fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Settings for tests: a high admission rate so the gate rarely gets in the way, and controller
/// and report periods long enough that they never fire mid-test.
pub fn fast_settings() -> AdaptiveClientSettings {
    AdaptiveClientSettings::builder()
        .target_tps(1_000.0)
        .adjust_interval_ms(60_000)
        .report_interval_ms(60_000)
        .build()
}

/// A downstream that answers every call with `status` after `delay`, counting calls.
#[derive(Clone)]
pub struct FixedDownstream {
    status: StatusCode,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl FixedDownstream {
    pub fn new(status: StatusCode, delay: Duration) -> Self {
        Self {
            status,
            delay,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl tower::Service<Request> for FixedDownstream {
    type Response = RawResponse;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<RawResponse, Infallible>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let count = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let status = self.status;
        let delay = self.delay;
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            let body = format!("{} {}", request.method(), count);
            Ok(RawResponse::new(status, body))
        })
    }
}

/// A downstream whose calls fail at the transport level with `make_error()`, counting calls.
#[derive(Clone)]
pub struct FailingDownstream {
    make_error: fn() -> HttpError,
    calls: Arc<AtomicUsize>,
}

impl FailingDownstream {
    pub fn new(make_error: fn() -> HttpError) -> Self {
        Self {
            make_error,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl tower::Service<Request> for FailingDownstream {
    type Response = RawResponse;
    type Error = HttpError;
    type Future = futures::future::Ready<Result<RawResponse, HttpError>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, _request: Request) -> Self::Future {
        self.calls.fetch_add(1, Ordering::SeqCst);
        futures::future::ready(Err((self.make_error)()))
    }
}
