//! The client facade and its dispatch pipeline.
//!
//! Each attempt of a request goes through the same steps: wait on the admission gate, ask the
//! circuit breaker, run on the worker pool, then fold the outcome into the latency estimate, the
//! breaker and the counters. A retryable failure loops back to the gate, so retries are rate
//! limited and breaker checked like first attempts.

use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use http::Method;
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt};

use super::{
    AdaptiveClientSettings, SettingsError,
    admission::AdmissionGate,
    circuit_breaker::{CircuitBreaker, CircuitState},
    controller::ConcurrencyController,
    http::HttpError,
    instant_now,
    internal_event::{
        AttemptLatency, AttemptLatencyData, InternalEventHandle, Registered, RequestCompleted,
        RequestResult, RetryData, RetryScheduled, register,
    },
    latency::LatencyEstimator,
    outcome::{AdaptiveResponse, Outcome, RejectReason},
    reqwest_integration::ReqwestService,
    request::{RawResponse, Request},
    retries::{DefaultRetryLogic, RetryAction, RetryBackoff, RetryLogic},
    stats::{self, ClientStats, StatsSnapshot},
    worker_pool::WorkerPool,
};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ClientError {
    #[snafu(display("Invalid client settings: {}", source))]
    Settings { source: SettingsError },

    #[snafu(display("Failed to build HTTP client: {}", source))]
    BuildClient { source: reqwest::Error },

    #[snafu(display("The client must be created inside a Tokio runtime: {}", source))]
    NoRuntime {
        source: tokio::runtime::TryCurrentError,
    },
}

/// An HTTP client that holds a target throughput against a downstream of varying health.
///
/// Cloning is cheap; clones share the gate, the breaker, the pool and the counters. Background
/// tasks stop when [`AdaptiveHttpClient::shutdown`] is called or the last clone is dropped.
pub struct AdaptiveHttpClient<S = ReqwestService, L = DefaultRetryLogic> {
    inner: Arc<Inner<S, L>>,
}

struct Inner<S, L> {
    settings: AdaptiveClientSettings,
    transport: S,
    logic: L,
    gate: AdmissionGate,
    breaker: CircuitBreaker,
    latency: Arc<LatencyEstimator>,
    stats: Arc<ClientStats>,
    pool: Arc<WorkerPool>,
    backoff: RetryBackoff,
    shutdown: CancellationToken,
    events: Events,
}

struct Events {
    latency: Registered<AttemptLatency>,
    completed: Registered<RequestCompleted>,
    retried: Registered<RetryScheduled>,
}

/// How the pipeline continues after one attempt.
enum Step {
    Succeeded(Outcome),
    Failed(Outcome),
    Retry(Outcome),
    /// The client shut down under the attempt.
    Aborted(Outcome),
}

impl AdaptiveHttpClient {
    /// A client with default settings for `target_tps`, using reqwest as the transport.
    pub fn new(target_tps: f64) -> Result<Self, ClientError> {
        Self::with_settings(AdaptiveClientSettings::new(target_tps))
    }

    pub fn with_settings(settings: AdaptiveClientSettings) -> Result<Self, ClientError> {
        settings.validate().context(SettingsSnafu)?;
        let transport = ReqwestService::new(settings.connect_timeout()).context(BuildClientSnafu)?;
        Self::with_transport(settings, transport)
    }
}

impl<S> AdaptiveHttpClient<S, DefaultRetryLogic>
where
    S: Service<Request, Response = RawResponse> + Clone + Send + Sync + 'static,
    S::Error: Into<crate::Error>,
    S::Future: Send + 'static,
{
    /// A client that sends through `transport` instead of reqwest.
    pub fn with_transport(
        settings: AdaptiveClientSettings,
        transport: S,
    ) -> Result<Self, ClientError> {
        Self::with_transport_and_logic(settings, transport, DefaultRetryLogic)
    }
}

impl<S, L> AdaptiveHttpClient<S, L>
where
    S: Service<Request, Response = RawResponse> + Clone + Send + Sync + 'static,
    S::Error: Into<crate::Error>,
    S::Future: Send + 'static,
    L: RetryLogic,
{
    /// A client with a custom transport and custom retry classification.
    ///
    /// Spawns the worker pool, the concurrency controller and the stats reporter on the current
    /// Tokio runtime.
    pub fn with_transport_and_logic(
        settings: AdaptiveClientSettings,
        transport: S,
        logic: L,
    ) -> Result<Self, ClientError> {
        settings.validate().context(SettingsSnafu)?;
        let runtime = tokio::runtime::Handle::try_current().context(NoRuntimeSnafu)?;
        let gate = AdmissionGate::new(settings.target_tps()).context(SettingsSnafu)?;

        let latency = Arc::new(LatencyEstimator::new(
            settings.initial_latency_ms(),
            settings.ewma_alpha(),
        ));
        let stats = Arc::new(ClientStats::new());
        let pool = Arc::new(WorkerPool::new(
            settings.initial_workers(),
            settings.queue_capacity(),
        ));
        let shutdown = CancellationToken::new();

        let controller = ConcurrencyController::new(
            settings.target_tps(),
            settings.min_workers(),
            settings.max_workers(),
            Arc::clone(&latency),
            Arc::clone(&pool),
        );
        runtime.spawn(controller.run(settings.adjust_interval(), shutdown.clone()));
        runtime.spawn(stats::run_reporter(
            Arc::clone(&stats),
            Arc::clone(&pool),
            settings.report_interval(),
            shutdown.clone(),
        ));

        info!(
            message = "Adaptive client started.",
            target_tps = settings.target_tps(),
            initial_workers = pool.core_size(),
            max_retries = settings.max_retries(),
        );

        Ok(Self {
            inner: Arc::new(Inner {
                backoff: RetryBackoff::new(
                    settings.retry_backoff(),
                    settings.retry_backoff_max(),
                    settings.retry_jitter(),
                ),
                breaker: CircuitBreaker::new(
                    settings.breaker_failure_threshold(),
                    settings.breaker_cooldown(),
                ),
                settings,
                transport,
                logic,
                gate,
                latency,
                stats,
                pool,
                shutdown,
                events: Events {
                    latency: register(AttemptLatency),
                    completed: register(RequestCompleted),
                    retried: register(RetryScheduled),
                },
            }),
        })
    }

    pub async fn get(&self, url: &str) -> AdaptiveResponse {
        self.get_with_headers(url, &[]).await
    }

    pub async fn get_with_headers(&self, url: &str, headers: &[(&str, &str)]) -> AdaptiveResponse {
        self.send(Method::GET, url, headers, None).await
    }

    pub async fn post(
        &self,
        url: &str,
        body: impl Into<Bytes>,
        headers: &[(&str, &str)],
    ) -> AdaptiveResponse {
        self.send(Method::POST, url, headers, Some(body.into()))
            .await
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        headers: &[(&str, &str)],
        body: Option<Bytes>,
    ) -> AdaptiveResponse {
        let timeout = self.inner.settings.request_timeout();
        match Request::from_parts(method, url, headers, body, timeout) {
            Ok(request) => self.submit(request).await,
            Err(error) => {
                let details = match error {
                    HttpError::InvalidRequest { details } => details,
                    other => other.to_string(),
                };
                debug!(message = "Request rejected before dispatch.", %details);
                self.inner.events.completed.emit(RequestResult::Rejected);
                AdaptiveResponse::rejected(RejectReason::InvalidRequest { details }, 0)
            }
        }
    }

    /// Runs `request` through the pipeline until it reaches a terminal result.
    ///
    /// Never fails: every kind of failure is reported through the returned response.
    pub async fn submit(&self, request: Request) -> AdaptiveResponse {
        let inner = &*self.inner;
        let max_retries = inner.settings.max_retries();
        let mut delays = inner.backoff.schedule();
        let mut retries = 0;

        loop {
            inner.gate.acquire().await;
            if retries == 0 {
                inner.stats.record_submitted();
            }

            if !inner.breaker.allow_request() {
                debug!(message = "Circuit open; request rejected.", retries);
                inner.events.completed.emit(RequestResult::Rejected);
                return AdaptiveResponse::rejected(RejectReason::CircuitOpen, retries);
            }

            let attempts = retries + 1;
            match self.attempt(&request).await {
                Step::Succeeded(outcome) => {
                    inner.breaker.record_success();
                    inner.stats.record_succeeded();
                    inner.events.completed.emit(RequestResult::Succeeded);
                    return AdaptiveResponse::new(outcome, attempts);
                }
                Step::Failed(outcome) => {
                    // A request the transport refused to build says nothing about the downstream.
                    let malformed = matches!(
                        &outcome,
                        Outcome::TransportError { cause, .. } if cause.is_request_error()
                    );
                    if !malformed {
                        inner.breaker.record_failure();
                    }
                    inner.stats.record_failed();
                    inner.events.completed.emit(RequestResult::Failed);
                    return AdaptiveResponse::new(outcome, attempts);
                }
                Step::Aborted(outcome) => {
                    debug!(message = "Attempt abandoned by shutdown.", attempts);
                    inner.stats.record_failed();
                    inner.events.completed.emit(RequestResult::Failed);
                    return AdaptiveResponse::new(outcome, attempts);
                }
                Step::Retry(outcome) if retries >= max_retries => {
                    warn!(
                        message = "Retry limit reached.",
                        attempts,
                        last_outcome = outcome.kind(),
                    );
                    inner.breaker.record_failure();
                    inner.stats.record_failed();
                    inner.events.completed.emit(RequestResult::Failed);
                    return AdaptiveResponse::exhausted(outcome, attempts);
                }
                Step::Retry(_) => {
                    retries += 1;
                    inner.events.retried.emit(RetryData {
                        attempt: retries,
                        max_retries,
                    });
                    if let Some(delay) = delays.next().filter(|delay| !delay.is_zero()) {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    /// Runs one attempt on the pool and decides how the pipeline continues.
    async fn attempt(&self, request: &Request) -> Step {
        let inner = &*self.inner;
        let transport = inner.transport.clone();
        let request = request.clone();
        let timeout = request.timeout();

        let job = async move {
            let started = instant_now();
            let result = match tokio::time::timeout(timeout, transport.oneshot(request)).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(error)) => Err(HttpError::from_boxed(error.into())),
                Err(_elapsed) => Err(HttpError::Timeout),
            };
            (result, started.elapsed())
        };

        let (result, latency) = match inner.pool.execute(job).await {
            Ok(done) => done,
            Err(error) => {
                // The attempt never finished, so there is no latency sample to record.
                let cause = HttpError::Cancelled {
                    details: error.to_string(),
                };
                return Step::Aborted(Outcome::TransportError {
                    cause,
                    latency: Duration::ZERO,
                });
            }
        };

        let estimate_ms = inner.latency.record(latency);
        inner.events.latency.emit(AttemptLatencyData {
            observed: latency,
            estimate_ms,
        });

        match result {
            Ok(response) => {
                let action = inner.logic.should_retry_response(&response);
                let RawResponse { status, body, .. } = response;
                debug!(
                    message = "Attempt completed.",
                    %status,
                    latency_ms = latency.as_millis() as u64,
                );
                match action {
                    RetryAction::Successful => Step::Succeeded(Outcome::Success {
                        status,
                        body,
                        latency,
                    }),
                    RetryAction::Retry(reason) => {
                        debug!(message = "Response marked for retry.", %reason);
                        Step::Retry(Outcome::RemoteError {
                            status,
                            body,
                            latency,
                        })
                    }
                    RetryAction::DontRetry(_) => Step::Failed(Outcome::RemoteError {
                        status,
                        body,
                        latency,
                    }),
                }
            }
            Err(cause) => {
                debug!(
                    message = "Attempt failed.",
                    error = %cause,
                    latency_ms = latency.as_millis() as u64,
                );
                let retriable = inner.logic.is_retriable_error(&cause);
                let outcome = Outcome::TransportError { cause, latency };
                if retriable {
                    Step::Retry(outcome)
                } else {
                    Step::Failed(outcome)
                }
            }
        }
    }
}

impl<S, L> AdaptiveHttpClient<S, L> {
    /// Whether `expected` requests were submitted and all of them succeeded or failed.
    ///
    /// See [`ClientStats::is_complete`] for how rejected requests affect this.
    pub fn is_complete(&self, expected: u64) -> bool {
        self.inner.stats.is_complete(expected)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.inner.breaker.state()
    }

    pub fn latency_estimate_ms(&self) -> f64 {
        self.inner.latency.estimate_ms()
    }

    /// Current target size of the worker pool.
    pub fn pool_size(&self) -> usize {
        self.inner.pool.core_size()
    }

    pub fn active_workers(&self) -> usize {
        self.inner.pool.active_workers()
    }

    pub fn settings(&self) -> &AdaptiveClientSettings {
        &self.inner.settings
    }

    /// Stops the controller, the reporter and the worker pool without waiting for in-flight
    /// attempts, and returns the final counters.
    ///
    /// Submissions still in progress resolve as failures at once, without retries and without
    /// counting against the circuit breaker.
    pub fn shutdown(&self) -> StatsSnapshot {
        self.inner.shutdown.cancel();
        self.inner.pool.shutdown();

        let snapshot = self.stats();
        info!(
            message = "Adaptive client stopped.",
            submitted = snapshot.submitted,
            succeeded = snapshot.succeeded,
            failed = snapshot.failed,
            tps = format_args!("{:.2}", snapshot.tps()),
        );
        snapshot
    }
}

impl<S, L> Clone for AdaptiveHttpClient<S, L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, L> fmt::Debug for AdaptiveHttpClient<S, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptiveHttpClient")
            .field("settings", &self.inner.settings)
            .field("breaker", &self.inner.breaker)
            .field("pool", &self.inner.pool)
            .field("stats", &self.inner.stats.snapshot())
            .finish_non_exhaustive()
    }
}

impl<S, L> Drop for Inner<S, L> {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.pool.shutdown();
    }
}
