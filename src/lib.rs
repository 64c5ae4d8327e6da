//! Adaptive outbound HTTP client that sustains a target throughput
//!
//! The client combines four mechanisms around a single dispatch path:
//!
//! 1. **Admission gate**: a smooth rate limiter that never admits attempts faster than the
//!    configured transactions per second
//! 2. **Circuit breaker**: stops sending when the downstream keeps failing and probes for
//!    recovery after a cool-down
//! 3. **Self-sizing worker pool**: a periodic controller resizes the pool from the smoothed
//!    latency using Little's law (`workers = tps * latency`)
//! 4. **Bounded retries**: transport failures re-enter the pipeline (rate limited and breaker
//!    checked again) up to a limit
//!
//! # Basic Usage
//! ```no_run
//! use adaptive_http_client::adaptive_client::AdaptiveHttpClient;
//!
//! # async fn run() -> Result<(), adaptive_http_client::Error> {
//! let client = AdaptiveHttpClient::new(50.0)?;
//! let response = client.get("http://localhost:9090/api/delay/0/1").await;
//! if response.is_successful() {
//!     println!("took {:?}", response.latency());
//! } else {
//!     eprintln!("failed: {}", response.error().unwrap_or_default());
//! }
//! client.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//! See [`adaptive_client::AdaptiveClientSettings`] for every tunable and its default.
//!
//! # Metrics
//! Emits `metrics` counters, gauges and histograms through registered internal events. Nothing
//! is recorded unless the host installs a recorder.
pub mod adaptive_client;
#[cfg(test)]
pub mod test_utils;

#[macro_use]
extern crate tracing;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
