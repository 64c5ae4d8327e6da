// demos/delay_server.rs

// A downstream with unpredictable latency, for driving the load test against.
//
// `GET /api/delay/{delay}/{count}` and `POST /api/delay/{delay}/{count}` sleep for `delay`
// seconds, then one call in five sleeps again for a long spike (40s for GET, 10s for POST).
// Both answer 200 with `count` as the body.
//
// The listen address comes from `DELAY_SERVER_ADDR` (default `0.0.0.0:9090`).

use std::{env, time::Duration};

use axum::{Router, extract::Path, routing::get};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt};

const SPIKE_PROBABILITY: f64 = 0.2;
const GET_SPIKE: Duration = Duration::from_secs(40);
const POST_SPIKE: Duration = Duration::from_secs(10);

async fn delayed(delay_secs: u64, count: u64, spike: Duration) -> String {
    tokio::time::sleep(Duration::from_secs(delay_secs)).await;
    if rand::random_bool(SPIKE_PROBABILITY) {
        info!(count, spike_secs = spike.as_secs(), "Latency spike");
        tokio::time::sleep(spike).await;
    }
    count.to_string()
}

async fn delay_get(Path((delay, count)): Path<(u64, u64)>) -> String {
    delayed(delay, count, GET_SPIKE).await
}

async fn delay_post(Path((delay, count)): Path<(u64, u64)>) -> String {
    delayed(delay, count, POST_SPIKE).await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    tracing_fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let addr = env::var("DELAY_SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:9090".to_string());
    let app = Router::new().route(
        "/api/delay/{delay}/{count}",
        get(delay_get).post(delay_post),
    );

    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %listener.local_addr()?, "Delay server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
