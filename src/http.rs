//! Health and metrics over HTTP.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::health::HealthSnapshot;
use crate::metrics::MetricsSnapshot;
use crate::scheduler::Governor;

/// Build the router for `/health` and `/metrics`.
pub fn routes(governor: Arc<Governor>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(governor)
}

/// 503 while degraded or at CRITICAL and above; the body is the same either way.
async fn health(State(governor): State<Arc<Governor>>) -> (StatusCode, Json<HealthSnapshot>) {
    let snapshot = governor.health();
    let status = if snapshot.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(snapshot))
}

async fn metrics(State(governor): State<Arc<Governor>>) -> Json<MetricsSnapshot> {
    Json(governor.metrics())
}

/// Serve until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    governor: Arc<Governor>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "HTTP server listening");
    axum::serve(listener, routes(governor))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Value;

    use super::*;
    use crate::config::WardenConfig;
    use crate::memory::WorkerMemoryGauge;
    use crate::memory::monitor::tests::FixedSampler;
    use crate::pool::sim::SimLauncher;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn health_reflects_memory_state() {
        let mut config = WardenConfig::default();
        config.memory.ceiling_bytes = 100;
        config.memory.smoothing_window = 1;
        config.memory.sample_interval = Duration::from_secs(3600);
        let (launcher, _workers) = SimLauncher::new();
        let sampler = FixedSampler::new(10);
        let governor = Arc::new(
            Governor::start_with(config, launcher, sampler.clone(), WorkerMemoryGauge::new()).unwrap(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(listener, Arc::clone(&governor), cancel.clone()));
        let base = format!("http://127.0.0.1:{port}");

        let resp = tokio::time::timeout(TEST_TIMEOUT, reqwest::get(format!("{base}/health")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["memory_state"], "NORMAL");
        assert_eq!(body["queue_total"], 0);

        sampler.set(90);
        governor.memory().tick();
        let resp = tokio::time::timeout(TEST_TIMEOUT, reqwest::get(format!("{base}/health")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.status().as_u16(), 503);

        let metrics: Value = tokio::time::timeout(TEST_TIMEOUT, reqwest::get(format!("{base}/metrics")))
            .await
            .unwrap()
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(metrics["memory_threshold_crossings"], 1);

        cancel.cancel();
        tokio::time::timeout(TEST_TIMEOUT, server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
