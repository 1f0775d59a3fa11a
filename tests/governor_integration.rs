//! End-to-end tests against real `warden-worker` processes.
//!
//! Each test starts a governor whose pool launches the worker binary built
//! alongside this crate, then drives it through the public producer API.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use warden::error::{Error, FailureKind};
use warden::memory::{MemorySampler, RawMemory, WorkerMemoryGauge};
use warden::pool::ProcessLauncher;
use warden::{Governor, Priority, TaskHandle, TaskOutcome, TaskSpec, WardenConfig, http};

/// Maximum time any single wait may take before the test is considered hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const MIB: u64 = 1024 * 1024;

/// Reports a small constant footprint plus whatever the pool attributes to workers.
struct QuietSampler {
    workers: WorkerMemoryGauge,
}

impl MemorySampler for QuietSampler {
    fn read(&self) -> warden::Result<RawMemory> {
        Ok(RawMemory {
            resident_set_size: 16 * MIB,
            external: self.workers.get(),
            ..Default::default()
        })
    }
}

fn config() -> WardenConfig {
    let mut config = WardenConfig::default();
    config.pool.max_workers = 2;
    config.pool.soft_limit_bytes = 32 * MIB;
    config.pool.hard_limit_bytes = 64 * MIB;
    config.pool.monitor_interval = Duration::from_millis(50);
    config.pool.preempt_grace = Duration::from_secs(2);
    config.memory.sample_interval = Duration::from_millis(100);
    config.retry.base_delay = Duration::from_millis(10);
    config.retry.jitter = 0.0;
    config
}

fn start(config: WardenConfig) -> Governor {
    let launcher = Arc::new(ProcessLauncher::new(env!("CARGO_BIN_EXE_warden-worker")));
    let gauge = WorkerMemoryGauge::new();
    let sampler = Arc::new(QuietSampler {
        workers: gauge.clone(),
    });
    Governor::start_with(config, launcher, sampler, gauge).unwrap()
}

async fn outcome(handle: TaskHandle) -> TaskOutcome {
    timeout(TEST_TIMEOUT, handle.outcome())
        .await
        .expect("task did not finish in time")
}

#[tokio::test]
async fn echo_completes_in_a_worker_process() {
    let governor = start(config());
    let handle = governor
        .enqueue(TaskSpec::new(
            Priority::Normal,
            json!({"op": "echo", "value": {"hello": "world"}}),
        ))
        .unwrap();

    assert_eq!(
        outcome(handle).await,
        TaskOutcome::Completed {
            result: json!({"hello": "world"})
        }
    );
    assert_eq!(governor.metrics().worker_spawns, 1);
    governor.shutdown().await;
}

#[tokio::test]
async fn tasks_run_in_parallel_up_to_max_workers() {
    let governor = start(config());
    let handles: Vec<_> = (0..3)
        .map(|_| {
            governor
                .enqueue(TaskSpec::new(
                    Priority::Normal,
                    json!({"op": "steps", "count": 3, "step_ms": 20}),
                ))
                .unwrap()
        })
        .collect();

    for handle in handles {
        assert!(outcome(handle).await.is_success());
    }
    assert!(governor.health().active_workers <= 2);
    assert_eq!(governor.metrics().tasks_completed, 3);
    governor.shutdown().await;
}

#[tokio::test]
async fn worker_over_hard_limit_is_killed() {
    let governor = start(config());
    let handle = governor
        .enqueue(
            TaskSpec::new(Priority::Normal, json!({"op": "alloc", "mb": 128, "hold_ms": 10_000}))
                .with_max_retries(0),
        )
        .unwrap();

    match outcome(handle).await {
        TaskOutcome::Failed { error, attempts } => {
            assert_eq!(error.kind, FailureKind::MemoryLimitExceeded);
            assert_eq!(attempts, 1);
        }
        other => panic!("expected memory failure, got {other:?}"),
    }
    assert!(governor.metrics().worker_hard_kills >= 1);
    governor.shutdown().await;
}

#[tokio::test]
async fn cancelling_a_running_task_preempts_it() {
    let governor = start(config());
    let handle = governor
        .enqueue(TaskSpec::new(
            Priority::Low,
            json!({"op": "steps", "count": 1000, "step_ms": 20}),
        ))
        .unwrap();
    let id = handle.id();

    // Wait until the task is actually running.
    timeout(TEST_TIMEOUT, async {
        while governor.health().queue_total > 0 || governor.health().active_workers == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    })
    .await
    .unwrap();

    assert!(governor.cancel(id).await);
    assert_eq!(outcome(handle).await, TaskOutcome::Cancelled);
    governor.shutdown().await;
}

#[tokio::test]
async fn guarded_failure_opens_the_circuit() {
    let mut cfg = config();
    cfg.breaker.failure_threshold = 1;
    cfg.breaker.base_open_timeout = Duration::from_secs(30);
    let governor = start(cfg);

    let handle = governor
        .enqueue(
            TaskSpec::new(Priority::High, json!({"op": "fail", "message": "503", "guard": "search"}))
                .with_guard("search")
                .with_max_retries(0),
        )
        .unwrap();
    assert!(!outcome(handle).await.is_success());

    let err = governor
        .enqueue(TaskSpec::new(Priority::High, json!({"op": "echo"})).with_guard("search"))
        .unwrap_err();
    assert!(matches!(err, Error::CircuitOpen { ref name, .. } if name == "search"));
    governor.shutdown().await;
}

#[tokio::test]
async fn shutdown_cancels_running_work() {
    let governor = start(config());
    let mut outcomes = governor.subscribe_outcomes();
    let handle = governor
        .enqueue(TaskSpec::new(Priority::Normal, json!({"op": "hang"})))
        .unwrap();

    timeout(TEST_TIMEOUT, async {
        while governor.health().queue_total > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    timeout(TEST_TIMEOUT, governor.shutdown()).await.unwrap();
    assert_eq!(outcome(handle).await, TaskOutcome::Cancelled);
    let event = outcomes.recv().await.unwrap();
    assert_eq!(event.outcome, TaskOutcome::Cancelled);
}

#[tokio::test]
async fn http_surface_reports_health_and_metrics() {
    let governor = Arc::new(start(config()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let cancel = CancellationToken::new();
    let server = tokio::spawn(http::serve(listener, Arc::clone(&governor), cancel.clone()));

    let handle = governor
        .enqueue(TaskSpec::new(Priority::Critical, json!({"op": "echo", "value": 1})))
        .unwrap();
    assert!(outcome(handle).await.is_success());

    let health = timeout(TEST_TIMEOUT, reqwest::get(format!("http://127.0.0.1:{port}/health")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(health.status().as_u16(), 200);
    let body: Value = health.json().await.unwrap();
    assert_eq!(body["memory_state"], "NORMAL");
    assert_eq!(body["pool_degraded"], false);
    assert_eq!(body["queue_depth_by_priority"], json!([0, 0, 0, 0, 0]));

    let metrics: Value = timeout(TEST_TIMEOUT, reqwest::get(format!("http://127.0.0.1:{port}/metrics")))
        .await
        .unwrap()
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["tasks_completed"], 1);
    assert_eq!(metrics["tasks_admitted"], 1);

    cancel.cancel();
    timeout(TEST_TIMEOUT, server).await.unwrap().unwrap().unwrap();
    governor.shutdown().await;
}
