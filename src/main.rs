use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use warden::heartbeat::HeartbeatProducer;
use warden::pool::ProcessLauncher;
use warden::{Governor, WardenConfig, http};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Keep the appender guard alive so buffered lines are flushed on exit.
    let _log_guard = init_tracing();

    let config = WardenConfig::from_env().context("invalid configuration")?;
    eprintln!("🛡  Warden v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Worker: {}", config.worker.program.display());
    eprintln!(
        "   Memory ceiling: {} MiB, workers: {}",
        config.memory.ceiling_bytes / (1024 * 1024),
        config.pool.max_workers
    );
    eprintln!("   Health: http://{}/health", config.http.bind);

    let launcher = Arc::new(ProcessLauncher::from_config(&config.worker));
    let governor = Arc::new(Governor::start(config.clone(), launcher)?);
    let cancel = CancellationToken::new();

    let heartbeat = if config.heartbeat.enabled {
        let producer = HeartbeatProducer::new(&config.heartbeat)?;
        eprintln!("   Heartbeats: {}", config.heartbeat.schedule);
        Some(producer.spawn(Arc::clone(&governor), cancel.child_token()))
    } else {
        eprintln!("   Heartbeats: disabled");
        None
    };

    let listener = tokio::net::TcpListener::bind(config.http.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.http.bind))?;
    let server = tokio::spawn(http::serve(
        listener,
        Arc::clone(&governor),
        cancel.child_token(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("Shutdown signal received");

    cancel.cancel();
    if let Some(handle) = heartbeat {
        let _ = handle.await;
    }
    governor.shutdown().await;
    match server.await {
        Ok(result) => result.context("HTTP server failed")?,
        Err(e) => tracing::warn!(error = %e, "HTTP server task panicked"),
    }
    Ok(())
}

/// Console logging, plus a daily rolling file when `WARDEN_LOG_DIR` is set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    match std::env::var("WARDEN_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "warden.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false),
                )
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::registry().with(filter).with(console).init();
            None
        }
    }
}
