//! Reference worker process: serves the built-in operations over stdio.
//!
//! stdout carries the protocol, so all logging goes to stderr.

use warden::runtime::{self, ops::BuiltinOps};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let worker_id = std::env::var("WARDEN_WORKER_ID").unwrap_or_default();
    tracing::debug!(worker_id = %worker_id, "Worker starting");
    runtime::serve(BuiltinOps).await?;
    Ok(())
}
