//! Launching worker processes.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use super::WorkerId;
use crate::config::WorkerProcessConfig;
use crate::error::{Error, Result};
use crate::memory::sampler::resident_bytes;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Measures a worker's resident memory out of band.
pub trait MemoryProbe: Send + Sync {
    fn resident_bytes(&self) -> Option<u64>;
}

/// Control over a launched worker's lifetime.
#[async_trait]
pub trait WorkerProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Terminate unconditionally.
    async fn kill(&mut self) -> io::Result<()>;

    /// Reap after the worker closed its stdout.
    async fn wait(&mut self) -> io::Result<Option<i32>>;
}

/// A launched worker: its pipes plus lifetime control.
pub struct WorkerConnection {
    /// Worker → pool frames.
    pub reader: BoxedReader,
    /// Pool → worker frames.
    pub writer: BoxedWriter,
    pub process: Box<dyn WorkerProcess>,
    pub probe: Arc<dyn MemoryProbe>,
}

/// Creates isolated workers.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, id: WorkerId) -> Result<WorkerConnection>;
}

/// Spawns an OS process speaking the protocol over stdin/stdout.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn from_config(config: &WorkerProcessConfig) -> Self {
        Self::new(config.program.clone()).with_args(config.args.clone())
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, id: WorkerId) -> Result<WorkerConnection> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("WARDEN_WORKER_ID", id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::WorkerSpawnFailed {
                reason: format!("{}: {e}", self.program.display()),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| Error::WorkerSpawnFailed {
            reason: "worker stdin not captured".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| Error::WorkerSpawnFailed {
            reason: "worker stdout not captured".to_string(),
        })?;
        let pid = child.id();

        Ok(WorkerConnection {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            process: Box::new(ChildProcess { child }),
            probe: Arc::new(PidProbe { pid }),
        })
    }
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.child.wait().await?.code())
    }
}

struct PidProbe {
    pid: Option<u32>,
}

impl MemoryProbe for PidProbe {
    fn resident_bytes(&self) -> Option<u64> {
        self.pid.and_then(resident_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_program_is_spawn_failure() {
        let launcher = ProcessLauncher::new("/nonexistent/warden-worker");
        let err = launcher.launch(WorkerId(1)).await.err().unwrap();
        assert!(matches!(err, Error::WorkerSpawnFailed { .. }));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn launches_and_kills_a_process() {
        let launcher = ProcessLauncher::new("cat");
        let mut conn = launcher.launch(WorkerId(1)).await.unwrap();
        assert!(conn.process.pid().is_some());
        assert!(conn.probe.resident_bytes().is_some());
        conn.process.kill().await.unwrap();
    }
}
