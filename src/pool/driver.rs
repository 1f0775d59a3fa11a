//! Per-worker I/O task.
//!
//! Each worker gets one driver that owns its pipes and process handle. The
//! pool talks to it through [`DriverCommand`]s and hears back through
//! [`PoolEvent`]s, so nothing in the scheduler loop ever blocks on a pipe.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::WorkerId;
use super::launcher::{MemoryProbe, WorkerLauncher, WorkerProcess};
use crate::protocol::{FrameReader, FrameWriter, PoolMessage, WorkerMessage};

/// Bound on one frame write; a worker that stops reading stdin is treated as hung.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on reaping a worker that already closed its stdout.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub(crate) enum DriverCommand {
    Send(PoolMessage),
    Kill,
}

/// Why a driver stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitCause {
    /// The worker closed its stdout.
    Closed { code: Option<i32> },
    /// The pool asked for termination.
    Killed,
    Protocol(String),
    Io(String),
}

impl std::fmt::Display for ExitCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed { code: Some(code) } => write!(f, "exited with code {code}"),
            Self::Closed { code: None } => write!(f, "exited"),
            Self::Killed => write!(f, "killed"),
            Self::Protocol(e) => write!(f, "protocol violation: {e}"),
            Self::Io(e) => write!(f, "pipe error: {e}"),
        }
    }
}

/// Everything a driver reports back to the pool.
pub enum PoolEvent {
    Launched {
        worker_id: WorkerId,
        pid: Option<u32>,
        probe: Arc<dyn MemoryProbe>,
    },
    LaunchFailed {
        worker_id: WorkerId,
        error: String,
    },
    Message {
        worker_id: WorkerId,
        message: WorkerMessage,
    },
    Exited {
        worker_id: WorkerId,
        cause: ExitCause,
    },
}

impl std::fmt::Debug for PoolEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Launched { worker_id, pid, .. } => f
                .debug_struct("Launched")
                .field("worker_id", worker_id)
                .field("pid", pid)
                .finish(),
            Self::LaunchFailed { worker_id, error } => f
                .debug_struct("LaunchFailed")
                .field("worker_id", worker_id)
                .field("error", error)
                .finish(),
            Self::Message { worker_id, message } => f
                .debug_struct("Message")
                .field("worker_id", worker_id)
                .field("message", message)
                .finish(),
            Self::Exited { worker_id, cause } => f
                .debug_struct("Exited")
                .field("worker_id", worker_id)
                .field("cause", cause)
                .finish(),
        }
    }
}

pub(crate) async fn drive(
    worker_id: WorkerId,
    launcher: Arc<dyn WorkerLauncher>,
    mut commands: mpsc::UnboundedReceiver<DriverCommand>,
    events: mpsc::UnboundedSender<PoolEvent>,
) {
    let conn = match launcher.launch(worker_id).await {
        Ok(conn) => conn,
        Err(e) => {
            let _ = events.send(PoolEvent::LaunchFailed {
                worker_id,
                error: e.to_string(),
            });
            return;
        }
    };

    let mut process = conn.process;
    let _ = events.send(PoolEvent::Launched {
        worker_id,
        pid: process.pid(),
        probe: conn.probe,
    });

    let mut reader = FrameReader::<_, WorkerMessage>::new(conn.reader);
    let mut writer = FrameWriter::<_, PoolMessage>::new(conn.writer);

    let cause = loop {
        tokio::select! {
            frame = reader.next() => match frame {
                Ok(Some(message)) => {
                    if events.send(PoolEvent::Message { worker_id, message }).is_err() {
                        terminate(worker_id, process.as_mut()).await;
                        break ExitCause::Killed;
                    }
                }
                Ok(None) => {
                    let code = match tokio::time::timeout(REAP_TIMEOUT, process.wait()).await {
                        Ok(Ok(code)) => code,
                        _ => {
                            terminate(worker_id, process.as_mut()).await;
                            None
                        }
                    };
                    break ExitCause::Closed { code };
                }
                Err(e) => {
                    warn!(worker_id = %worker_id, error = %e, "Unreadable worker frame");
                    terminate(worker_id, process.as_mut()).await;
                    break ExitCause::Protocol(e.to_string());
                }
            },
            command = commands.recv() => match command {
                Some(DriverCommand::Send(msg)) => {
                    match tokio::time::timeout(WRITE_TIMEOUT, writer.send(&msg)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            terminate(worker_id, process.as_mut()).await;
                            break ExitCause::Io(e.to_string());
                        }
                        Err(_) => {
                            terminate(worker_id, process.as_mut()).await;
                            break ExitCause::Io("write timed out".to_string());
                        }
                    }
                }
                Some(DriverCommand::Kill) | None => {
                    terminate(worker_id, process.as_mut()).await;
                    break ExitCause::Killed;
                }
            },
        }
    };

    debug!(worker_id = %worker_id, cause = %cause, "Worker driver finished");
    let _ = events.send(PoolEvent::Exited { worker_id, cause });
}

async fn terminate(worker_id: WorkerId, process: &mut dyn WorkerProcess) {
    if let Err(e) = process.kill().await {
        debug!(worker_id = %worker_id, error = %e, "Kill failed; worker already gone");
    }
}
