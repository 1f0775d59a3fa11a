//! Worker-side runtime.
//!
//! A worker process calls [`serve`] with a [`TaskHandler`]. The runtime
//! announces READY, runs one task at a time and translates PREEMPT, ADVISE
//! and SHUTDOWN frames into signals on the running task's [`TaskContext`].

pub mod ops;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ProtocolError, Result};
use crate::memory::sampler::resident_bytes;
use crate::protocol::{FrameReader, FrameWriter, PoolMessage, WorkerMessage};
use crate::task::{Execution, TaskId};

/// Runs assigned payloads inside a worker.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn run(&self, ctx: TaskContext) -> Execution;
}

/// Everything a handler sees about the attempt it is running.
pub struct TaskContext {
    task_id: TaskId,
    payload: serde_json::Value,
    checkpoint: Option<serde_json::Value>,
    soft_limit: u64,
    preempt: CancellationToken,
    advised: Arc<AtomicBool>,
    out: mpsc::UnboundedSender<WorkerMessage>,
}

impl TaskContext {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Resume point handed back from an earlier preemption.
    pub fn checkpoint(&self) -> Option<&serde_json::Value> {
        self.checkpoint.as_ref()
    }

    pub fn soft_limit(&self) -> u64 {
        self.soft_limit
    }

    pub fn is_preempted(&self) -> bool {
        self.preempt.is_cancelled()
    }

    /// Resolves once the pool asks this task to stop.
    pub async fn preempted(&self) {
        self.preempt.cancelled().await
    }

    /// The pool reported this worker over its soft limit.
    pub fn is_advised(&self) -> bool {
        self.advised.load(Ordering::Relaxed)
    }

    /// Report progress with the current resident size as the memory estimate.
    pub fn report_progress(&self, percent: u8, checkpoint: Option<serde_json::Value>) {
        let estimate = resident_bytes(std::process::id()).unwrap_or(0);
        self.report_progress_with(percent, estimate, checkpoint);
    }

    pub fn report_progress_with(&self, percent: u8, memory_estimate: u64, checkpoint: Option<serde_json::Value>) {
        let _ = self.out.send(WorkerMessage::Progress {
            task_id: self.task_id,
            percent: percent.min(100),
            memory_estimate,
            checkpoint,
        });
    }
}

fn report(task_id: TaskId, execution: Execution) -> WorkerMessage {
    match execution {
        Execution::Completed { result } => WorkerMessage::Complete { task_id, result },
        Execution::Failed { error, guard } => WorkerMessage::Failed {
            task_id,
            error,
            guard,
        },
        Execution::Preempted { checkpoint } => WorkerMessage::Preempted {
            task_id,
            checkpoint,
        },
    }
}

struct Running {
    task_id: TaskId,
    preempt: CancellationToken,
    advised: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Serve tasks over this process's stdin/stdout until SHUTDOWN or EOF.
pub async fn serve<H: TaskHandler>(handler: H) -> Result<()> {
    serve_io(tokio::io::stdin(), tokio::io::stdout(), Arc::new(handler)).await
}

/// Serve tasks over arbitrary pipes.
pub async fn serve_io<R, W>(reader: R, writer: W, handler: Arc<dyn TaskHandler>) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WorkerMessage>();
    let writer_task = tokio::spawn(async move {
        let mut writer = FrameWriter::<_, WorkerMessage>::new(writer);
        while let Some(msg) = out_rx.recv().await {
            writer.send(&msg).await?;
        }
        Ok::<_, ProtocolError>(())
    });

    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<TaskId>();
    let mut reader = FrameReader::<_, PoolMessage>::new(reader);
    let mut running: Option<Running> = None;
    let mut shutting_down = false;

    let _ = out_tx.send(WorkerMessage::Ready {
        pid: std::process::id(),
    });
    info!(pid = std::process::id(), "Worker ready");

    let result = loop {
        tokio::select! {
            frame = reader.next() => match frame {
                Ok(Some(PoolMessage::Assign { task_id, payload, soft_limit, max_execution_ms, checkpoint })) => {
                    if let Some(current) = &running {
                        warn!(task_id = %task_id, busy_with = %current.task_id, "ASSIGN while busy; ignoring");
                        continue;
                    }
                    debug!(task_id = %task_id, max_execution_ms, resumed = checkpoint.is_some(), "Task assigned");
                    let preempt = CancellationToken::new();
                    let advised = Arc::new(AtomicBool::new(false));
                    let ctx = TaskContext {
                        task_id,
                        payload,
                        checkpoint,
                        soft_limit,
                        preempt: preempt.clone(),
                        advised: advised.clone(),
                        out: out_tx.clone(),
                    };
                    let handler = Arc::clone(&handler);
                    let out = out_tx.clone();
                    let done = done_tx.clone();
                    let handle = tokio::spawn(async move {
                        let execution = handler.run(ctx).await;
                        let _ = out.send(report(task_id, execution));
                        let _ = done.send(task_id);
                    });
                    running = Some(Running { task_id, preempt, advised, handle });
                }
                Ok(Some(PoolMessage::Preempt { reason, checkpoint_timeout_ms })) => {
                    if let Some(current) = &running {
                        info!(task_id = %current.task_id, %reason, checkpoint_timeout_ms, "Preemption requested");
                        current.preempt.cancel();
                    }
                }
                Ok(Some(PoolMessage::Advise { task_id, memory_estimate, soft_limit })) => {
                    if let Some(current) = running.as_ref().filter(|r| r.task_id == task_id) {
                        warn!(task_id = %task_id, memory_estimate, soft_limit, "Over soft memory limit");
                        current.advised.store(true, Ordering::Relaxed);
                    }
                }
                Ok(Some(PoolMessage::Shutdown)) => {
                    info!("Shutdown requested");
                    if running.is_none() {
                        break Ok(());
                    }
                    shutting_down = true;
                }
                Ok(None) => {
                    debug!("Pool closed the pipe");
                    break Ok(());
                }
                Err(e) => break Err(e.into()),
            },
            Some(task_id) = done_rx.recv() => {
                if running.as_ref().is_some_and(|r| r.task_id == task_id) {
                    running = None;
                }
                if shutting_down && running.is_none() {
                    break Ok(());
                }
            }
        }
    };

    if let Some(current) = running.take() {
        current.handle.abort();
    }
    drop(out_tx);
    drop(done_tx);
    match writer_task.await {
        Ok(Ok(())) => result,
        Ok(Err(e)) => result.and(Err(e.into())),
        Err(e) => result.and(Err(std::io::Error::other(e).into())),
    }
}
