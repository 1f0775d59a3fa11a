//! In-memory workers for exercising the pool and scheduler without processes.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use super::WorkerId;
use super::launcher::{MemoryProbe, WorkerConnection, WorkerLauncher, WorkerProcess};
use crate::error::{Error, Result};
use crate::protocol::{FrameReader, FrameWriter, PoolMessage, WorkerMessage};
use crate::task::TaskId;

const PIPE_CAPACITY: usize = 64 * 1024;
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Hands every launched worker's far end to the test.
pub(crate) struct SimLauncher {
    workers: mpsc::UnboundedSender<SimWorker>,
    fail_launches: AtomicBool,
}

impl SimLauncher {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SimWorker>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let launcher = Arc::new(Self {
            workers: tx,
            fail_launches: AtomicBool::new(false),
        });
        (launcher, rx)
    }

    pub(crate) fn fail_launches(&self, fail: bool) {
        self.fail_launches.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkerLauncher for SimLauncher {
    async fn launch(&self, id: WorkerId) -> Result<WorkerConnection> {
        if self.fail_launches.load(Ordering::SeqCst) {
            return Err(Error::WorkerSpawnFailed {
                reason: "simulated launch failure".to_string(),
            });
        }
        let (pool_out, worker_in) = tokio::io::duplex(PIPE_CAPACITY);
        let (worker_out, pool_in) = tokio::io::duplex(PIPE_CAPACITY);
        let rss = Arc::new(AtomicU64::new(0));
        let killed = Arc::new(AtomicBool::new(false));

        let worker = SimWorker {
            id,
            reader: FrameReader::new(worker_in),
            writer: FrameWriter::new(worker_out),
            rss: rss.clone(),
            killed: killed.clone(),
        };
        self.workers
            .send(worker)
            .map_err(|_| Error::WorkerSpawnFailed {
                reason: "test dropped the worker receiver".to_string(),
            })?;

        Ok(WorkerConnection {
            reader: Box::new(pool_in),
            writer: Box::new(pool_out),
            process: Box::new(SimProcess { killed }),
            probe: Arc::new(SimProbe { rss }),
        })
    }
}

struct SimProcess {
    killed: Arc<AtomicBool>,
}

#[async_trait]
impl WorkerProcess for SimProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        Ok(Some(0))
    }
}

struct SimProbe {
    rss: Arc<AtomicU64>,
}

impl MemoryProbe for SimProbe {
    fn resident_bytes(&self) -> Option<u64> {
        match self.rss.load(Ordering::SeqCst) {
            0 => None,
            bytes => Some(bytes),
        }
    }
}

/// The worker end of a simulated pipe pair.
pub(crate) struct SimWorker {
    pub(crate) id: WorkerId,
    reader: FrameReader<DuplexStream, PoolMessage>,
    writer: FrameWriter<DuplexStream, WorkerMessage>,
    rss: Arc<AtomicU64>,
    killed: Arc<AtomicBool>,
}

impl SimWorker {
    pub(crate) async fn send(&mut self, msg: WorkerMessage) {
        self.writer.send(&msg).await.expect("pool end closed");
    }

    pub(crate) async fn ready(&mut self) {
        self.send(WorkerMessage::Ready { pid: 4242 }).await;
    }

    /// Next frame from the pool; `None` once the pool hung up.
    pub(crate) async fn recv(&mut self) -> Option<PoolMessage> {
        tokio::time::timeout(RECV_TIMEOUT, self.reader.next())
            .await
            .expect("timed out waiting for a pool frame")
            .expect("bad pool frame")
    }

    /// Wait for an ASSIGN and return its task id and checkpoint.
    pub(crate) async fn expect_assign(&mut self) -> (TaskId, Option<serde_json::Value>) {
        match self.recv().await {
            Some(PoolMessage::Assign {
                task_id, checkpoint, ..
            }) => (task_id, checkpoint),
            other => panic!("expected ASSIGN, got {other:?}"),
        }
    }

    pub(crate) async fn complete(&mut self, task_id: TaskId, result: serde_json::Value) {
        self.send(WorkerMessage::Complete { task_id, result }).await;
    }

    pub(crate) async fn fail(&mut self, task_id: TaskId, error: &str, guard: Option<&str>) {
        self.send(WorkerMessage::Failed {
            task_id,
            error: error.to_string(),
            guard: guard.map(str::to_string),
        })
        .await;
    }

    /// Make the out-of-band probe report `bytes`.
    pub(crate) fn set_rss(&self, bytes: u64) {
        self.rss.store(bytes, Ordering::SeqCst);
    }

    pub(crate) fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}
