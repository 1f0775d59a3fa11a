//! Error types for Warden.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pool::WorkerId;
use crate::task::{Priority, TaskId};

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Task {task_id} rejected at admission: {reason}")]
    AdmissionRejected {
        task_id: TaskId,
        reason: AdmissionReason,
    },

    #[error("Circuit {name} is open, retry after {retry_after:?}")]
    CircuitOpen { name: String, retry_after: Duration },

    #[error("Worker spawn failed: {reason}")]
    WorkerSpawnFailed { reason: String },

    #[error("Worker {worker_id} exceeded memory limit: {used} > {limit} bytes")]
    MemoryLimitExceeded {
        worker_id: WorkerId,
        used: u64,
        limit: u64,
    },

    #[error("Task {task_id} exceeded execution time of {timeout:?}")]
    ExecutionTimeout { task_id: TaskId, timeout: Duration },

    #[error("Worker {worker_id} did not answer preemption within {grace:?}")]
    PreemptionTimedOut { worker_id: WorkerId, grace: Duration },

    #[error("Restart budget exhausted: {restarts} restarts within {window:?}")]
    RestartBudgetExhausted { restarts: usize, window: Duration },

    #[error("Memory sampling failed: {0}")]
    Sample(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse {key}={value}: {message}")]
    Parse {
        key: String,
        value: String,
        message: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Worker IPC errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unsupported protocol version {found} (expected {expected})")]
    VersionMismatch { expected: u8, found: u8 },

    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Frame codec error: {0}")]
    Codec(#[from] tokio_util::codec::LinesCodecError),

    #[error("Peer closed the stream")]
    Closed,
}

/// Why an enqueue was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionReason {
    /// Total depth is at the cap and no evictable victim exists.
    QueueFull,
    /// The task's own priority band is at its cap.
    BandFull { priority: Priority },
    /// Memory is in EMERGENCY; only priority 0 is admitted.
    MemoryEmergency,
    /// Memory is CRITICAL or worse; skippable work is shed.
    MemoryPressure,
    /// The scheduler is stopping.
    ShuttingDown,
}

impl std::fmt::Display for AdmissionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueueFull => write!(f, "queue full"),
            Self::BandFull { priority } => write!(f, "priority band {priority} full"),
            Self::MemoryEmergency => write!(f, "memory emergency"),
            Self::MemoryPressure => write!(f, "memory pressure"),
            Self::ShuttingDown => write!(f, "shutting down"),
        }
    }
}

/// Classification of a task-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The worker reported the task failed.
    Task,
    MemoryLimitExceeded,
    ExecutionTimeout,
    PreemptionTimedOut,
    CircuitOpen,
    /// The worker process exited while running the task.
    WorkerCrashed,
    WorkerSpawnFailed,
    /// Displaced from the queue by a more urgent task.
    Evicted,
    /// Could not re-enter the queue for a retry.
    AdmissionRejected,
}

impl FailureKind {
    /// Whether this failure is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Evicted | Self::AdmissionRejected)
    }
}

/// Task failure as delivered to completion subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct TaskError {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&Error> for TaskError {
    fn from(err: &Error) -> Self {
        let kind = match err {
            Error::MemoryLimitExceeded { .. } => FailureKind::MemoryLimitExceeded,
            Error::ExecutionTimeout { .. } => FailureKind::ExecutionTimeout,
            Error::PreemptionTimedOut { .. } => FailureKind::PreemptionTimedOut,
            Error::CircuitOpen { .. } => FailureKind::CircuitOpen,
            Error::AdmissionRejected { .. } | Error::ShuttingDown => {
                FailureKind::AdmissionRejected
            }
            Error::WorkerSpawnFailed { .. } | Error::RestartBudgetExhausted { .. } => {
                FailureKind::WorkerSpawnFailed
            }
            Error::Protocol(_) | Error::Io(_) => FailureKind::WorkerCrashed,
            Error::Config(_) | Error::Sample(_) => FailureKind::Task,
        };
        Self::new(kind, err.to_string())
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
