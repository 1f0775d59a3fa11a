//! Task descriptors, status machine and terminal outcomes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::TaskError;

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Priority band. Numerically smaller is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum Priority {
    /// User-facing work.
    Critical = 0,
    High = 1,
    Normal = 2,
    /// Background jobs.
    Low = 3,
    /// Periodic heartbeats.
    Heartbeat = 4,
}

impl Priority {
    /// Number of priority bands.
    pub const COUNT: usize = 5;

    /// All bands, most urgent first.
    pub const ALL: [Priority; Self::COUNT] = [
        Self::Critical,
        Self::High,
        Self::Normal,
        Self::Low,
        Self::Heartbeat,
    ];

    /// Band index (0..5).
    pub fn index(self) -> usize {
        self as usize
    }

    /// Whether `self` must be served before `other`.
    pub fn is_more_urgent_than(self, other: Priority) -> bool {
        self < other
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        p as u8
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or_else(|| format!("priority {value} out of range 0..=4"))
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// What a producer submits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub priority: Priority,
    /// Opaque to the scheduler; forwarded to the worker verbatim.
    pub payload: serde_json::Value,
    /// Omission under load is acceptable.
    pub skippable: bool,
    /// May be cooperatively suspended for more urgent work.
    pub preemptable: bool,
    pub max_retries: u32,
    /// Circuit breaker guarding the operation this task performs.
    pub guard: Option<String>,
    /// Overrides the pool's default execution deadline.
    pub max_execution_time: Option<Duration>,
}

impl TaskSpec {
    pub fn new(priority: Priority, payload: serde_json::Value) -> Self {
        Self {
            priority,
            payload,
            skippable: false,
            preemptable: true,
            max_retries: 2,
            guard: None,
            max_execution_time: None,
        }
    }

    /// A periodic heartbeat: lowest band, skippable, never retried.
    pub fn heartbeat(payload: serde_json::Value) -> Self {
        Self::new(Priority::Heartbeat, payload)
            .skippable(true)
            .with_max_retries(0)
    }

    pub fn skippable(mut self, skippable: bool) -> Self {
        self.skippable = skippable;
        self
    }

    pub fn preemptable(mut self, preemptable: bool) -> Self {
        self.preemptable = preemptable;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_guard(mut self, guard: impl Into<String>) -> Self {
        self.guard = Some(guard.into());
        self
    }

    pub fn with_max_execution_time(mut self, timeout: Duration) -> Self {
        self.max_execution_time = Some(timeout);
        self
    }
}

/// Lifecycle of a task inside the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    /// Waiting out a backoff delay before re-entering the queue.
    RetryPending,
    /// Suspended by the scheduler; re-enters the queue.
    Preempted,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Queued, Running) | (Queued, Failed) | (Queued, Cancelled) |
            (Running, Completed) | (Running, Failed) | (Running, RetryPending) |
            (Running, Preempted) | (Running, Cancelled) |
            (RetryPending, Queued) | (RetryPending, Failed) | (RetryPending, Cancelled) |
            (Preempted, Queued) | (Preempted, Failed) | (Preempted, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::RetryPending => "retry_pending",
            Self::Preempted => "preempted",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A task as held by the queue and the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub priority: Priority,
    pub payload: serde_json::Value,
    pub skippable: bool,
    pub preemptable: bool,
    pub guard: Option<String>,
    pub max_retries: u32,
    /// Failed attempts so far.
    pub attempt_count: u32,
    pub max_execution_time: Option<Duration>,
    /// Resume data from the last cooperative preemption.
    pub checkpoint: Option<serde_json::Value>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn from_spec(spec: TaskSpec) -> Self {
        Self {
            id: TaskId::new(),
            priority: spec.priority,
            payload: spec.payload,
            skippable: spec.skippable,
            preemptable: spec.preemptable,
            guard: spec.guard,
            max_retries: spec.max_retries,
            attempt_count: 0,
            max_execution_time: spec.max_execution_time,
            checkpoint: None,
            status: TaskStatus::Queued,
            created_at: Utc::now(),
        }
    }

    pub fn transition_to(&mut self, target: TaskStatus) -> Result<(), String> {
        if !self.status.can_transition_to(target) {
            return Err(format!(
                "Task {} cannot transition from {} to {}",
                self.id, self.status, target
            ));
        }
        self.status = target;
        Ok(())
    }

    /// Whether another attempt is allowed after the current failure.
    pub fn has_retries_left(&self) -> bool {
        self.attempt_count <= self.max_retries
    }
}

/// Result of one execution attempt as reported by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Execution {
    Completed { result: serde_json::Value },
    Failed {
        error: String,
        /// Guarded operation whose failure caused this.
        guard: Option<String>,
    },
    /// Suspended on request; checkpointing is best effort.
    Preempted { checkpoint: Option<serde_json::Value> },
}

/// Terminal outcome delivered exactly once per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed { result: serde_json::Value },
    Failed { error: TaskError, attempts: u32 },
    Cancelled,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Broadcast record of a terminal outcome.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionEvent {
    pub task_id: TaskId,
    pub priority: Priority,
    pub outcome: TaskOutcome,
}

/// Handle returned to the producer on admission.
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    rx: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    pub(crate) fn new(id: TaskId, rx: oneshot::Receiver<TaskOutcome>) -> Self {
        Self { id, rx }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Wait for the terminal outcome.
    pub async fn outcome(self) -> TaskOutcome {
        // The sender only disappears when the scheduler is torn down.
        self.rx.await.unwrap_or(TaskOutcome::Cancelled)
    }
}
