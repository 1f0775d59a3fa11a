//! Worker pool: isolated worker processes and their resource limits.
//!
//! The pool is owned by the scheduler loop and never shared. Each worker is
//! driven by its own I/O task (see [`driver`]); the loop feeds the resulting
//! [`PoolEvent`]s back through [`WorkerPool::handle_event`] and calls
//! [`WorkerPool::enforce`] once per monitoring tick.

mod driver;
pub mod launcher;
#[cfg(test)]
pub(crate) mod sim;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::breaker::Permit;
use crate::config::PoolConfig;
use crate::error::{Error, FailureKind, Result, TaskError};
use crate::memory::WorkerMemoryGauge;
use crate::metrics::Metrics;
use crate::protocol::{PoolMessage, WorkerMessage};
use crate::task::{Execution, Task, TaskId};

use driver::DriverCommand;
pub use driver::{ExitCause, PoolEvent};
pub use launcher::{MemoryProbe, ProcessLauncher, WorkerConnection, WorkerLauncher, WorkerProcess};

/// Pool-local worker identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Lifecycle of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Launched, waiting for READY.
    Spawning,
    /// Up and never used.
    Ready,
    Busy,
    /// Finished at least one task, waiting for more.
    Idle,
    /// Asked to preempt or shut down.
    Draining,
    Dead,
}

impl WorkerState {
    pub fn can_transition_to(&self, target: WorkerState) -> bool {
        use WorkerState::*;

        matches!(
            (self, target),
            (Spawning, Ready) |
            (Ready, Busy) | (Ready, Draining) |
            (Idle, Busy) | (Idle, Draining) |
            (Busy, Idle) | (Busy, Draining) |
            (Draining, Idle) |
            (_, Dead)
        ) && *self != Dead
    }

    /// Can accept an ASSIGN.
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Ready | Self::Idle)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Spawning => "spawning",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Idle => "idle",
            Self::Draining => "draining",
            Self::Dead => "dead",
        };
        write!(f, "{s}")
    }
}

/// Why a running task is being asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreemptReason {
    /// Make room for more urgent work under memory pressure.
    MemoryPressure,
    /// The producer cancelled the task.
    Cancelled,
}

impl std::fmt::Display for PreemptReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MemoryPressure => write!(f, "memory pressure"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A task bound to a worker for one attempt.
#[derive(Debug)]
pub struct Assignment {
    pub task: Task,
    /// Breaker permit held for the duration of the attempt.
    pub permit: Option<Permit>,
    pub started_at: Instant,
    pub deadline: Instant,
    pub preempt: Option<PreemptReason>,
    /// Latest checkpoint seen in a PROGRESS frame.
    pub last_checkpoint: Option<serde_json::Value>,
}

/// What the scheduler needs to act on after feeding the pool.
#[derive(Debug)]
pub enum PoolNotice {
    /// A worker can take a task.
    Available(WorkerId),
    /// The worker reported how the attempt ended.
    Reported {
        worker_id: WorkerId,
        assignment: Assignment,
        execution: Execution,
    },
    /// The attempt ended without a report (kill, crash, deadline).
    Lost {
        worker_id: WorkerId,
        assignment: Assignment,
        error: TaskError,
    },
    SpawnFailed {
        worker_id: WorkerId,
        error: String,
    },
}

/// Shared read-only view for health reporting.
#[derive(Debug, Default)]
pub struct PoolStatus {
    active: AtomicUsize,
    degraded: AtomicBool,
}

impl PoolStatus {
    /// Workers not yet dead.
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// The restart budget is exhausted and spawns are refused.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }
}

/// Sliding window of worker deaths.
#[derive(Debug)]
struct RestartBudget {
    limit: usize,
    window: Duration,
    deaths: VecDeque<Instant>,
}

impl RestartBudget {
    fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            deaths: VecDeque::new(),
        }
    }

    fn record(&mut self, now: Instant) {
        self.deaths.push_back(now);
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.deaths.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.deaths.pop_front();
            } else {
                break;
            }
        }
    }

    fn count(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.deaths.len()
    }

    fn exhausted(&mut self, now: Instant) -> bool {
        self.count(now) >= self.limit
    }
}

struct WorkerSlot {
    id: WorkerId,
    state: WorkerState,
    commands: mpsc::UnboundedSender<DriverCommand>,
    pid: Option<u32>,
    probe: Option<Arc<dyn MemoryProbe>>,
    assignment: Option<Assignment>,
    /// Last estimate reported in PROGRESS.
    reported: u64,
    /// max(reported, probed) as of the last check.
    footprint: u64,
    advised: bool,
    spawned_at: Instant,
    idle_since: Instant,
    drain_deadline: Option<Instant>,
    /// Shutting down for good; must not receive work.
    retiring: bool,
}

impl WorkerSlot {
    fn set_state(&mut self, to: WorkerState) -> bool {
        if !self.state.can_transition_to(to) {
            warn!(worker_id = %self.id, from = %self.state, to = %to, "Invalid worker transition");
            return false;
        }
        self.state = to;
        true
    }

    fn send(&self, msg: PoolMessage) -> bool {
        self.commands.send(DriverCommand::Send(msg)).is_ok()
    }

    fn measure(&mut self) -> u64 {
        let probed = self
            .probe
            .as_ref()
            .and_then(|p| p.resident_bytes())
            .unwrap_or(0);
        self.footprint = self.reported.max(probed);
        self.footprint
    }

    fn is_live(&self) -> bool {
        self.state != WorkerState::Dead
    }
}

pub struct WorkerPool {
    config: PoolConfig,
    launcher: Arc<dyn WorkerLauncher>,
    metrics: Arc<Metrics>,
    gauge: WorkerMemoryGauge,
    status: Arc<PoolStatus>,
    slots: BTreeMap<WorkerId, WorkerSlot>,
    next_id: u64,
    restarts: RestartBudget,
    events: mpsc::UnboundedSender<PoolEvent>,
}

impl WorkerPool {
    /// Create an empty pool and the event stream its drivers report into.
    pub fn new(
        config: PoolConfig,
        launcher: Arc<dyn WorkerLauncher>,
        metrics: Arc<Metrics>,
        gauge: WorkerMemoryGauge,
    ) -> (Self, mpsc::UnboundedReceiver<PoolEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let restarts = RestartBudget::new(config.max_restarts_per_hour, config.restart_window);
        let pool = Self {
            config,
            launcher,
            metrics,
            gauge,
            status: Arc::new(PoolStatus::default()),
            slots: BTreeMap::new(),
            next_id: 1,
            restarts,
            events,
        };
        (pool, rx)
    }

    pub fn status(&self) -> Arc<PoolStatus> {
        Arc::clone(&self.status)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn live_workers(&self) -> usize {
        self.slots.values().filter(|s| s.is_live()).count()
    }

    pub fn has_capacity(&self) -> bool {
        self.live_workers() < self.config.max_workers
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn spawning_count(&self) -> usize {
        self.slots
            .values()
            .filter(|s| s.state == WorkerState::Spawning)
            .count()
    }

    pub fn worker_state(&self, id: WorkerId) -> Option<WorkerState> {
        self.slots.get(&id).map(|s| s.state)
    }

    /// Lowest-numbered worker ready for a task.
    pub fn available_worker(&self) -> Option<WorkerId> {
        self.slots
            .values()
            .find(|s| s.state.is_available() && !s.retiring && s.assignment.is_none())
            .map(|s| s.id)
    }

    /// Running attempts by worker.
    pub fn running(&self) -> impl Iterator<Item = (WorkerId, &Assignment)> {
        self.slots
            .values()
            .filter_map(|s| s.assignment.as_ref().map(|a| (s.id, a)))
    }

    /// Worker currently running `task_id`.
    pub fn worker_for(&self, task_id: TaskId) -> Option<WorkerId> {
        self.running()
            .find(|(_, a)| a.task.id == task_id)
            .map(|(id, _)| id)
    }

    /// A memory-pressure preemption has been sent and not yet answered.
    pub fn preemption_in_flight(&self) -> bool {
        self.running()
            .any(|(_, a)| a.preempt == Some(PreemptReason::MemoryPressure))
    }

    /// Re-evaluate the restart budget and publish the degraded flag.
    fn refresh_degraded(&mut self, now: Instant) -> bool {
        let exhausted = self.restarts.exhausted(now);
        let was = self.status.degraded.swap(exhausted, Ordering::Relaxed);
        if exhausted && !was {
            error!(
                restarts = self.restarts.count(now),
                window_secs = self.config.restart_window.as_secs(),
                "Restart budget exhausted; refusing to spawn workers"
            );
        } else if was && !exhausted {
            info!("Restart budget recovered; spawning resumed");
        }
        exhausted
    }

    /// Launch a new worker subject to the capacity cap and restart budget.
    pub fn spawn(&mut self, now: Instant) -> Result<WorkerId> {
        if !self.has_capacity() {
            return Err(Error::WorkerSpawnFailed {
                reason: format!("pool at capacity ({})", self.config.max_workers),
            });
        }
        if self.refresh_degraded(now) {
            return Err(Error::RestartBudgetExhausted {
                restarts: self.restarts.count(now),
                window: self.config.restart_window,
            });
        }

        let id = WorkerId(self.next_id);
        self.next_id += 1;
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(driver::drive(
            id,
            Arc::clone(&self.launcher),
            rx,
            self.events.clone(),
        ));
        self.slots.insert(
            id,
            WorkerSlot {
                id,
                state: WorkerState::Spawning,
                commands,
                pid: None,
                probe: None,
                assignment: None,
                reported: 0,
                footprint: 0,
                advised: false,
                spawned_at: now,
                idle_since: now,
                drain_deadline: None,
                retiring: false,
            },
        );
        self.metrics.worker_spawned();
        info!(worker_id = %id, "Spawning worker");
        self.publish_status();
        Ok(id)
    }

    /// Hand `task` to an available worker. On failure the attempt is returned untouched.
    pub fn assign(
        &mut self,
        worker_id: WorkerId,
        task: Task,
        permit: Option<Permit>,
        now: Instant,
    ) -> std::result::Result<(), Assignment> {
        let timeout = task.max_execution_time.unwrap_or(self.config.max_execution_time);
        let assignment = Assignment {
            task,
            permit,
            started_at: now,
            deadline: now + timeout,
            preempt: None,
            last_checkpoint: None,
        };
        let soft_limit = self.config.soft_limit_bytes;

        let Some(slot) = self.slots.get_mut(&worker_id) else {
            return Err(assignment);
        };
        if !slot.state.is_available() || slot.retiring || slot.assignment.is_some() {
            return Err(assignment);
        }
        let msg = PoolMessage::Assign {
            task_id: assignment.task.id,
            payload: assignment.task.payload.clone(),
            soft_limit,
            max_execution_ms: timeout.as_millis() as u64,
            checkpoint: assignment.task.checkpoint.clone(),
        };
        if !slot.send(msg) {
            return Err(assignment);
        }
        slot.set_state(WorkerState::Busy);
        slot.reported = 0;
        slot.advised = false;
        debug!(
            worker_id = %worker_id,
            task_id = %assignment.task.id,
            priority = %assignment.task.priority,
            "Assigned task"
        );
        slot.assignment = Some(assignment);
        Ok(())
    }

    /// Ask the worker's task to checkpoint and stop.
    ///
    /// Returns whether the task is now being stopped. A cancellation arriving
    /// while a preemption is already pending takes over its reason.
    pub fn preempt(&mut self, worker_id: WorkerId, reason: PreemptReason, now: Instant) -> bool {
        let grace = self.config.preempt_grace;
        let Some(slot) = self.slots.get_mut(&worker_id) else {
            return false;
        };
        let draining = slot.state == WorkerState::Draining;
        let Some(assignment) = slot.assignment.as_mut() else {
            return false;
        };
        if draining {
            if reason == PreemptReason::Cancelled {
                assignment.preempt = Some(reason);
            }
            return true;
        }
        if slot.state != WorkerState::Busy {
            return false;
        }
        assignment.preempt = Some(reason);
        let task_id = assignment.task.id;
        let sent = slot.send(PoolMessage::Preempt {
            reason: reason.to_string(),
            checkpoint_timeout_ms: grace.as_millis() as u64,
        });
        if sent {
            slot.set_state(WorkerState::Draining);
            slot.drain_deadline = Some(now + grace);
            self.metrics.preemption();
            info!(worker_id = %worker_id, task_id = %task_id, %reason, "Preempting task");
        }
        sent
    }

    /// Terminate a worker immediately, returning the attempt it was running.
    pub fn kill(&mut self, worker_id: WorkerId, now: Instant) -> Option<Assignment> {
        let slot = self.slots.get_mut(&worker_id)?;
        if !slot.set_state(WorkerState::Dead) {
            return None;
        }
        let _ = slot.commands.send(DriverCommand::Kill);
        let assignment = slot.assignment.take();
        self.metrics.worker_hard_kill();
        self.restarts.record(now);
        warn!(
            worker_id = %worker_id,
            pid = ?slot.pid,
            task_id = ?assignment.as_ref().map(|a| a.task.id),
            "Killed worker"
        );
        self.publish_status();
        assignment
    }

    /// Fold one driver event into pool state.
    pub fn handle_event(&mut self, event: PoolEvent, now: Instant) -> Vec<PoolNotice> {
        let mut notices = Vec::new();
        match event {
            PoolEvent::Launched { worker_id, pid, probe } => {
                if let Some(slot) = self.slots.get_mut(&worker_id) {
                    slot.pid = pid;
                    slot.probe = Some(probe);
                    debug!(worker_id = %worker_id, pid = ?pid, "Worker launched");
                }
            }
            PoolEvent::LaunchFailed { worker_id, error } => {
                if self.slots.remove(&worker_id).is_some() {
                    self.restarts.record(now);
                    warn!(worker_id = %worker_id, error = %error, "Worker launch failed");
                    notices.push(PoolNotice::SpawnFailed { worker_id, error });
                }
            }
            PoolEvent::Message { worker_id, message } => {
                self.on_message(worker_id, message, now, &mut notices);
            }
            PoolEvent::Exited { worker_id, cause } => {
                if let Some(mut slot) = self.slots.remove(&worker_id) {
                    if slot.state == WorkerState::Dead {
                        debug!(worker_id = %worker_id, "Killed worker reaped");
                    } else if slot.retiring {
                        info!(worker_id = %worker_id, cause = %cause, "Worker retired");
                    } else {
                        self.restarts.record(now);
                        warn!(worker_id = %worker_id, pid = ?slot.pid, cause = %cause, "Worker died");
                        if let Some(assignment) = slot.assignment.take() {
                            notices.push(PoolNotice::Lost {
                                worker_id,
                                assignment,
                                error: TaskError::new(
                                    FailureKind::WorkerCrashed,
                                    format!("worker {worker_id} {cause}"),
                                ),
                            });
                        }
                    }
                }
            }
        }
        self.publish_status();
        notices
    }

    fn on_message(
        &mut self,
        worker_id: WorkerId,
        message: WorkerMessage,
        now: Instant,
        notices: &mut Vec<PoolNotice>,
    ) {
        let hard_limit = self.config.hard_limit_bytes;
        let Some(slot) = self.slots.get_mut(&worker_id) else {
            return;
        };
        if slot.state == WorkerState::Dead {
            return;
        }

        match message {
            WorkerMessage::Ready { pid } => {
                if slot.state == WorkerState::Spawning && slot.set_state(WorkerState::Ready) {
                    slot.pid = slot.pid.or(Some(pid));
                    slot.idle_since = now;
                    info!(worker_id = %worker_id, pid, "Worker ready");
                    notices.push(PoolNotice::Available(worker_id));
                }
            }
            WorkerMessage::Progress {
                task_id,
                percent,
                memory_estimate,
                checkpoint,
            } => {
                let Some(assignment) = slot.assignment.as_mut().filter(|a| a.task.id == task_id) else {
                    debug!(worker_id = %worker_id, task_id = %task_id, "Progress for unknown task");
                    return;
                };
                if checkpoint.is_some() {
                    assignment.last_checkpoint = checkpoint;
                }
                slot.reported = memory_estimate;
                debug!(worker_id = %worker_id, task_id = %task_id, percent, memory_estimate, "Task progress");
                if memory_estimate > hard_limit {
                    self.kill_over_limit(worker_id, memory_estimate, now, notices);
                }
            }
            WorkerMessage::Complete { task_id, result } => {
                self.finish(worker_id, task_id, Execution::Completed { result }, now, notices);
            }
            WorkerMessage::Failed { task_id, error, guard } => {
                self.finish(worker_id, task_id, Execution::Failed { error, guard }, now, notices);
            }
            WorkerMessage::Preempted { task_id, checkpoint } => {
                self.finish(worker_id, task_id, Execution::Preempted { checkpoint }, now, notices);
            }
        }
    }

    fn finish(
        &mut self,
        worker_id: WorkerId,
        task_id: TaskId,
        execution: Execution,
        now: Instant,
        notices: &mut Vec<PoolNotice>,
    ) {
        let Some(slot) = self.slots.get_mut(&worker_id) else {
            return;
        };
        if slot.assignment.as_ref().map(|a| a.task.id) != Some(task_id) {
            warn!(worker_id = %worker_id, task_id = %task_id, "Result for a task the worker does not hold");
            return;
        }
        let Some(mut assignment) = slot.assignment.take() else {
            return;
        };
        slot.set_state(WorkerState::Idle);
        slot.reported = 0;
        slot.advised = false;
        slot.drain_deadline = None;
        slot.idle_since = now;

        let execution = match execution {
            Execution::Preempted { checkpoint } => Execution::Preempted {
                checkpoint: checkpoint.or_else(|| assignment.last_checkpoint.take()),
            },
            other => other,
        };
        notices.push(PoolNotice::Reported {
            worker_id,
            assignment,
            execution,
        });
        notices.push(PoolNotice::Available(worker_id));
    }

    fn kill_over_limit(
        &mut self,
        worker_id: WorkerId,
        used: u64,
        now: Instant,
        notices: &mut Vec<PoolNotice>,
    ) {
        let limit = self.config.hard_limit_bytes;
        let err = Error::MemoryLimitExceeded {
            worker_id,
            used,
            limit,
        };
        warn!(worker_id = %worker_id, used, limit, "Worker over hard memory limit");
        if let Some(assignment) = self.kill(worker_id, now) {
            notices.push(PoolNotice::Lost {
                worker_id,
                assignment,
                error: TaskError::from(&err),
            });
        }
    }

    /// Apply limits and timers. Called once per monitoring tick.
    pub fn enforce(&mut self, now: Instant) -> Vec<PoolNotice> {
        let mut notices = Vec::new();
        let ids: Vec<WorkerId> = self.slots.keys().copied().collect();

        for id in ids {
            let Some(slot) = self.slots.get_mut(&id) else {
                continue;
            };
            if !slot.is_live() {
                continue;
            }
            let used = slot.measure();

            match slot.state {
                WorkerState::Spawning => {
                    if now.saturating_duration_since(slot.spawned_at) >= self.config.spawn_timeout {
                        warn!(worker_id = %id, "Worker never became ready");
                        self.kill(id, now);
                        notices.push(PoolNotice::SpawnFailed {
                            worker_id: id,
                            error: "worker did not report READY in time".to_string(),
                        });
                    }
                }
                WorkerState::Busy | WorkerState::Draining if slot.assignment.is_some() => {
                    self.enforce_running(id, used, now, &mut notices);
                }
                WorkerState::Draining => {
                    if slot.drain_deadline.is_some_and(|d| now >= d) {
                        debug!(worker_id = %id, "Retiring worker did not exit; killing");
                        self.kill(id, now);
                    }
                }
                WorkerState::Ready | WorkerState::Idle => {
                    if now.saturating_duration_since(slot.idle_since) >= self.config.idle_timeout {
                        self.retire(id, now);
                    }
                }
                WorkerState::Busy | WorkerState::Dead => {}
            }
        }

        let total: u64 = self
            .slots
            .values()
            .filter(|s| s.is_live())
            .map(|s| s.footprint)
            .sum();
        self.gauge.set(total);
        self.refresh_degraded(now);
        self.publish_status();
        notices
    }

    fn enforce_running(&mut self, id: WorkerId, used: u64, now: Instant, notices: &mut Vec<PoolNotice>) {
        let soft = self.config.soft_limit_bytes;
        let hard = self.config.hard_limit_bytes;
        let grace = self.config.preempt_grace;
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        let Some(assignment) = slot.assignment.as_ref() else {
            return;
        };
        let task_id = assignment.task.id;
        let deadline = assignment.deadline;
        let timeout = deadline.saturating_duration_since(assignment.started_at);

        if used > hard {
            self.kill_over_limit(id, used, now, notices);
        } else if slot.drain_deadline.is_some_and(|d| now >= d) {
            warn!(worker_id = %id, task_id = %task_id, "Preemption not acknowledged in time");
            if let Some(mut assignment) = self.kill(id, now) {
                assignment.task.checkpoint = None;
                notices.push(PoolNotice::Lost {
                    worker_id: id,
                    assignment,
                    error: TaskError::from(&Error::PreemptionTimedOut {
                        worker_id: id,
                        grace,
                    }),
                });
            }
        } else if now >= deadline {
            warn!(worker_id = %id, task_id = %task_id, "Task exceeded its execution time");
            if let Some(assignment) = self.kill(id, now) {
                notices.push(PoolNotice::Lost {
                    worker_id: id,
                    assignment,
                    error: TaskError::from(&Error::ExecutionTimeout { task_id, timeout }),
                });
            }
        } else if used > soft && !slot.advised {
            slot.advised = true;
            slot.send(PoolMessage::Advise {
                task_id,
                memory_estimate: used,
                soft_limit: soft,
            });
            self.metrics.memory_advisory();
            warn!(worker_id = %id, task_id = %task_id, used, soft_limit = soft, "Worker over soft memory limit");
        }
    }

    /// Ask an idle worker to exit gracefully.
    fn retire(&mut self, id: WorkerId, now: Instant) {
        let grace = self.config.preempt_grace;
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        if !slot.set_state(WorkerState::Draining) {
            return;
        }
        slot.retiring = true;
        slot.drain_deadline = Some(now + grace);
        slot.send(PoolMessage::Shutdown);
        self.metrics.worker_soft_kill();
        info!(worker_id = %id, "Retiring idle worker");
    }

    /// Begin shutdown: idle workers get SHUTDOWN, busy ones are killed.
    /// Returns the attempts that were running.
    pub fn shutdown(&mut self, now: Instant) -> Vec<Assignment> {
        let ids: Vec<WorkerId> = self.slots.keys().copied().collect();
        let mut interrupted = Vec::new();
        for id in ids {
            let Some(slot) = self.slots.get(&id) else {
                continue;
            };
            if slot.assignment.is_some() || slot.state == WorkerState::Spawning {
                if let Some(slot) = self.slots.get_mut(&id) {
                    // Terminated on purpose; not a crash.
                    slot.retiring = true;
                }
                if let Some(assignment) = self.kill(id, now) {
                    interrupted.push(assignment);
                }
            } else if slot.state.is_available() {
                self.retire(id, now);
            }
        }
        self.publish_status();
        interrupted
    }

    /// Kill every remaining worker without ceremony.
    pub fn kill_all(&mut self, now: Instant) {
        let ids: Vec<WorkerId> = self
            .slots
            .values()
            .filter(|s| s.is_live())
            .map(|s| s.id)
            .collect();
        for id in ids {
            self.kill(id, now);
        }
    }

    fn publish_status(&self) {
        self.status.active.store(self.live_workers(), Ordering::Relaxed);
    }
}
