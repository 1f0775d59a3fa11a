//! The scheduler: sole authority moving tasks from the queue to the pool.
//!
//! [`Governor`] is the producer-facing handle. Behind it a single loop owns the
//! [`WorkerPool`] and reacts to four things: enqueues, pool events, memory
//! state changes and the monitoring tick. Every pass reads the latest
//! published [`MemoryState`] and applies, in order:
//!
//! - EMERGENCY: only priority-0 work is dispatched, and only onto workers that
//!   are already available; nothing is spawned or preempted. The
//!   lowest-priority running task is killed on entry and on every tick while
//!   the state persists.
//! - CRITICAL: when the queue head cannot be placed on an available worker,
//!   the lowest-priority busy preemptable task less urgent than the head is
//!   preempted (one at a time) before anything else is admitted.
//! - Otherwise: dequeue (WARNING pauses all-skippable bands), assign to an
//!   available worker, spawn on demand within capacity.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::breaker::BreakerRegistry;
use crate::config::WardenConfig;
use crate::error::{AdmissionReason, Error, FailureKind, Result, TaskError};
use crate::health::HealthSnapshot;
use crate::memory::{MemoryMonitor, MemorySampler, MemoryState, ProcSampler, WorkerMemoryGauge};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::pool::{
    Assignment, PoolEvent, PoolNotice, PoolStatus, PreemptReason, WorkerId, WorkerLauncher,
    WorkerPool,
};
use crate::queue::{self, BoundedPriorityQueue, Rejected};
use crate::task::{
    CompletionEvent, Execution, Priority, Task, TaskHandle, TaskId, TaskOutcome, TaskSpec,
    TaskStatus,
};

const COMPLETION_CAPACITY: usize = 256;

/// State shared between producers and the scheduler loop.
struct Shared {
    config: WardenConfig,
    queue: BoundedPriorityQueue,
    monitor: Arc<MemoryMonitor>,
    breakers: BreakerRegistry,
    metrics: Arc<Metrics>,
    pool_status: Arc<PoolStatus>,
    waiters: Mutex<HashMap<TaskId, oneshot::Sender<TaskOutcome>>>,
    completions: broadcast::Sender<CompletionEvent>,
    shutting_down: AtomicBool,
}

impl Shared {
    /// Deliver the terminal outcome of `task`. Called exactly once per task.
    fn finish(&self, mut task: Task, outcome: TaskOutcome) {
        let status = match &outcome {
            TaskOutcome::Completed { .. } => TaskStatus::Completed,
            TaskOutcome::Failed { .. } => TaskStatus::Failed,
            TaskOutcome::Cancelled => TaskStatus::Cancelled,
        };
        set_status(&mut task, status);

        match &outcome {
            TaskOutcome::Completed { .. } => {
                self.metrics.task_completed();
                info!(task_id = %task.id, priority = %task.priority, "Task completed");
            }
            TaskOutcome::Failed { error, attempts } => {
                self.metrics.task_failed();
                warn!(task_id = %task.id, priority = %task.priority, attempts, error = %error, "Task failed");
            }
            TaskOutcome::Cancelled => {
                self.metrics.task_cancelled();
                info!(task_id = %task.id, priority = %task.priority, "Task cancelled");
            }
        }

        if let Some(tx) = self.waiters.lock().remove(&task.id) {
            let _ = tx.send(outcome.clone());
        }
        let _ = self.completions.send(CompletionEvent {
            task_id: task.id,
            priority: task.priority,
            outcome,
        });
    }

    fn evicted(&self, victim: Task) {
        self.metrics.task_evicted(victim.skippable);
        let attempts = victim.attempt_count;
        self.finish(
            victim,
            TaskOutcome::Failed {
                error: TaskError::new(FailureKind::Evicted, "evicted by a more urgent task"),
                attempts,
            },
        );
    }
}

fn set_status(task: &mut Task, status: TaskStatus) {
    if let Err(e) = task.transition_to(status) {
        warn!(task_id = %task.id, error = %e, "Invalid task transition");
    }
}

enum Command {
    Cancel {
        task_id: TaskId,
        reply: oneshot::Sender<bool>,
    },
    /// A retry backoff elapsed.
    Retry(TaskId),
}

/// Producer-facing handle to a running scheduler.
pub struct Governor {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Governor {
    /// Start with the `/proc` sampler. Must be called inside a tokio runtime.
    pub fn start(config: WardenConfig, launcher: Arc<dyn WorkerLauncher>) -> Result<Self> {
        let gauge = WorkerMemoryGauge::new();
        let sampler = Arc::new(ProcSampler::new(gauge.clone()));
        Self::start_with(config, launcher, sampler, gauge)
    }

    /// Start with an explicit sampler. `gauge` receives the pool's worker footprint.
    pub fn start_with(
        config: WardenConfig,
        launcher: Arc<dyn WorkerLauncher>,
        sampler: Arc<dyn MemorySampler>,
        gauge: WorkerMemoryGauge,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(Metrics::default());
        let monitor = Arc::new(MemoryMonitor::new(
            config.memory.clone(),
            sampler,
            Arc::clone(&metrics),
        ));
        let (pool, pool_events) = WorkerPool::new(
            config.pool.clone(),
            launcher,
            Arc::clone(&metrics),
            gauge,
        );
        let (completions, _) = broadcast::channel(COMPLETION_CAPACITY);
        let shared = Arc::new(Shared {
            queue: BoundedPriorityQueue::new(config.queue.clone()),
            breakers: BreakerRegistry::new(config.breaker.clone(), Arc::clone(&metrics)),
            pool_status: pool.status(),
            monitor: Arc::clone(&monitor),
            metrics,
            waiters: Mutex::new(HashMap::new()),
            completions,
            shutting_down: AtomicBool::new(false),
            config,
        });

        let cancel = CancellationToken::new();
        let (command_tx, commands) = mpsc::unbounded_channel();
        let monitor_task = Arc::clone(&monitor).spawn(cancel.child_token());

        let scheduler = Scheduler {
            shared: Arc::clone(&shared),
            memory: monitor.watch(),
            pool,
            pool_events,
            commands,
            command_tx: command_tx.clone(),
            retry_pending: HashMap::new(),
            cancel: cancel.clone(),
        };
        let loop_task = tokio::spawn(scheduler.run());
        info!(
            max_workers = shared.config.pool.max_workers,
            ceiling_mb = shared.config.memory.ceiling_bytes / (1024 * 1024),
            "Scheduler started"
        );

        Ok(Self {
            shared,
            commands: command_tx,
            cancel,
            tasks: Mutex::new(vec![monitor_task, loop_task]),
        })
    }

    /// Admit a task. Rejections and open circuits are returned synchronously.
    pub fn enqueue(&self, spec: TaskSpec) -> Result<TaskHandle> {
        let shared = &self.shared;
        if shared.shutting_down.load(Ordering::SeqCst) {
            let task_id = TaskId::new();
            shared.metrics.task_rejected(spec.skippable);
            return Err(Error::AdmissionRejected {
                task_id,
                reason: AdmissionReason::ShuttingDown,
            });
        }
        if let Some(breaker) = spec.guard.as_deref().and_then(|g| shared.breakers.find(g)) {
            breaker.check()?;
        }

        let task = Task::from_spec(spec);
        let task_id = task.id;
        let priority = task.priority;
        let (tx, rx) = oneshot::channel();
        // Registered first so an immediate eviction or completion has somewhere to go.
        shared.waiters.lock().insert(task_id, tx);

        match shared.queue.enqueue(task, shared.monitor.current_state()) {
            Ok(evicted) => {
                shared.metrics.task_admitted();
                debug!(task_id = %task_id, priority = %priority, "Task admitted");
                if let Some(victim) = evicted {
                    shared.evicted(victim);
                }
                Ok(TaskHandle::new(task_id, rx))
            }
            Err(Rejected { task, reason }) => {
                shared.waiters.lock().remove(&task_id);
                shared.metrics.task_rejected(task.skippable);
                info!(task_id = %task_id, priority = %priority, %reason, "Task rejected");
                Err(Error::AdmissionRejected { task_id, reason })
            }
        }
    }

    /// Cancel a queued, retry-pending or running task.
    ///
    /// Running tasks are preempted cooperatively and finish as `Cancelled`.
    /// Returns `false` if the task is unknown or already finished.
    pub async fn cancel(&self, task_id: TaskId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Cancel { task_id, reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub fn health(&self) -> HealthSnapshot {
        let depth = self.shared.queue.depth();
        HealthSnapshot {
            memory_state: self.shared.monitor.current_state(),
            queue_depth_by_priority: depth.by_priority,
            queue_total: depth.total,
            active_workers: self.shared.pool_status.active_workers(),
            pool_degraded: self.shared.pool_status.is_degraded(),
            circuit_breakers: self.shared.breakers.states(),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Terminal outcomes of every task.
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<CompletionEvent> {
        self.shared.completions.subscribe()
    }

    pub fn memory(&self) -> &Arc<MemoryMonitor> {
        &self.shared.monitor
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.shared.breakers
    }

    pub fn config(&self) -> &WardenConfig {
        &self.shared.config
    }

    /// Stop accepting work, cancel everything outstanding and stop the workers.
    pub async fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl Drop for Governor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Scheduler {
    shared: Arc<Shared>,
    memory: watch::Receiver<MemoryState>,
    pool: WorkerPool,
    pool_events: mpsc::UnboundedReceiver<PoolEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    command_tx: mpsc::UnboundedSender<Command>,
    /// Tasks waiting to re-enter the queue: on a backoff timer, or parked
    /// (no timer) until the memory state would admit them.
    retry_pending: HashMap<TaskId, (Task, Option<JoinHandle<()>>)>,
    cancel: CancellationToken,
}

impl Scheduler {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.pool.config().monitor_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            self.dispatch(Instant::now());

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Ok(()) = self.memory.changed() => {
                    let state = *self.memory.borrow_and_update();
                    if state == MemoryState::Emergency {
                        self.kill_lowest_priority(Instant::now());
                    }
                    self.resume_parked();
                }
                Some(event) = self.pool_events.recv() => {
                    let notices = self.pool.handle_event(event, Instant::now());
                    self.apply(notices);
                }
                Some(command) = self.commands.recv() => self.on_command(command),
                _ = self.shared.queue.notified() => {}
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let notices = self.pool.enforce(now);
                    self.apply(notices);
                    if self.memory_state() == MemoryState::Emergency {
                        self.kill_lowest_priority(now);
                    }
                }
            }
        }

        self.shutdown().await;
    }

    fn memory_state(&self) -> MemoryState {
        *self.memory.borrow()
    }

    fn dispatch(&mut self, now: Instant) {
        let state = self.memory_state();

        while let Some(head) = self.shared.queue.peek_priority(state) {
            if state == MemoryState::Emergency && head != Priority::Critical {
                return;
            }
            let Some(worker_id) = self.pool.available_worker() else {
                match state {
                    MemoryState::Emergency => {}
                    MemoryState::Critical
                        if self.pool.preemption_in_flight() || self.preempt_for(head, now) => {}
                    _ => self.scale_up(now),
                }
                return;
            };
            let Some(task) = self.shared.queue.dequeue(state) else {
                return;
            };
            self.start_attempt(worker_id, task, now);
        }
    }

    /// Preempt the least urgent busy preemptable task that `head` outranks.
    fn preempt_for(&mut self, head: Priority, now: Instant) -> bool {
        let victim = self
            .pool
            .running()
            .filter(|(_, a)| {
                a.task.preemptable && a.preempt.is_none() && head.is_more_urgent_than(a.task.priority)
            })
            .max_by_key(|(_, a)| (a.task.priority, a.started_at))
            .map(|(id, _)| id);
        match victim {
            Some(worker_id) => self.pool.preempt(worker_id, PreemptReason::MemoryPressure, now),
            None => false,
        }
    }

    fn scale_up(&mut self, now: Instant) {
        let waiting = self.shared.queue.len();
        let mut spawning = self.pool.spawning_count();
        while spawning < waiting && self.pool.has_capacity() {
            match self.pool.spawn(now) {
                Ok(_) => spawning += 1,
                Err(e) => {
                    debug!(error = %e, "Spawn refused");
                    break;
                }
            }
        }
    }

    fn start_attempt(&mut self, worker_id: WorkerId, mut task: Task, now: Instant) {
        set_status(&mut task, TaskStatus::Running);

        let permit = match task.guard.as_deref() {
            Some(guard) => match self.shared.breakers.get(guard).try_acquire() {
                Ok(permit) => Some(permit),
                Err(e) => {
                    let not_before = match &e {
                        Error::CircuitOpen { retry_after, .. } => Some(*retry_after),
                        _ => None,
                    };
                    debug!(task_id = %task.id, error = %e, "Guard open at dispatch");
                    self.fail_attempt(task, TaskError::from(&e), not_before);
                    return;
                }
            },
            None => None,
        };

        if let Err(assignment) = self.pool.assign(worker_id, task, permit, now) {
            self.release_permit(&assignment);
            let error = TaskError::new(
                FailureKind::WorkerCrashed,
                format!("worker {worker_id} unavailable for assignment"),
            );
            self.fail_attempt(assignment.task, error, None);
        }
    }

    fn apply(&mut self, notices: Vec<PoolNotice>) {
        for notice in notices {
            match notice {
                PoolNotice::Available(_) => {}
                PoolNotice::Reported {
                    assignment,
                    execution,
                    ..
                } => self.on_reported(assignment, execution),
                PoolNotice::Lost {
                    assignment, error, ..
                } => self.on_lost(assignment, error),
                PoolNotice::SpawnFailed { worker_id, error } => {
                    warn!(worker_id = %worker_id, error = %error, "Worker spawn failed");
                }
            }
        }
    }

    fn on_reported(&mut self, assignment: Assignment, execution: Execution) {
        let Assignment {
            task,
            permit,
            preempt,
            ..
        } = assignment;
        let guard_breaker = task.guard.as_deref().map(|g| self.shared.breakers.get(g));

        match execution {
            Execution::Completed { result } => {
                if let Some(breaker) = &guard_breaker {
                    breaker.record_success();
                }
                self.shared.finish(task, TaskOutcome::Completed { result });
            }
            Execution::Failed { error, guard } => {
                let failed_guard = guard.or_else(|| task.guard.clone());
                if let Some(name) = failed_guard.as_deref() {
                    self.shared.breakers.get(name).record_failure();
                }
                if let (Some(breaker), Some(permit)) = (&guard_breaker, permit) {
                    if failed_guard.as_deref() != Some(breaker.name()) {
                        breaker.release(permit);
                    }
                }
                if preempt == Some(PreemptReason::Cancelled) {
                    self.shared.finish(task, TaskOutcome::Cancelled);
                } else {
                    self.fail_attempt(task, TaskError::new(FailureKind::Task, error), None);
                }
            }
            Execution::Preempted { checkpoint } => {
                if let (Some(breaker), Some(permit)) = (&guard_breaker, permit) {
                    breaker.release(permit);
                }
                if preempt == Some(PreemptReason::Cancelled) {
                    self.shared.finish(task, TaskOutcome::Cancelled);
                } else {
                    self.requeue_preempted(task, checkpoint);
                }
            }
        }
    }

    fn on_lost(&mut self, assignment: Assignment, error: TaskError) {
        self.release_permit(&assignment);
        if assignment.preempt == Some(PreemptReason::Cancelled) {
            self.shared.finish(assignment.task, TaskOutcome::Cancelled);
        } else {
            self.fail_attempt(assignment.task, error, None);
        }
    }

    fn release_permit(&self, assignment: &Assignment) {
        if let (Some(guard), Some(permit)) = (assignment.task.guard.as_deref(), assignment.permit) {
            self.shared.breakers.get(guard).release(permit);
        }
    }

    /// Count a failed attempt and either schedule a retry or give up.
    fn fail_attempt(&mut self, mut task: Task, error: TaskError, not_before: Option<Duration>) {
        task.attempt_count += 1;
        if !error.kind.is_retryable() || !task.has_retries_left() {
            let attempts = task.attempt_count;
            self.shared
                .finish(task, TaskOutcome::Failed { error, attempts });
            return;
        }

        set_status(&mut task, TaskStatus::RetryPending);
        let delay = self
            .backoff(task.attempt_count)
            .max(not_before.unwrap_or_default());
        self.shared.metrics.task_retried();
        info!(
            task_id = %task.id,
            attempt = task.attempt_count,
            max_retries = task.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying task"
        );

        let task_id = task.id;
        let tx = self.command_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Command::Retry(task_id));
        });
        self.retry_pending.insert(task_id, (task, Some(timer)));
    }

    /// Exponential backoff with symmetric jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let retry = &self.shared.config.retry;
        let base = retry.delay_for(attempt);
        if retry.jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range(1.0 - retry.jitter..=1.0 + retry.jitter);
        base.mul_f64(factor)
    }

    fn requeue_preempted(&mut self, mut task: Task, checkpoint: Option<serde_json::Value>) {
        set_status(&mut task, TaskStatus::Preempted);
        if checkpoint.is_some() {
            task.checkpoint = checkpoint;
        }
        debug!(task_id = %task.id, checkpointed = task.checkpoint.is_some(), "Preempted task re-entering queue");
        self.readmit(task);
    }

    /// Put a retried or preempted task back in the queue.
    ///
    /// While the memory state would refuse it the task is parked instead and
    /// tried again on the next state change.
    fn readmit(&mut self, mut task: Task) {
        let state = self.memory_state();
        if let Some(reason) = queue::memory_gate(&task, state) {
            debug!(task_id = %task.id, priority = %task.priority, %reason, "Re-admission deferred");
            self.retry_pending.insert(task.id, (task, None));
            return;
        }

        set_status(&mut task, TaskStatus::Queued);
        match self.shared.queue.enqueue(task, state) {
            Ok(evicted) => {
                if let Some(victim) = evicted {
                    self.shared.evicted(victim);
                }
            }
            Err(Rejected { task, reason }) => {
                let attempts = task.attempt_count;
                self.shared.finish(
                    task,
                    TaskOutcome::Failed {
                        error: TaskError::new(
                            FailureKind::AdmissionRejected,
                            format!("re-admission refused: {reason}"),
                        ),
                        attempts,
                    },
                );
            }
        }
    }

    /// Retry re-admission of every parked task.
    fn resume_parked(&mut self) {
        let parked: Vec<TaskId> = self
            .retry_pending
            .iter()
            .filter(|(_, (_, timer))| timer.is_none())
            .map(|(id, _)| *id)
            .collect();
        for task_id in parked {
            if let Some((task, _)) = self.retry_pending.remove(&task_id) {
                self.readmit(task);
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Retry(task_id) => {
                if let Some((task, _)) = self.retry_pending.remove(&task_id) {
                    self.readmit(task);
                }
            }
            Command::Cancel { task_id, reply } => {
                let found = self.cancel_task(task_id, Instant::now());
                let _ = reply.send(found);
            }
        }
    }

    fn cancel_task(&mut self, task_id: TaskId, now: Instant) -> bool {
        if let Some(task) = self.shared.queue.remove(task_id) {
            self.shared.finish(task, TaskOutcome::Cancelled);
            return true;
        }
        if let Some((task, timer)) = self.retry_pending.remove(&task_id) {
            if let Some(timer) = timer {
                timer.abort();
            }
            self.shared.finish(task, TaskOutcome::Cancelled);
            return true;
        }
        match self.pool.worker_for(task_id) {
            Some(worker_id) => self.pool.preempt(worker_id, PreemptReason::Cancelled, now),
            None => false,
        }
    }

    /// Kill the least urgent running task outright.
    fn kill_lowest_priority(&mut self, now: Instant) {
        let victim = self
            .pool
            .running()
            .max_by_key(|(_, a)| (a.task.priority, a.started_at))
            .map(|(id, _)| id);
        let Some(worker_id) = victim else {
            return;
        };
        if let Some(assignment) = self.pool.kill(worker_id, now) {
            warn!(
                worker_id = %worker_id,
                task_id = %assignment.task.id,
                priority = %assignment.task.priority,
                "Killed task under memory emergency"
            );
            self.on_lost(
                assignment,
                TaskError::new(FailureKind::MemoryLimitExceeded, "killed under memory emergency"),
            );
        }
    }

    async fn shutdown(&mut self) {
        let now = Instant::now();
        info!("Scheduler shutting down");

        for task in self.shared.queue.drain() {
            self.shared.finish(task, TaskOutcome::Cancelled);
        }
        for (_, (task, timer)) in self.retry_pending.drain() {
            if let Some(timer) = timer {
                timer.abort();
            }
            self.shared.finish(task, TaskOutcome::Cancelled);
        }
        for assignment in self.pool.shutdown(now) {
            self.release_permit(&assignment);
            self.shared.finish(assignment.task, TaskOutcome::Cancelled);
        }

        let deadline = now + self.pool.config().preempt_grace;
        while !self.pool.is_empty() {
            let event = match tokio::time::timeout_at(deadline, self.pool_events.recv()).await {
                Ok(Some(event)) => event,
                _ => break,
            };
            for notice in self.pool.handle_event(event, Instant::now()) {
                match notice {
                    PoolNotice::Reported { assignment, .. } | PoolNotice::Lost { assignment, .. } => {
                        self.release_permit(&assignment);
                        self.shared.finish(assignment.task, TaskOutcome::Cancelled);
                    }
                    PoolNotice::Available(_) | PoolNotice::SpawnFailed { .. } => {}
                }
            }
        }
        self.pool.kill_all(Instant::now());
        debug!("Scheduler stopped");
    }
}
