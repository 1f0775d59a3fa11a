//! Operational counters.
//!
//! Counters are plain atomics; the wire format is left to whoever scrapes
//! [`MetricsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process-wide counters, shared behind an `Arc`.
#[derive(Debug, Default)]
pub struct Metrics {
    tasks_admitted: AtomicU64,
    tasks_rejected: AtomicU64,
    tasks_evicted: AtomicU64,
    heartbeats_skipped: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_retried: AtomicU64,
    tasks_cancelled: AtomicU64,
    preemptions: AtomicU64,
    worker_soft_kills: AtomicU64,
    worker_hard_kills: AtomicU64,
    worker_spawns: AtomicU64,
    memory_advisories: AtomicU64,
    breaker_transitions: AtomicU64,
    memory_threshold_crossings: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub tasks_admitted: u64,
    pub tasks_rejected: u64,
    pub tasks_evicted: u64,
    pub heartbeats_skipped: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_retried: u64,
    pub tasks_cancelled: u64,
    pub preemptions: u64,
    /// Graceful terminations (idle shutdown, answered preemption).
    pub worker_soft_kills: u64,
    /// Forced terminations (limits, deadlines, unanswered preemption).
    pub worker_hard_kills: u64,
    pub worker_spawns: u64,
    pub memory_advisories: u64,
    pub breaker_transitions: u64,
    pub memory_threshold_crossings: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Metrics {
    pub fn task_admitted(&self) {
        bump(&self.tasks_admitted);
    }

    /// A rejected enqueue. Skippable rejections also count as skipped heartbeats.
    pub fn task_rejected(&self, skippable: bool) {
        bump(&self.tasks_rejected);
        if skippable {
            bump(&self.heartbeats_skipped);
        }
    }

    /// An evicted queued task. Evicted heartbeats also count as skipped.
    pub fn task_evicted(&self, skippable: bool) {
        bump(&self.tasks_evicted);
        if skippable {
            bump(&self.heartbeats_skipped);
        }
    }

    pub fn task_completed(&self) {
        bump(&self.tasks_completed);
    }

    pub fn task_failed(&self) {
        bump(&self.tasks_failed);
    }

    pub fn task_retried(&self) {
        bump(&self.tasks_retried);
    }

    pub fn task_cancelled(&self) {
        bump(&self.tasks_cancelled);
    }

    pub fn preemption(&self) {
        bump(&self.preemptions);
    }

    pub fn worker_soft_kill(&self) {
        bump(&self.worker_soft_kills);
    }

    pub fn worker_hard_kill(&self) {
        bump(&self.worker_hard_kills);
    }

    pub fn worker_spawned(&self) {
        bump(&self.worker_spawns);
    }

    pub fn memory_advisory(&self) {
        bump(&self.memory_advisories);
    }

    pub fn breaker_transition(&self) {
        bump(&self.breaker_transitions);
    }

    pub fn memory_threshold_crossing(&self) {
        bump(&self.memory_threshold_crossings);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            tasks_admitted: get(&self.tasks_admitted),
            tasks_rejected: get(&self.tasks_rejected),
            tasks_evicted: get(&self.tasks_evicted),
            heartbeats_skipped: get(&self.heartbeats_skipped),
            tasks_completed: get(&self.tasks_completed),
            tasks_failed: get(&self.tasks_failed),
            tasks_retried: get(&self.tasks_retried),
            tasks_cancelled: get(&self.tasks_cancelled),
            preemptions: get(&self.preemptions),
            worker_soft_kills: get(&self.worker_soft_kills),
            worker_hard_kills: get(&self.worker_hard_kills),
            worker_spawns: get(&self.worker_spawns),
            memory_advisories: get(&self.memory_advisories),
            breaker_transitions: get(&self.breaker_transitions),
            memory_threshold_crossings: get(&self.memory_threshold_crossings),
        }
    }
}
