//! Bounded priority queue with eviction of skippable low-priority work.
//!
//! Producers enqueue concurrently; only the scheduler loop dequeues. The five
//! bands live behind one mutex so the total-depth invariant is checked and
//! updated atomically.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tracing::debug;

use crate::config::QueueConfig;
use crate::error::AdmissionReason;
use crate::memory::MemoryState;
use crate::task::{Priority, Task, TaskId};

/// Queue occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub by_priority: [usize; Priority::COUNT],
    pub total: usize,
}

/// A refused enqueue; the task is handed back.
#[derive(Debug)]
pub struct Rejected {
    pub task: Task,
    pub reason: AdmissionReason,
}

/// Why `memory` would refuse `task` regardless of queue occupancy.
pub fn memory_gate(task: &Task, memory: MemoryState) -> Option<AdmissionReason> {
    if memory == MemoryState::Emergency && task.priority != Priority::Critical {
        Some(AdmissionReason::MemoryEmergency)
    } else if memory >= MemoryState::Critical && task.skippable {
        Some(AdmissionReason::MemoryPressure)
    } else {
        None
    }
}

type Bands = [VecDeque<Task>; Priority::COUNT];

pub struct BoundedPriorityQueue {
    config: QueueConfig,
    bands: Mutex<Bands>,
    notify: Notify,
}

impl BoundedPriorityQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            bands: Mutex::new(Default::default()),
            notify: Notify::new(),
        }
    }

    /// Admit `task` under the given memory state.
    ///
    /// On success returns the task evicted to make room, if any.
    pub fn enqueue(&self, task: Task, memory: MemoryState) -> Result<Option<Task>, Rejected> {
        if let Some(reason) = memory_gate(&task, memory) {
            return Err(Rejected { task, reason });
        }

        let mut bands = self.bands.lock();
        let band = task.priority.index();
        if bands[band].len() >= self.config.band_capacity[band] {
            return Err(Rejected {
                reason: AdmissionReason::BandFull {
                    priority: task.priority,
                },
                task,
            });
        }

        let total: usize = bands.iter().map(VecDeque::len).sum();
        let evicted = if total >= self.config.max_depth {
            // Skippable work never displaces anything for its own admission.
            let victim = if task.skippable {
                None
            } else {
                evict_victim(&mut bands, task.priority)
            };
            match victim {
                Some(victim) => Some(victim),
                None => {
                    return Err(Rejected {
                        task,
                        reason: AdmissionReason::QueueFull,
                    });
                }
            }
        } else {
            None
        };

        if let Some(victim) = &evicted {
            debug!(
                task_id = %victim.id,
                priority = %victim.priority,
                by = %task.id,
                "Evicted queued task"
            );
        }
        bands[band].push_back(task);
        drop(bands);
        self.notify.notify_one();
        Ok(evicted)
    }

    /// Head of the most urgent eligible band.
    ///
    /// While memory is at WARNING or worse, bands holding only skippable
    /// entries are passed over but keep their entries.
    pub fn dequeue(&self, memory: MemoryState) -> Option<Task> {
        let mut bands = self.bands.lock();
        let band = eligible_band(&bands, memory)?;
        bands[band].pop_front()
    }

    /// Priority of what `dequeue` would return.
    pub fn peek_priority(&self, memory: MemoryState) -> Option<Priority> {
        let bands = self.bands.lock();
        eligible_band(&bands, memory).map(|b| Priority::ALL[b])
    }

    /// Remove a queued task (cancellation).
    pub fn remove(&self, id: TaskId) -> Option<Task> {
        let mut bands = self.bands.lock();
        bands.iter_mut().find_map(|band| {
            let pos = band.iter().position(|t| t.id == id)?;
            band.remove(pos)
        })
    }

    pub fn depth(&self) -> QueueDepth {
        let bands = self.bands.lock();
        let mut depth = QueueDepth::default();
        for (i, band) in bands.iter().enumerate() {
            depth.by_priority[i] = band.len();
            depth.total += band.len();
        }
        depth
    }

    pub fn len(&self) -> usize {
        self.bands.lock().iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every queued task, most urgent first.
    pub fn drain(&self) -> Vec<Task> {
        let mut bands = self.bands.lock();
        bands.iter_mut().flat_map(|band| band.drain(..)).collect()
    }

    /// Resolves after the next successful enqueue (or immediately if one
    /// happened since the last wait).
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Wake the consumer without enqueuing.
    pub fn wake(&self) {
        self.notify.notify_one();
    }
}

fn eligible_band(bands: &Bands, memory: MemoryState) -> Option<usize> {
    bands.iter().position(|band| {
        !band.is_empty() && !(memory >= MemoryState::Warning && band.iter().all(|t| t.skippable))
    })
}

/// Newest skippable entry of the least urgent band below `incoming`.
fn evict_victim(bands: &mut Bands, incoming: Priority) -> Option<Task> {
    let first = incoming.index() + 1;
    for band in (first.max(1)..Priority::COUNT).rev() {
        if let Some(pos) = bands[band].iter().rposition(|t| t.skippable) {
            return bands[band].remove(pos);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::task::TaskSpec;

    fn task(priority: Priority, skippable: bool) -> Task {
        Task::from_spec(TaskSpec::new(priority, serde_json::Value::Null).skippable(skippable))
    }

    fn queue() -> BoundedPriorityQueue {
        BoundedPriorityQueue::new(QueueConfig::default())
    }

    #[test]
    fn fills_to_five_then_rejects() {
        let queue = queue();
        for _ in 0..5 {
            queue.enqueue(task(Priority::Heartbeat, true), MemoryState::Normal).unwrap();
        }
        let rejected = queue
            .enqueue(task(Priority::Heartbeat, true), MemoryState::Normal)
            .unwrap_err();
        assert_eq!(rejected.reason, AdmissionReason::QueueFull);
        assert_eq!(queue.depth().total, 5);
    }

    #[test]
    fn critical_evicts_skippable_heartbeat() {
        let queue = queue();
        for _ in 0..5 {
            queue.enqueue(task(Priority::Heartbeat, true), MemoryState::Normal).unwrap();
        }
        let evicted = queue
            .enqueue(task(Priority::Critical, false), MemoryState::Normal)
            .unwrap()
            .expect("a heartbeat should be evicted");
        assert_eq!(evicted.priority, Priority::Heartbeat);

        let depth = queue.depth();
        assert_eq!(depth.total, 5);
        assert_eq!(depth.by_priority[0], 1);
        assert_eq!(depth.by_priority[4], 4);
    }

    #[test]
    fn non_skippable_victims_are_kept() {
        let queue = queue();
        for _ in 0..5 {
            queue.enqueue(task(Priority::Low, false), MemoryState::Normal).unwrap();
        }
        let rejected = queue
            .enqueue(task(Priority::Critical, false), MemoryState::Normal)
            .unwrap_err();
        assert_eq!(rejected.reason, AdmissionReason::QueueFull);
    }

    #[test]
    fn skippable_never_evicts_for_itself() {
        let queue = queue();
        for _ in 0..5 {
            queue.enqueue(task(Priority::Heartbeat, true), MemoryState::Normal).unwrap();
        }
        let rejected = queue
            .enqueue(task(Priority::High, true), MemoryState::Normal)
            .unwrap_err();
        assert_eq!(rejected.reason, AdmissionReason::QueueFull);
    }

    #[test]
    fn equal_priority_does_not_evict() {
        let queue = queue();
        for _ in 0..5 {
            queue.enqueue(task(Priority::Normal, true), MemoryState::Normal).unwrap();
        }
        assert!(queue.enqueue(task(Priority::Normal, false), MemoryState::Normal).is_err());
    }

    #[test]
    fn priority_zero_is_never_evicted() {
        let queue = queue();
        for _ in 0..5 {
            queue.enqueue(task(Priority::Critical, true), MemoryState::Normal).unwrap();
        }
        assert!(queue.enqueue(task(Priority::Critical, false), MemoryState::Normal).is_err());
        assert_eq!(queue.depth().by_priority[0], 5);
    }

    #[test]
    fn evicts_from_least_urgent_band_newest_first() {
        let queue = queue();
        queue.enqueue(task(Priority::Low, true), MemoryState::Normal).unwrap();
        queue.enqueue(task(Priority::Heartbeat, true), MemoryState::Normal).unwrap();
        let newest = task(Priority::Heartbeat, true);
        let newest_id = newest.id;
        queue.enqueue(newest, MemoryState::Normal).unwrap();
        queue.enqueue(task(Priority::Normal, false), MemoryState::Normal).unwrap();
        queue.enqueue(task(Priority::Normal, false), MemoryState::Normal).unwrap();

        let evicted = queue
            .enqueue(task(Priority::High, false), MemoryState::Normal)
            .unwrap()
            .unwrap();
        assert_eq!(evicted.id, newest_id);
    }

    #[test]
    fn band_cap_is_enforced() {
        let queue = BoundedPriorityQueue::new(QueueConfig {
            max_depth: 5,
            band_capacity: [5, 5, 5, 5, 2],
        });
        queue.enqueue(task(Priority::Heartbeat, true), MemoryState::Normal).unwrap();
        queue.enqueue(task(Priority::Heartbeat, true), MemoryState::Normal).unwrap();
        let rejected = queue
            .enqueue(task(Priority::Heartbeat, true), MemoryState::Normal)
            .unwrap_err();
        assert_eq!(
            rejected.reason,
            AdmissionReason::BandFull {
                priority: Priority::Heartbeat
            }
        );
    }

    #[test]
    fn dequeues_strict_priority_then_fifo() {
        let queue = queue();
        let low = task(Priority::Low, false);
        let first = task(Priority::High, false);
        let second = task(Priority::High, false);
        let (low_id, first_id, second_id) = (low.id, first.id, second.id);
        queue.enqueue(low, MemoryState::Normal).unwrap();
        queue.enqueue(first, MemoryState::Normal).unwrap();
        queue.enqueue(second, MemoryState::Normal).unwrap();

        assert_eq!(queue.dequeue(MemoryState::Normal).unwrap().id, first_id);
        assert_eq!(queue.dequeue(MemoryState::Normal).unwrap().id, second_id);
        assert_eq!(queue.dequeue(MemoryState::Normal).unwrap().id, low_id);
        assert!(queue.dequeue(MemoryState::Normal).is_none());
    }

    #[test]
    fn warning_skips_all_skippable_bands_without_discarding() {
        let queue = queue();
        queue.enqueue(task(Priority::Heartbeat, true), MemoryState::Normal).unwrap();
        let job = task(Priority::Low, false);
        let job_id = job.id;
        queue.enqueue(job, MemoryState::Normal).unwrap();
        queue.enqueue(task(Priority::High, true), MemoryState::Normal).unwrap();

        assert_eq!(queue.dequeue(MemoryState::Warning).unwrap().id, job_id);
        assert!(queue.dequeue(MemoryState::Warning).is_none());
        assert_eq!(queue.depth().total, 2);

        assert_eq!(queue.dequeue(MemoryState::Normal).unwrap().priority, Priority::High);
    }

    #[test]
    fn memory_gates_admission() {
        let queue = queue();
        let rejected = queue
            .enqueue(task(Priority::High, false), MemoryState::Emergency)
            .unwrap_err();
        assert_eq!(rejected.reason, AdmissionReason::MemoryEmergency);
        assert!(queue.enqueue(task(Priority::Critical, false), MemoryState::Emergency).is_ok());

        let rejected = queue
            .enqueue(task(Priority::Heartbeat, true), MemoryState::Critical)
            .unwrap_err();
        assert_eq!(rejected.reason, AdmissionReason::MemoryPressure);
    }

    #[test]
    fn remove_by_id() {
        let queue = queue();
        let t = task(Priority::Normal, false);
        let id = t.id;
        queue.enqueue(t, MemoryState::Normal).unwrap();
        assert_eq!(queue.remove(id).unwrap().id, id);
        assert!(queue.remove(id).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn random_sequences_respect_caps() {
        let config = QueueConfig {
            max_depth: 5,
            band_capacity: [2, 3, 3, 4, 5],
        };
        let queue = BoundedPriorityQueue::new(config.clone());
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut critical_queued = Vec::new();

        for _ in 0..5_000 {
            let memory = match rng.gen_range(0..10) {
                0 => MemoryState::Warning,
                1 => MemoryState::Critical,
                _ => MemoryState::Normal,
            };
            if rng.gen_bool(0.6) {
                let priority = Priority::ALL[rng.gen_range(0..Priority::COUNT)];
                let t = task(priority, rng.gen_bool(0.5));
                let id = t.id;
                if let Ok(evicted) = queue.enqueue(t, memory) {
                    if priority == Priority::Critical {
                        critical_queued.push(id);
                    }
                    if let Some(victim) = evicted {
                        assert_ne!(victim.priority, Priority::Critical);
                        assert!(victim.skippable);
                        assert!(priority.is_more_urgent_than(victim.priority));
                    }
                }
            } else if let Some(t) = queue.dequeue(memory) {
                critical_queued.retain(|id| *id != t.id);
            }

            let depth = queue.depth();
            assert!(depth.total <= config.max_depth);
            for (band, &len) in depth.by_priority.iter().enumerate() {
                assert!(len <= config.band_capacity[band]);
            }
            assert_eq!(depth.by_priority[0], critical_queued.len());
        }
    }

    #[tokio::test]
    async fn enqueue_wakes_waiter() {
        let queue = std::sync::Arc::new(queue());
        let waiter = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move { queue.notified().await })
        };
        tokio::task::yield_now().await;
        queue.enqueue(task(Priority::Normal, false), MemoryState::Normal).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
