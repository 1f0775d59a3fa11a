//! Memory monitor: periodic sampling with a smoothed, hysteretic state.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::sampler::MemorySampler;
use super::state::{MemoryState, classify};
use crate::config::MemoryConfig;
use crate::error::Result;
use crate::metrics::Metrics;

const EVENT_CAPACITY: usize = 64;

/// One immutable reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemorySnapshot {
    pub timestamp: DateTime<Utc>,
    pub heap_used: u64,
    pub heap_total: u64,
    pub resident_set_size: u64,
    pub external: u64,
    pub percent_of_limit: f64,
}

/// Published whenever the band changes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemoryStateChange {
    pub old: MemoryState,
    pub new: MemoryState,
    /// Smoothed percent that caused the change; `None` when a read failed.
    pub smoothed_percent: Option<f64>,
    pub at: DateTime<Utc>,
}

struct MonitorInner {
    window: VecDeque<MemorySnapshot>,
    ticks_since_transition: usize,
}

/// Owns the memory state; everything else only reads it.
pub struct MemoryMonitor {
    config: MemoryConfig,
    sampler: Arc<dyn MemorySampler>,
    metrics: Arc<Metrics>,
    inner: Mutex<MonitorInner>,
    state_tx: watch::Sender<MemoryState>,
    events: broadcast::Sender<MemoryStateChange>,
}

impl MemoryMonitor {
    pub fn new(config: MemoryConfig, sampler: Arc<dyn MemorySampler>, metrics: Arc<Metrics>) -> Self {
        let (state_tx, _) = watch::channel(MemoryState::Normal);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let window = config.smoothing_window;
        Self {
            config,
            sampler,
            metrics,
            inner: Mutex::new(MonitorInner {
                window: VecDeque::with_capacity(window),
                ticks_since_transition: window,
            }),
            state_tx,
            events,
        }
    }

    /// Take one reading without touching the published state.
    pub fn sample(&self) -> Result<MemorySnapshot> {
        let raw = self.sampler.read()?;
        let percent = raw.accounted() as f64 / self.config.ceiling_bytes as f64 * 100.0;
        Ok(MemorySnapshot {
            timestamp: Utc::now(),
            heap_used: raw.heap_used,
            heap_total: raw.heap_total,
            resident_set_size: raw.resident_set_size,
            external: raw.external,
            percent_of_limit: percent,
        })
    }

    /// Latest published band.
    pub fn current_state(&self) -> MemoryState {
        *self.state_tx.borrow()
    }

    /// Receiver that always yields the most recent band.
    pub fn watch(&self) -> watch::Receiver<MemoryState> {
        self.state_tx.subscribe()
    }

    /// Stream of band transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<MemoryStateChange> {
        self.events.subscribe()
    }

    /// Most recent snapshot in the smoothing window.
    pub fn latest(&self) -> Option<MemorySnapshot> {
        self.inner.lock().window.back().copied()
    }

    /// Moving average over the current window.
    pub fn smoothed_percent(&self) -> Option<f64> {
        average(&self.inner.lock().window)
    }

    /// Sample, smooth, classify and publish. Returns the band after the tick.
    pub fn tick(&self) -> MemoryState {
        let reading = self.sample();
        let mut inner = self.inner.lock();
        inner.ticks_since_transition = inner.ticks_since_transition.saturating_add(1);
        let current = self.current_state();

        let (next, smoothed) = match reading {
            Ok(snapshot) => {
                if inner.window.len() == self.config.smoothing_window {
                    inner.window.pop_front();
                }
                inner.window.push_back(snapshot);
                let smoothed = average(&inner.window).unwrap_or(snapshot.percent_of_limit);
                debug!(
                    percent = snapshot.percent_of_limit,
                    smoothed,
                    rss = snapshot.resident_set_size,
                    external = snapshot.external,
                    "Memory sample"
                );
                let mut next = classify(current, smoothed, &self.config.thresholds);
                if next < current && inner.ticks_since_transition < self.config.smoothing_window {
                    // Hold the band until a full window has passed since the last change.
                    next = current;
                }
                (next, Some(smoothed))
            }
            Err(e) => {
                warn!(error = %e, "Memory read failed; assuming EMERGENCY");
                inner.window.clear();
                (MemoryState::Emergency, None)
            }
        };

        if next != current {
            inner.ticks_since_transition = 0;
            drop(inner);
            self.publish(current, next, smoothed);
        }
        next
    }

    fn publish(&self, old: MemoryState, new: MemoryState, smoothed: Option<f64>) {
        self.state_tx.send_replace(new);
        self.metrics.memory_threshold_crossing();
        if new > old {
            warn!(%old, %new, smoothed = ?smoothed, "Memory pressure rising");
        } else {
            info!(%old, %new, smoothed = ?smoothed, "Memory pressure easing");
        }
        let _ = self.events.send(MemoryStateChange {
            old,
            new,
            smoothed_percent: smoothed,
            at: Utc::now(),
        });
    }

    /// Run `tick` on the configured interval until cancelled.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.sample_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.tick();
                    }
                }
            }
            debug!("Memory monitor stopped");
        })
    }
}

fn average(window: &VecDeque<MemorySnapshot>) -> Option<f64> {
    if window.is_empty() {
        return None;
    }
    Some(window.iter().map(|s| s.percent_of_limit).sum::<f64>() / window.len() as f64)
}
