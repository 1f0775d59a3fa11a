//! Cron-driven heartbeat producer.
//!
//! Each firing enqueues one skippable priority-4 task. Under load the queue
//! refuses or evicts heartbeats; that is counted as a skip, never retried.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::HeartbeatConfig;
use crate::error::{ConfigError, Result};
use crate::scheduler::Governor;
use crate::task::{TaskId, TaskSpec};

pub struct HeartbeatProducer {
    schedule: cron::Schedule,
    payload: serde_json::Value,
}

impl HeartbeatProducer {
    pub fn new(config: &HeartbeatConfig) -> Result<Self> {
        let schedule = cron::Schedule::from_str(&config.schedule)
            .map_err(|e| ConfigError::invalid("heartbeat.schedule", format!("invalid cron: {e}")))?;
        Ok(Self {
            schedule,
            payload: config.payload.clone(),
        })
    }

    /// Next firing after now, if the schedule has one.
    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        self.schedule.upcoming(Utc).next()
    }

    /// Enqueue one heartbeat. Returns the task id if it was admitted.
    pub fn beat(&self, governor: &Governor) -> Option<TaskId> {
        match governor.enqueue(TaskSpec::heartbeat(self.payload.clone())) {
            Ok(handle) => {
                debug!(task_id = %handle.id(), "Heartbeat enqueued");
                Some(handle.id())
            }
            Err(e) => {
                debug!(error = %e, "Heartbeat skipped");
                None
            }
        }
    }

    /// Fire on schedule until cancelled.
    pub fn spawn(self, governor: Arc<Governor>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(schedule = %self.schedule, "Heartbeat producer started");
            while let Some(next) = self.next_fire() {
                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {
                        self.beat(&governor);
                    }
                }
            }
            debug!("Heartbeat producer stopped");
        })
    }
}
