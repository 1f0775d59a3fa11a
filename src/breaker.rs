//! Circuit breakers guarding unreliable operations.
//!
//! One breaker per guarded operation name, owned by a [`BreakerRegistry`].
//! State changes happen under a per-breaker mutex so concurrent callers
//! recording outcomes for the same operation never interleave.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::error::Error;
use crate::metrics::Metrics;

const EVENT_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

/// Observable state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerTransition {
    pub name: String,
    pub from: BreakerState,
    pub to: BreakerState,
    pub at: DateTime<Utc>,
}

/// Admission ticket from [`CircuitBreaker::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Breaker closed; ordinary call.
    Normal,
    /// The single half-open trial.
    Trial,
}

/// Read-only view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStatus {
    pub state: BreakerState,
    /// Failures inside the rolling window.
    pub failure_count: usize,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub consecutive_successes: u32,
    pub backoff_level: u32,
}

/// Outcome of [`CircuitBreaker::call`].
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("circuit {name} open, retry after {retry_after:?}")]
    Open { name: String, retry_after: Duration },

    #[error("{0}")]
    Inner(E),
}

struct Inner {
    state: BreakerState,
    failures: VecDeque<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    backoff_level: u32,
    trial_in_flight: bool,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    metrics: Arc<Metrics>,
    events: broadcast::Sender<BreakerTransition>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: BreakerConfig,
        metrics: Arc<Metrics>,
        events: broadcast::Sender<BreakerTransition>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            metrics,
            events,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                last_failure_at: None,
                consecutive_successes: 0,
                opened_at: None,
                backoff_level: 0,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn status(&self) -> BreakerStatus {
        let mut inner = self.inner.lock();
        self.prune(&mut inner, Instant::now());
        BreakerStatus {
            state: inner.state,
            failure_count: inner.failures.len(),
            last_failure_at: inner.last_failure_at,
            consecutive_successes: inner.consecutive_successes,
            backoff_level: inner.backoff_level,
        }
    }

    /// Open duration for a backoff level: base × 2^level, capped.
    fn open_timeout(&self, level: u32) -> Duration {
        self.config
            .base_open_timeout
            .saturating_mul(1u32 << level.min(16))
            .min(self.config.max_open_timeout)
    }

    fn prune(&self, inner: &mut Inner, now: Instant) {
        while let Some(&oldest) = inner.failures.front() {
            if now.duration_since(oldest) > self.config.failure_window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }

    /// Fail fast while open, without claiming the half-open trial.
    pub fn check(&self) -> Result<(), Error> {
        let inner = self.inner.lock();
        if inner.state == BreakerState::Open {
            let timeout = self.open_timeout(inner.backoff_level);
            let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or(timeout);
            if elapsed < timeout {
                return Err(self.open_error(timeout - elapsed));
            }
        }
        Ok(())
    }

    /// Ask to make a call. While open this fails fast with a retry-after hint.
    pub fn try_acquire(&self) -> Result<Permit, Error> {
        let mut inner = self.inner.lock();
        let mut transition = None;
        let result = match inner.state {
            BreakerState::Closed => Ok(Permit::Normal),
            BreakerState::Open => {
                let timeout = self.open_timeout(inner.backoff_level);
                let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or(timeout);
                if elapsed >= timeout {
                    transition = Some(self.set_state(&mut inner, BreakerState::HalfOpen));
                    inner.trial_in_flight = true;
                    Ok(Permit::Trial)
                } else {
                    Err(self.open_error(timeout - elapsed))
                }
            }
            BreakerState::HalfOpen if inner.trial_in_flight => {
                Err(self.open_error(self.open_timeout(inner.backoff_level)))
            }
            BreakerState::HalfOpen => {
                inner.trial_in_flight = true;
                Ok(Permit::Trial)
            }
        };
        drop(inner);
        self.emit(transition);
        result
    }

    /// Give back a permit whose call produced no verdict.
    pub fn release(&self, permit: Permit) {
        if permit == Permit::Trial {
            let mut inner = self.inner.lock();
            if inner.state == BreakerState::HalfOpen {
                inner.trial_in_flight = false;
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_successes = inner.consecutive_successes.saturating_add(1);
        let mut transition = None;
        if inner.state == BreakerState::HalfOpen {
            inner.trial_in_flight = false;
            if inner.consecutive_successes >= self.config.success_threshold {
                inner.failures.clear();
                inner.backoff_level = 0;
                inner.opened_at = None;
                transition = Some(self.set_state(&mut inner, BreakerState::Closed));
            }
        }
        drop(inner);
        self.emit(transition);
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.last_failure_at = Some(Utc::now());
        inner.consecutive_successes = 0;
        inner.failures.push_back(now);
        self.prune(&mut inner, now);

        let mut transition = None;
        match inner.state {
            BreakerState::Closed if inner.failures.len() >= self.config.failure_threshold => {
                inner.opened_at = Some(now);
                transition = Some(self.set_state(&mut inner, BreakerState::Open));
            }
            BreakerState::HalfOpen => {
                inner.trial_in_flight = false;
                inner.backoff_level = inner.backoff_level.saturating_add(1);
                inner.opened_at = Some(now);
                transition = Some(self.set_state(&mut inner, BreakerState::Open));
            }
            _ => {}
        }
        drop(inner);
        self.emit(transition);
    }

    /// Run `op` under the breaker, recording its outcome.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Err(Error::CircuitOpen { name, retry_after }) = self.try_acquire() {
            return Err(BreakerError::Open { name, retry_after });
        }
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    fn open_error(&self, retry_after: Duration) -> Error {
        Error::CircuitOpen {
            name: self.name.clone(),
            retry_after,
        }
    }

    fn set_state(&self, inner: &mut Inner, to: BreakerState) -> BreakerTransition {
        let from = inner.state;
        inner.state = to;
        BreakerTransition {
            name: self.name.clone(),
            from,
            to,
            at: Utc::now(),
        }
    }

    fn emit(&self, transition: Option<BreakerTransition>) {
        let Some(t) = transition else {
            return;
        };
        self.metrics.breaker_transition();
        match t.to {
            BreakerState::Open => {
                warn!(breaker = %t.name, from = %t.from, "Circuit opened")
            }
            _ => info!(breaker = %t.name, from = %t.from, to = %t.to, "Circuit transition"),
        }
        let _ = self.events.send(t);
    }
}

/// All breakers of one scheduler, keyed by guarded operation name.
pub struct BreakerRegistry {
    config: BreakerConfig,
    metrics: Arc<Metrics>,
    events: broadcast::Sender<BreakerTransition>,
    breakers: RwLock<BTreeMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig, metrics: Arc<Metrics>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            metrics,
            events,
            breakers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Breaker for `name`, created closed on first use.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(b) = self.breakers.read().get(name) {
            return Arc::clone(b);
        }
        let mut breakers = self.breakers.write();
        Arc::clone(breakers.entry(name.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                name,
                self.config.clone(),
                Arc::clone(&self.metrics),
                self.events.clone(),
            ))
        }))
    }

    /// Existing breaker only.
    pub fn find(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    pub fn states(&self) -> BTreeMap<String, BreakerState> {
        self.breakers
            .read()
            .iter()
            .map(|(name, b)| (name.clone(), b.state()))
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BreakerTransition> {
        self.events.subscribe()
    }
}
