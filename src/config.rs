//! Configuration types.
//!
//! Every knob has a default matching the documented behaviour and can be
//! overridden from `WARDEN_*` environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::task::Priority;

const MIB: u64 = 1024 * 1024;

/// Top-level configuration.
#[derive(Debug, Clone, Default)]
pub struct WardenConfig {
    pub memory: MemoryConfig,
    pub queue: QueueConfig,
    pub pool: PoolConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub heartbeat: HeartbeatConfig,
    pub worker: WorkerProcessConfig,
    pub http: HttpConfig,
}

/// Band thresholds as percent of the memory ceiling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub warning: f64,
    pub critical: f64,
    pub emergency: f64,
    /// Points below an entry threshold required to leave that band.
    pub hysteresis_gap: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            warning: 70.0,
            critical: 85.0,
            emergency: 95.0,
            hysteresis_gap: 10.0,
        }
    }
}

/// Memory monitor settings.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Hard process memory ceiling the percentages are relative to.
    pub ceiling_bytes: u64,
    pub sample_interval: Duration,
    /// Samples in the moving average.
    pub smoothing_window: usize,
    pub thresholds: Thresholds,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            ceiling_bytes: 2048 * MIB,
            sample_interval: Duration::from_secs(5),
            smoothing_window: 3,
            thresholds: Thresholds::default(),
        }
    }
}

/// Bounded queue settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_depth: usize,
    /// Sub-cap per priority band, indexed by priority.
    pub band_capacity: [usize; Priority::COUNT],
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_depth: 5,
            band_capacity: [5; Priority::COUNT],
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_workers: usize,
    /// Advisory threshold per worker.
    pub soft_limit_bytes: u64,
    /// Kill threshold per worker.
    pub hard_limit_bytes: u64,
    pub idle_timeout: Duration,
    pub max_execution_time: Duration,
    pub max_restarts_per_hour: usize,
    pub restart_window: Duration,
    /// Cooperative preemption / shutdown grace window.
    pub preempt_grace: Duration,
    /// Time allowed between launch and the READY handshake.
    pub spawn_timeout: Duration,
    /// Enforcement tick for memory limits and deadlines.
    pub monitor_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            soft_limit_bytes: 300 * MIB,
            hard_limit_bytes: 512 * MIB,
            idle_timeout: Duration::from_secs(300),
            max_execution_time: Duration::from_secs(600),
            max_restarts_per_hour: 10,
            restart_window: Duration::from_secs(3600),
            preempt_grace: Duration::from_secs(5),
            spawn_timeout: Duration::from_secs(30),
            monitor_interval: Duration::from_secs(5),
        }
    }
}

/// Circuit breaker settings, shared by every breaker in a registry.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: usize,
    pub failure_window: Duration,
    /// Successful half-open trials needed to close.
    pub success_threshold: u32,
    pub base_open_timeout: Duration,
    pub max_open_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            failure_window: Duration::from_secs(60),
            success_threshold: 1,
            base_open_timeout: Duration::from_secs(1),
            max_open_timeout: Duration::from_secs(60),
        }
    }
}

/// Retry backoff for failed attempts.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fractional jitter applied to each delay (0.2 = ±20%).
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// Periodic heartbeat producer.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    /// Six-field cron expression (with seconds).
    pub schedule: String,
    pub payload: serde_json::Value,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            schedule: "0 * * * * *".to_string(),
            payload: serde_json::json!({ "op": "echo", "value": "heartbeat" }),
        }
    }
}

/// How worker processes are launched.
#[derive(Debug, Clone)]
pub struct WorkerProcessConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Default for WorkerProcessConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("warden-worker"),
            args: Vec::new(),
        }
    }
}

/// Health / metrics HTTP surface.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub bind: SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8090)),
        }
    }
}

impl WardenConfig {
    /// Load from `WARDEN_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let env = Lookup(&lookup);

        if let Some(mb) = env.parse::<u64>("WARDEN_MEMORY_CEILING_MB")? {
            config.memory.ceiling_bytes = mb * MIB;
        }
        if let Some(secs) = env.parse::<u64>("WARDEN_SAMPLE_INTERVAL_SECS")? {
            config.memory.sample_interval = Duration::from_secs(secs);
        }
        if let Some(n) = env.parse("WARDEN_SMOOTHING_WINDOW")? {
            config.memory.smoothing_window = n;
        }
        if let Some(pct) = env.parse("WARDEN_WARNING_PCT")? {
            config.memory.thresholds.warning = pct;
        }
        if let Some(pct) = env.parse("WARDEN_CRITICAL_PCT")? {
            config.memory.thresholds.critical = pct;
        }
        if let Some(pct) = env.parse("WARDEN_EMERGENCY_PCT")? {
            config.memory.thresholds.emergency = pct;
        }
        if let Some(gap) = env.parse("WARDEN_HYSTERESIS_GAP")? {
            config.memory.thresholds.hysteresis_gap = gap;
        }

        if let Some(depth) = env.parse("WARDEN_QUEUE_DEPTH")? {
            config.queue.max_depth = depth;
        }
        if let Some(raw) = env.get("WARDEN_BAND_CAPACITY") {
            config.queue.band_capacity = parse_band_capacity(&raw)?;
        }

        if let Some(n) = env.parse("WARDEN_MAX_WORKERS")? {
            config.pool.max_workers = n;
        }
        if let Some(mb) = env.parse::<u64>("WARDEN_SOFT_LIMIT_MB")? {
            config.pool.soft_limit_bytes = mb * MIB;
        }
        if let Some(mb) = env.parse::<u64>("WARDEN_HARD_LIMIT_MB")? {
            config.pool.hard_limit_bytes = mb * MIB;
        }
        if let Some(secs) = env.parse::<u64>("WARDEN_IDLE_TIMEOUT_SECS")? {
            config.pool.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parse::<u64>("WARDEN_MAX_EXECUTION_SECS")? {
            config.pool.max_execution_time = Duration::from_secs(secs);
        }
        if let Some(n) = env.parse("WARDEN_MAX_RESTARTS_PER_HOUR")? {
            config.pool.max_restarts_per_hour = n;
        }
        if let Some(secs) = env.parse::<u64>("WARDEN_PREEMPT_GRACE_SECS")? {
            config.pool.preempt_grace = Duration::from_secs(secs);
        }

        if let Some(n) = env.parse("WARDEN_BREAKER_FAILURES")? {
            config.breaker.failure_threshold = n;
        }
        if let Some(n) = env.parse("WARDEN_BREAKER_SUCCESSES")? {
            config.breaker.success_threshold = n;
        }
        if let Some(secs) = env.parse::<u64>("WARDEN_BREAKER_WINDOW_SECS")? {
            config.breaker.failure_window = Duration::from_secs(secs);
        }
        if let Some(ms) = env.parse::<u64>("WARDEN_BREAKER_BASE_MS")? {
            config.breaker.base_open_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = env.parse::<u64>("WARDEN_BREAKER_MAX_SECS")? {
            config.breaker.max_open_timeout = Duration::from_secs(secs);
        }

        if let Some(ms) = env.parse::<u64>("WARDEN_RETRY_BASE_MS")? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = env.parse::<u64>("WARDEN_RETRY_MAX_SECS")? {
            config.retry.max_delay = Duration::from_secs(secs);
        }

        if let Some(schedule) = env.get("WARDEN_HEARTBEAT_CRON") {
            config.heartbeat.enabled = true;
            config.heartbeat.schedule = schedule;
        }

        if let Some(program) = env.get("WARDEN_WORKER_PROGRAM") {
            config.worker.program = PathBuf::from(program);
        }
        if let Some(args) = env.get("WARDEN_WORKER_ARGS") {
            config.worker.args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Some(bind) = env.parse("WARDEN_HTTP_ADDR")? {
            config.http.bind = bind;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would break the scheduler's invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.memory.thresholds;
        if !(0.0 < t.warning && t.warning < t.critical && t.critical < t.emergency) {
            return Err(ConfigError::invalid(
                "thresholds",
                "must satisfy 0 < warning < critical < emergency",
            ));
        }
        if t.hysteresis_gap <= 0.0 || t.hysteresis_gap >= t.warning {
            return Err(ConfigError::invalid(
                "hysteresis_gap",
                "must be positive and below the warning threshold",
            ));
        }
        if self.memory.ceiling_bytes == 0 {
            return Err(ConfigError::invalid("memory.ceiling_bytes", "must be non-zero"));
        }
        let intervals = [
            ("memory.sample_interval", self.memory.sample_interval),
            ("pool.monitor_interval", self.pool.monitor_interval),
            ("pool.preempt_grace", self.pool.preempt_grace),
            ("pool.spawn_timeout", self.pool.spawn_timeout),
            ("pool.max_execution_time", self.pool.max_execution_time),
        ];
        if let Some((key, _)) = intervals.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::invalid(key, "must be non-zero"));
        }
        if self.memory.smoothing_window == 0 {
            return Err(ConfigError::invalid("memory.smoothing_window", "must be at least 1"));
        }
        if self.queue.max_depth == 0 {
            return Err(ConfigError::invalid("queue.max_depth", "must be at least 1"));
        }
        if let Some(p) = self
            .queue
            .band_capacity
            .iter()
            .position(|&cap| cap == 0 || cap > self.queue.max_depth)
        {
            return Err(ConfigError::invalid(
                "queue.band_capacity",
                format!("band {p} capacity must be within 1..={}", self.queue.max_depth),
            ));
        }
        if self.pool.max_workers == 0 {
            return Err(ConfigError::invalid("pool.max_workers", "must be at least 1"));
        }
        if self.pool.soft_limit_bytes >= self.pool.hard_limit_bytes {
            return Err(ConfigError::invalid(
                "pool.soft_limit_bytes",
                "soft limit must be below the hard limit",
            ));
        }
        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            return Err(ConfigError::invalid("breaker", "thresholds must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::invalid("retry.jitter", "must be within [0, 1)"));
        }
        if self.heartbeat.enabled {
            if let Err(e) = cron::Schedule::from_str(&self.heartbeat.schedule) {
                return Err(ConfigError::invalid(
                    "heartbeat.schedule",
                    format!("invalid cron: {e}"),
                ));
            }
        }
        Ok(())
    }
}

struct Lookup<'a, F>(&'a F);

impl<F> Lookup<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|value| {
                value.trim().parse().map_err(|e: T::Err| ConfigError::Parse {
                    key: key.to_string(),
                    value: value.clone(),
                    message: e.to_string(),
                })
            })
            .transpose()
    }
}

fn parse_band_capacity(raw: &str) -> Result<[usize; Priority::COUNT], ConfigError> {
    let parsed: Vec<usize> = raw
        .split(',')
        .map(|s| s.trim().parse::<usize>())
        .collect::<Result<_, _>>()
        .map_err(|e| ConfigError::Parse {
            key: "WARDEN_BAND_CAPACITY".to_string(),
            value: raw.to_string(),
            message: e.to_string(),
        })?;
    parsed.try_into().map_err(|v: Vec<usize>| {
        ConfigError::invalid(
            "WARDEN_BAND_CAPACITY",
            format!("expected {} comma-separated values, got {}", Priority::COUNT, v.len()),
        )
    })
}
