//! Warden: memory-governed task admission and execution.

pub mod breaker;
pub mod config;
pub mod error;
pub mod health;
pub mod heartbeat;
pub mod http;
pub mod memory;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod queue;
pub mod runtime;
pub mod scheduler;
pub mod task;

pub use config::WardenConfig;
pub use error::{Error, Result};
pub use scheduler::Governor;
pub use task::{Priority, TaskHandle, TaskId, TaskOutcome, TaskSpec};
