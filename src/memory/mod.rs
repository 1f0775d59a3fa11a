//! Memory telemetry: sampling, smoothing and threshold bands.
//!
//! - `state`: `MemoryState` bands and the pure hysteresis classifier
//! - `sampler`: raw readings from `/proc` plus the worker memory gauge
//! - `monitor`: rolling window, state publication and the sampling timer

pub mod monitor;
pub mod sampler;
pub mod state;

pub use monitor::{MemoryMonitor, MemorySnapshot, MemoryStateChange};
pub use sampler::{MemorySampler, ProcSampler, RawMemory, WorkerMemoryGauge};
pub use state::{MemoryState, classify};
