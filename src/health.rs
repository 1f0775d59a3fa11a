//! Read-only health view for external health checks.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::breaker::BreakerState;
use crate::memory::MemoryState;
use crate::task::Priority;

/// Point-in-time health. Equal inputs give equal snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub memory_state: MemoryState,
    pub queue_depth_by_priority: [usize; Priority::COUNT],
    pub queue_total: usize,
    pub active_workers: usize,
    /// The worker restart budget is exhausted.
    pub pool_degraded: bool,
    pub circuit_breakers: BTreeMap<String, BreakerState>,
}

impl HealthSnapshot {
    /// Healthy means the pool can spawn and memory is below CRITICAL.
    pub fn is_healthy(&self) -> bool {
        !self.pool_degraded && self.memory_state < MemoryState::Critical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> HealthSnapshot {
        HealthSnapshot {
            memory_state: MemoryState::Warning,
            queue_depth_by_priority: [1, 0, 0, 0, 2],
            queue_total: 3,
            active_workers: 1,
            pool_degraded: false,
            circuit_breakers: BTreeMap::from([
                ("search".to_string(), BreakerState::Closed),
                ("llm".to_string(), BreakerState::Open),
            ]),
        }
    }

    #[test]
    fn serializes_with_stable_breaker_order() {
        let json = serde_json::to_string(&snapshot()).unwrap();
        assert!(json.contains(r#""memory_state":"WARNING""#));
        assert!(json.find("llm").unwrap() < json.find("search").unwrap());
        assert_eq!(json, serde_json::to_string(&snapshot()).unwrap());
    }

    #[test]
    fn degraded_pool_is_unhealthy() {
        let mut s = snapshot();
        assert!(s.is_healthy());
        s.pool_degraded = true;
        assert!(!s.is_healthy());
    }
}
