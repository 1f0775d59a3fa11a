//! Memory pressure bands and hysteretic classification.

use serde::{Deserialize, Serialize};

use crate::config::Thresholds;

/// Memory pressure band, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryState {
    Normal,
    Warning,
    Critical,
    Emergency,
}

impl MemoryState {
    /// Percent at or above which this band is entered. `None` for NORMAL.
    pub fn entry_threshold(self, t: &Thresholds) -> Option<f64> {
        match self {
            Self::Normal => None,
            Self::Warning => Some(t.warning),
            Self::Critical => Some(t.critical),
            Self::Emergency => Some(t.emergency),
        }
    }

    /// Percent below which this band is left.
    pub fn clear_threshold(self, t: &Thresholds) -> Option<f64> {
        self.entry_threshold(t).map(|entry| entry - t.hysteresis_gap)
    }

    fn step_down(self) -> Self {
        match self {
            Self::Emergency => Self::Critical,
            Self::Critical => Self::Warning,
            Self::Warning | Self::Normal => Self::Normal,
        }
    }

    /// Band reached by crossing entry thresholds alone.
    fn raised(percent: f64, t: &Thresholds) -> Self {
        if percent >= t.emergency {
            Self::Emergency
        } else if percent >= t.critical {
            Self::Critical
        } else if percent >= t.warning {
            Self::Warning
        } else {
            Self::Normal
        }
    }
}

impl std::fmt::Display for MemoryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Normal => "NORMAL",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
            Self::Emergency => "EMERGENCY",
        };
        write!(f, "{s}")
    }
}

/// Next band for a smoothed reading given the current band.
///
/// Escalation happens as soon as an entry threshold is crossed. Leaving a band
/// requires dropping below its clear threshold; a single large drop may step
/// down several bands at once.
pub fn classify(current: MemoryState, smoothed: f64, t: &Thresholds) -> MemoryState {
    let raised = MemoryState::raised(smoothed, t);
    if raised > current {
        return raised;
    }

    let mut next = current;
    while let Some(clear) = next.clear_threshold(t) {
        if smoothed >= clear {
            break;
        }
        next = next.step_down();
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t() -> Thresholds {
        Thresholds::default()
    }

    #[test]
    fn escalates_on_entry_thresholds() {
        assert_eq!(classify(MemoryState::Normal, 69.9, &t()), MemoryState::Normal);
        assert_eq!(classify(MemoryState::Normal, 70.0, &t()), MemoryState::Warning);
        assert_eq!(classify(MemoryState::Normal, 85.0, &t()), MemoryState::Critical);
        assert_eq!(classify(MemoryState::Warning, 95.0, &t()), MemoryState::Emergency);
    }

    #[test]
    fn warning_holds_until_below_sixty() {
        let mut state = classify(MemoryState::Normal, 71.0, &t());
        assert_eq!(state, MemoryState::Warning);
        for reading in [69.0, 71.0, 69.0, 61.0, 60.0] {
            state = classify(state, reading, &t());
            assert_eq!(state, MemoryState::Warning, "reading {reading}");
        }
        assert_eq!(classify(state, 59.9, &t()), MemoryState::Normal);
    }

    #[test]
    fn steps_down_one_band_when_between_clears() {
        // Critical clears below 75; 80 is still above Warning's clear of 60.
        assert_eq!(classify(MemoryState::Critical, 80.0, &t()), MemoryState::Critical);
        assert_eq!(classify(MemoryState::Critical, 74.0, &t()), MemoryState::Warning);
        assert_eq!(classify(MemoryState::Emergency, 80.0, &t()), MemoryState::Critical);
    }

    #[test]
    fn large_drop_falls_through_several_bands() {
        assert_eq!(classify(MemoryState::Emergency, 10.0, &t()), MemoryState::Normal);
    }

    #[test]
    fn emergency_holds_above_eighty_five() {
        assert_eq!(classify(MemoryState::Emergency, 90.0, &t()), MemoryState::Emergency);
        assert_eq!(classify(MemoryState::Emergency, 85.0, &t()), MemoryState::Emergency);
    }

    #[test]
    fn clear_thresholds() {
        assert_eq!(MemoryState::Warning.clear_threshold(&t()), Some(60.0));
        assert_eq!(MemoryState::Critical.clear_threshold(&t()), Some(75.0));
        assert_eq!(MemoryState::Normal.clear_threshold(&t()), None);
    }

    #[test]
    fn ordering_follows_severity() {
        assert!(MemoryState::Warning > MemoryState::Normal);
        assert!(MemoryState::Emergency >= MemoryState::Critical);
        assert_eq!(MemoryState::Critical.to_string(), "CRITICAL");
    }
}
