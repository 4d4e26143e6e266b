//! Threshold-driven scaling decision.
//!
//! A proportional controller: retire one node when the pool is underused,
//! add a batch proportional to the load when it is overused, never go below
//! the configured floor. Averages are one tick old and the batch size is
//! truncated toward zero.

use crate::config::PoolSettings;
use serde::Serialize;

/// Outcome of one scaling evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "count", rename_all = "snake_case")]
pub enum ScaleDecision {
    /// Move the most recently added active node to closing
    RetireOne,
    /// Spawn this many new nodes
    Spawn(usize),
    /// Leave the pool as it is
    NoChange,
}

/// Inputs to the decision, captured under the pool lock
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSample {
    /// Requests per active node over the last tick
    pub average: f64,
    pub active: usize,
    pub starting: usize,
}

impl LoadSample {
    /// Build a sample from a request total. Returns None for an empty active set.
    pub fn from_total(total: u64, active: usize, starting: usize) -> Option<Self> {
        if active == 0 {
            return None;
        }
        Some(Self {
            average: total as f64 / active as f64,
            active,
            starting,
        })
    }
}

/// Decide how the pool should change for one tick
pub fn evaluate(sample: &LoadSample, settings: &PoolSettings) -> ScaleDecision {
    if sample.average < settings.scale_down_threshold && sample.active > settings.min_nodes {
        return ScaleDecision::RetireOne;
    }

    if sample.average >= settings.scale_up_threshold {
        let wanted = (sample.average / settings.scale_up_threshold).floor() as usize;
        let desired = wanted.saturating_sub(sample.starting);
        if desired > 0 {
            return ScaleDecision::Spawn(desired);
        }
    }

    ScaleDecision::NoChange
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(average: f64, active: usize, starting: usize) -> LoadSample {
        LoadSample {
            average,
            active,
            starting,
        }
    }

    #[test]
    fn test_scale_up_is_proportional_to_load() {
        let settings = PoolSettings::default();
        assert_eq!(
            evaluate(&sample(7.0, 3, 0), &settings),
            ScaleDecision::Spawn(2)
        );
        assert_eq!(
            evaluate(&sample(3.0, 3, 0), &settings),
            ScaleDecision::Spawn(1)
        );
        assert_eq!(
            evaluate(&sample(12.5, 5, 0), &settings),
            ScaleDecision::Spawn(4)
        );
    }

    #[test]
    fn test_scale_up_counts_nodes_already_starting() {
        let settings = PoolSettings::default();
        assert_eq!(
            evaluate(&sample(7.0, 3, 2), &settings),
            ScaleDecision::NoChange
        );
        assert_eq!(
            evaluate(&sample(7.0, 3, 1), &settings),
            ScaleDecision::Spawn(1)
        );
        // More starting than wanted never goes negative
        assert_eq!(
            evaluate(&sample(7.0, 3, 5), &settings),
            ScaleDecision::NoChange
        );
    }

    #[test]
    fn test_scale_down_above_floor() {
        let settings = PoolSettings::default();
        assert_eq!(
            evaluate(&sample(0.5, 4, 0), &settings),
            ScaleDecision::RetireOne
        );
    }

    #[test]
    fn test_scale_down_refused_at_floor() {
        let settings = PoolSettings::default();
        assert_eq!(
            evaluate(&sample(0.5, 3, 0), &settings),
            ScaleDecision::NoChange
        );
        assert_eq!(
            evaluate(&sample(0.0, 1, 0), &settings),
            ScaleDecision::NoChange
        );
    }

    #[test]
    fn test_between_thresholds_is_steady() {
        let settings = PoolSettings::default();
        assert_eq!(
            evaluate(&sample(1.0, 10, 0), &settings),
            ScaleDecision::NoChange
        );
        assert_eq!(
            evaluate(&sample(2.99, 10, 0), &settings),
            ScaleDecision::NoChange
        );
    }

    #[test]
    fn test_custom_thresholds() {
        let settings = PoolSettings {
            min_nodes: 1,
            scale_down_threshold: 2.0,
            scale_up_threshold: 10.0,
            ..PoolSettings::default()
        };
        assert_eq!(
            evaluate(&sample(1.5, 2, 0), &settings),
            ScaleDecision::RetireOne
        );
        assert_eq!(
            evaluate(&sample(9.0, 2, 0), &settings),
            ScaleDecision::NoChange
        );
        assert_eq!(
            evaluate(&sample(25.0, 2, 0), &settings),
            ScaleDecision::Spawn(2)
        );
    }

    #[test]
    fn test_sample_from_total() {
        assert_eq!(LoadSample::from_total(10, 0, 0), None);

        let s = LoadSample::from_total(21, 3, 1).unwrap();
        assert_eq!(s.average, 7.0);
        assert_eq!(s.active, 3);
        assert_eq!(s.starting, 1);
    }

    #[test]
    fn test_decision_serializes() {
        let json = serde_json::to_value(ScaleDecision::Spawn(2)).unwrap();
        assert_eq!(json["action"], "spawn");
        assert_eq!(json["count"], 2);

        let json = serde_json::to_value(ScaleDecision::NoChange).unwrap();
        assert_eq!(json["action"], "no_change");
    }
}
