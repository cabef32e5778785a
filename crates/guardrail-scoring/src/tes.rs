//! Task Execution Score
//!
//! `TES = 100 × (0.5·Stability + 0.3·Velocity + 0.2·Footprint)`, computed per
//! execution record. Each component lies in `[0, 1]`; breakpoints and weights
//! come from [`TesConfig`].

use guardrail_core::{
    ExecutionId, ExecutionMode, ExecutionRecord, ExecutionStatus, FailureSignal, TesConfig,
};
use serde::{Deserialize, Serialize};

/// The three TES components of one execution
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TesBreakdown {
    pub stability: f64,
    pub velocity: f64,
    pub footprint: f64,
}

impl TesBreakdown {
    /// Component with the lowest value
    #[must_use]
    pub fn weakest(&self) -> TesComponent {
        let mut weakest = (TesComponent::Stability, self.stability);
        for candidate in [
            (TesComponent::Velocity, self.velocity),
            (TesComponent::Footprint, self.footprint),
        ] {
            if candidate.1 < weakest.1 {
                weakest = candidate;
            }
        }
        weakest.0
    }

    /// Smallest component value
    #[inline]
    #[must_use]
    pub fn min(&self) -> f64 {
        self.stability.min(self.velocity).min(self.footprint)
    }
}

/// Names of the TES components
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TesComponent {
    Stability,
    Velocity,
    Footprint,
}

/// TES of one execution
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TesScore {
    pub execution_id: ExecutionId,
    /// 0–100
    pub score: f64,
    pub breakdown: TesBreakdown,
}

/// Computes TES for execution records
#[derive(Debug, Clone, Default)]
pub struct TesCalculator {
    config: TesConfig,
}

impl TesCalculator {
    /// Calculator with the given breakpoints and weights
    #[must_use]
    pub fn new(config: TesConfig) -> Self {
        Self { config }
    }

    /// Active configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &TesConfig {
        &self.config
    }

    /// Score one record
    #[must_use]
    pub fn score(&self, record: &ExecutionRecord) -> TesScore {
        let breakdown = self.breakdown(record);
        let weighted = self.config.stability_weight * breakdown.stability
            + self.config.velocity_weight * breakdown.velocity
            + self.config.footprint_weight * breakdown.footprint;
        TesScore {
            execution_id: record.id,
            score: (100.0 * weighted).clamp(0.0, 100.0),
            breakdown,
        }
    }

    /// Component values of one record
    #[must_use]
    pub fn breakdown(&self, record: &ExecutionRecord) -> TesBreakdown {
        TesBreakdown {
            stability: stability(record),
            velocity: self.velocity(record.duration_s),
            footprint: self.footprint(record.files_changed),
        }
    }

    /// 1.0 at or below the fast breakpoint, 0.0 at or above the slow one
    #[must_use]
    pub fn velocity(&self, duration_s: f64) -> f64 {
        descending_ramp(
            duration_s,
            self.config.velocity_full_secs,
            self.config.velocity_zero_secs,
        )
    }

    /// 1.0 at or below the small-change breakpoint, 0.0 at or above the large one
    #[must_use]
    pub fn footprint(&self, files_changed: u32) -> f64 {
        descending_ramp(
            f64::from(files_changed),
            f64::from(self.config.footprint_full_files),
            f64::from(self.config.footprint_zero_files),
        )
    }
}

/// Stability component.
///
/// A destructive change only counts when the record ran in `apply` mode;
/// dry and test runs cannot have mutated anything.
#[must_use]
pub fn stability(record: &ExecutionRecord) -> f64 {
    match (record.status, record.failure_signal) {
        (ExecutionStatus::Completed, None) => 1.0,
        (
            _,
            Some(FailureSignal::ValidationFailed {
                destructive_applied,
            }),
        ) => {
            if destructive_applied && record.mode == ExecutionMode::Apply {
                0.2
            } else {
                0.6
            }
        }
        _ => 0.0,
    }
}

fn descending_ramp(value: f64, full_at: f64, zero_at: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    if value <= full_at {
        return 1.0;
    }
    if value >= zero_at {
        return 0.0;
    }
    (1.0 - (value - full_at) / (zero_at - full_at)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use proptest::prelude::*;

    fn record(status: ExecutionStatus, secs: i64, files: u32) -> ExecutionRecord {
        let start = Utc::now();
        ExecutionRecord::new(status, ExecutionMode::Apply, start, start + Duration::seconds(secs), files)
    }

    #[test]
    fn velocity_breakpoints() {
        let tes = TesCalculator::default();
        assert!((tes.velocity(90.0) - 1.0).abs() < 1e-9);
        assert!(tes.velocity(900.0).abs() < 1e-9);
        assert!((tes.velocity(495.0) - 0.5).abs() < 1e-9);
        assert!((tes.velocity(10.0) - 1.0).abs() < 1e-9);
        assert!(tes.velocity(5_000.0).abs() < 1e-9);
    }

    #[test]
    fn footprint_breakpoints() {
        let tes = TesCalculator::default();
        assert!((tes.footprint(0) - 1.0).abs() < 1e-9);
        assert!((tes.footprint(1) - 1.0).abs() < 1e-9);
        assert!(tes.footprint(10).abs() < 1e-9);
        assert!(tes.footprint(40).abs() < 1e-9);
        assert!((tes.footprint(4) - (1.0 - 3.0 / 9.0)).abs() < 1e-9);
    }

    #[test]
    fn stability_cases() {
        let clean = record(ExecutionStatus::Completed, 30, 1);
        assert!((stability(&clean) - 1.0).abs() < 1e-9);

        let soft = record(ExecutionStatus::Failed, 30, 1).with_failure_signal(
            FailureSignal::ValidationFailed {
                destructive_applied: false,
            },
        );
        assert!((stability(&soft) - 0.6).abs() < 1e-9);

        let destructive = record(ExecutionStatus::Failed, 30, 1).with_failure_signal(
            FailureSignal::ValidationFailed {
                destructive_applied: true,
            },
        );
        assert!((stability(&destructive) - 0.2).abs() < 1e-9);

        let crashed = record(ExecutionStatus::Error, 30, 1);
        assert!(stability(&crashed).abs() < 1e-9);
    }

    #[test]
    fn destructive_flag_ignored_outside_apply_mode() {
        let mut dry = record(ExecutionStatus::Failed, 30, 1).with_failure_signal(
            FailureSignal::ValidationFailed {
                destructive_applied: true,
            },
        );
        dry.mode = ExecutionMode::Dry;
        assert!((stability(&dry) - 0.6).abs() < 1e-9);
    }

    #[test]
    fn perfect_execution_scores_100() {
        let tes = TesCalculator::default();
        let score = tes.score(&record(ExecutionStatus::Completed, 60, 1));
        assert!((score.score - 100.0).abs() < 1e-9);
    }

    #[test]
    fn weighted_combination() {
        let tes = TesCalculator::default();
        // stability 1.0, velocity 0.5, footprint 0.0
        let score = tes.score(&record(ExecutionStatus::Completed, 495, 10));
        assert!((score.score - 65.0).abs() < 1e-6);
        assert_eq!(score.breakdown.weakest(), TesComponent::Footprint);
    }

    proptest! {
        #[test]
        fn prop_components_stay_in_unit_range(secs in 0i64..100_000, files in 0u32..1_000) {
            let tes = TesCalculator::default();
            let score = tes.score(&record(ExecutionStatus::Completed, secs, files));
            prop_assert!((0.0..=100.0).contains(&score.score));
            prop_assert!((0.0..=1.0).contains(&score.breakdown.velocity));
            prop_assert!((0.0..=1.0).contains(&score.breakdown.footprint));
        }

        #[test]
        fn prop_velocity_is_non_increasing(a in 0.0f64..2_000.0, b in 0.0f64..2_000.0) {
            let tes = TesCalculator::default();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(tes.velocity(lo) >= tes.velocity(hi));
        }
    }
}
