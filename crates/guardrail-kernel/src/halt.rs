//! Auto-halt monitor
//!
//! Evaluates live health of a rollout against [`HaltThresholds`]. Four
//! independent metrics are checked; any single one at its halt level halts
//! the rollout.
//!
//! | Metric | Warn | Halt |
//! |---|---|---|
//! | TES change vs pre-rollout baseline | below -2% | below -5% |
//! | Error rate | above 1% | above 2% |
//! | CPU load (% of nominal) | above 110% | above 120% |
//! | Memory | above 90% | above 95% |

use chrono::{DateTime, Utc};
use guardrail_core::{HaltThresholds, LeaseId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One live observation of a rollout
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthSample {
    /// Current TES mean of the changed system
    pub tes: f64,
    pub error_rate_pct: f64,
    /// CPU load as a percentage of nominal
    pub cpu_load_pct: f64,
    pub memory_pct: f64,
    pub observed_at: DateTime<Utc>,
}

/// Provides live health for a rollout
pub trait HealthSource: Send + Sync + fmt::Debug {
    /// Most recent sample, `None` if nothing was observed yet
    fn sample(&self, lease_id: LeaseId) -> Option<HealthSample>;
}

/// Checked metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    TesDelta,
    ErrorRate,
    CpuLoad,
    Memory,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TesDelta => "tes_delta",
            Self::ErrorRate => "error_rate",
            Self::CpuLoad => "cpu_load",
            Self::Memory => "memory",
        })
    }
}

/// Severity of a reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Nominal,
    Warning,
    Halt,
}

/// One metric compared to its thresholds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub metric: Metric,
    pub value: f64,
    pub warn_at: f64,
    pub halt_at: f64,
    pub level: Level,
}

/// Outcome of one evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthEvaluation {
    pub baseline_tes: f64,
    pub sample: HealthSample,
    pub readings: Vec<Reading>,
    /// Worst level among the readings
    pub level: Level,
}

impl HealthEvaluation {
    /// Whether any metric reached its halt level
    #[inline]
    #[must_use]
    pub fn should_halt(&self) -> bool {
        self.level == Level::Halt
    }

    /// Readings at halt level
    #[must_use]
    pub fn breaches(&self) -> Vec<Reading> {
        self.at(Level::Halt)
    }

    /// Readings at warning level
    #[must_use]
    pub fn warnings(&self) -> Vec<Reading> {
        self.at(Level::Warning)
    }

    fn at(&self, level: Level) -> Vec<Reading> {
        self.readings.iter().filter(|r| r.level == level).copied().collect()
    }
}

/// Who halted a rollout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltSource {
    AutoHalt,
    Operator,
}

/// Why a rollout was halted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaltReason {
    pub source: HaltSource,
    /// Metrics that crossed their halt threshold
    #[serde(default)]
    pub breaches: Vec<Reading>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl HaltReason {
    /// Automatic halt from an evaluation
    #[must_use]
    pub fn auto(evaluation: &HealthEvaluation) -> Self {
        Self {
            source: HaltSource::AutoHalt,
            breaches: evaluation.breaches(),
            note: None,
        }
    }

    /// Operator-initiated halt
    #[must_use]
    pub fn operator(note: impl Into<String>) -> Self {
        Self {
            source: HaltSource::Operator,
            breaches: Vec::new(),
            note: Some(note.into()),
        }
    }
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source {
            HaltSource::AutoHalt => {
                let metrics: Vec<String> = self
                    .breaches
                    .iter()
                    .map(|r| format!("{}={:.2}", r.metric, r.value))
                    .collect();
                write!(f, "auto-halt: {}", metrics.join(", "))
            }
            HaltSource::Operator => write!(
                f,
                "operator: {}",
                self.note.as_deref().unwrap_or("no reason given")
            ),
        }
    }
}

/// Compares samples against the configured thresholds
#[derive(Debug, Clone, Default)]
pub struct AutoHaltMonitor {
    thresholds: HaltThresholds,
}

impl AutoHaltMonitor {
    #[must_use]
    pub fn new(thresholds: HaltThresholds) -> Self {
        Self { thresholds }
    }

    /// Evaluate a sample against the rollout's pre-rollout TES baseline
    #[must_use]
    pub fn evaluate(&self, baseline_tes: f64, sample: &HealthSample) -> HealthEvaluation {
        let t = &self.thresholds;
        let readings = vec![
            falling(
                Metric::TesDelta,
                tes_delta_pct(baseline_tes, sample.tes),
                t.tes_delta_warn_pct,
                t.tes_delta_halt_pct,
            ),
            rising(
                Metric::ErrorRate,
                sample.error_rate_pct,
                t.error_rate_warn_pct,
                t.error_rate_halt_pct,
            ),
            rising(Metric::CpuLoad, sample.cpu_load_pct, t.cpu_warn_pct, t.cpu_halt_pct),
            rising(Metric::Memory, sample.memory_pct, t.memory_warn_pct, t.memory_halt_pct),
        ];
        let level = readings
            .iter()
            .map(|r| r.level)
            .max()
            .unwrap_or(Level::Nominal);
        HealthEvaluation {
            baseline_tes,
            sample: *sample,
            readings,
            level,
        }
    }
}

/// Percent change of `current` relative to `baseline`
#[must_use]
pub fn tes_delta_pct(baseline: f64, current: f64) -> f64 {
    if baseline <= 0.0 {
        return 0.0;
    }
    (current - baseline) / baseline * 100.0
}

/// Higher is worse
fn rising(metric: Metric, value: f64, warn_at: f64, halt_at: f64) -> Reading {
    let level = if value > halt_at {
        Level::Halt
    } else if value > warn_at {
        Level::Warning
    } else {
        Level::Nominal
    };
    Reading {
        metric,
        value,
        warn_at,
        halt_at,
        level,
    }
}

/// Lower is worse
fn falling(metric: Metric, value: f64, warn_at: f64, halt_at: f64) -> Reading {
    let level = if value < halt_at {
        Level::Halt
    } else if value < warn_at {
        Level::Warning
    } else {
        Level::Nominal
    };
    Reading {
        metric,
        value,
        warn_at,
        halt_at,
        level,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn healthy() -> HealthSample {
        HealthSample {
            tes: 90.0,
            error_rate_pct: 0.1,
            cpu_load_pct: 95.0,
            memory_pct: 60.0,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn healthy_sample_is_nominal() {
        let eval = AutoHaltMonitor::default().evaluate(90.0, &healthy());
        assert_eq!(eval.level, Level::Nominal);
        assert!(eval.breaches().is_empty());
    }

    #[test]
    fn single_metric_halts() {
        let monitor = AutoHaltMonitor::default();
        let eval = monitor.evaluate(
            90.0,
            &HealthSample {
                error_rate_pct: 2.5,
                ..healthy()
            },
        );
        assert!(eval.should_halt());
        assert_eq!(eval.breaches().len(), 1);
        assert_eq!(eval.breaches()[0].metric, Metric::ErrorRate);
        assert!(HaltReason::auto(&eval).to_string().contains("error_rate=2.50"));
    }

    #[test]
    fn tes_drop_warns_then_halts() {
        let monitor = AutoHaltMonitor::default();
        let warn = monitor.evaluate(100.0, &HealthSample { tes: 97.0, ..healthy() });
        assert_eq!(warn.level, Level::Warning);
        assert_eq!(warn.warnings()[0].metric, Metric::TesDelta);
        let halt = monitor.evaluate(100.0, &HealthSample { tes: 94.0, ..healthy() });
        assert!(halt.should_halt());
    }

    #[test]
    fn thresholds_are_exclusive() {
        let monitor = AutoHaltMonitor::default();
        let at_limit = HealthSample {
            error_rate_pct: 2.0,
            cpu_load_pct: 120.0,
            memory_pct: 95.0,
            ..healthy()
        };
        assert!(!monitor.evaluate(90.0, &at_limit).should_halt());
    }

    fn metric_value() -> impl Strategy<Value = (f64, bool)> {
        prop_oneof![(0.0f64..1.9).prop_map(|v| (v, false)), (2.01f64..50.0).prop_map(|v| (v, true))]
    }

    proptest! {
        #[test]
        fn prop_halt_is_or_of_breaches(
            (err, err_halts) in metric_value(),
            cpu in prop_oneof![(50.0f64..119.0).prop_map(|v| (v, false)), (120.5f64..300.0).prop_map(|v| (v, true))],
            mem in prop_oneof![(10.0f64..94.0).prop_map(|v| (v, false)), (95.5f64..100.0).prop_map(|v| (v, true))],
            tes in prop_oneof![(95.5f64..120.0).prop_map(|v| (v, false)), (0.0f64..94.0).prop_map(|v| (v, true))],
        ) {
            let sample = HealthSample {
                tes: tes.0,
                error_rate_pct: err,
                cpu_load_pct: cpu.0,
                memory_pct: mem.0,
                observed_at: Utc::now(),
            };
            let eval = AutoHaltMonitor::default().evaluate(100.0, &sample);
            let expected = err_halts || cpu.1 || mem.1 || tes.1;
            prop_assert_eq!(eval.should_halt(), expected);
            prop_assert_eq!(
                eval.breaches().len(),
                [err_halts, cpu.1, mem.1, tes.1].iter().filter(|b| **b).count()
            );
        }
    }
}
