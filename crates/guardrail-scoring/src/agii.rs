//! Autonomy Guardrail Integrity Index
//!
//! Rolling system-health score over the most recent executions plus live
//! signals from the scheduler and the remediation watchdog. Three dimensions
//! are scored 0–100 and combined by a fixed weighting:
//!
//! | Dimension | Inputs |
//! |---|---|
//! | Reliability | success ratio of the window |
//! | Observability | warning-flagged decisions, memory skips, p95 latency |
//! | Safeguards | watchdog mode, candidate interventions, recent run failures |
//!
//! Any dimension under the floor caps the status at amber, so one weak
//! dimension cannot hide behind two strong ones.

use crate::tes::TesCalculator;
use guardrail_core::{AgiiConfig, ExecutionRecord, TesConfig};
use serde::{Deserialize, Serialize};

/// Three-band status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandStatus {
    Green,
    Amber,
    Red,
}

impl std::fmt::Display for BandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Green => "green",
            Self::Amber => "amber",
            Self::Red => "red",
        })
    }
}

/// Mode of the automated remediation watchdog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogMode {
    /// Remediations are applied
    #[default]
    Enforcing,
    /// Remediations are proposed only
    Observing,
    Disabled,
}

/// Live, non-log inputs to AGII
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LiveSignals {
    /// Scheduler decisions flagged as warnings
    pub warning_decisions: u64,
    /// All scheduler decisions
    pub total_decisions: u64,
    /// Gate checks skipped for memory pressure
    pub memory_skips: u64,
    /// All scheduler gate checks
    pub scheduler_ticks: u64,
    pub watchdog_mode: WatchdogMode,
    /// Interventions the watchdog wants to make
    pub candidate_interventions: u32,
    /// Recent failed runs reported by the watchdog
    pub recent_run_failures: u32,
}

/// Scored dimensions plus the combined result
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgiiScorecard {
    pub reliability: f64,
    pub observability: f64,
    pub safeguards: f64,
    pub overall: f64,
    pub status: BandStatus,
    /// The dimension floor downgraded the status
    pub override_applied: bool,
    /// Records the window contained
    pub window_size: usize,
}

/// Computes AGII scorecards
#[derive(Debug, Clone, Default)]
pub struct AgiiCalculator {
    config: AgiiConfig,
    latency: TesCalculator,
}

impl AgiiCalculator {
    /// Calculator; the TES velocity curve doubles as the latency curve
    #[must_use]
    pub fn new(config: AgiiConfig, tes: TesConfig) -> Self {
        Self {
            config,
            latency: TesCalculator::new(tes),
        }
    }

    /// Window size this calculator expects
    #[inline]
    #[must_use]
    pub fn window(&self) -> usize {
        self.config.window
    }

    /// Score a window (only the most recent `window` records are used)
    #[must_use]
    pub fn score(&self, records: &[ExecutionRecord], signals: &LiveSignals) -> AgiiScorecard {
        let start = records.len().saturating_sub(self.config.window);
        let window = &records[start..];
        let reliability = reliability(window);
        let observability = self.observability(window, signals);
        let safeguards = safeguards(signals);
        let mut card = self.combine(reliability, observability, safeguards);
        card.window_size = window.len();
        card
    }

    /// Combine dimension scores into the weighted overall score and band
    #[must_use]
    pub fn combine(&self, reliability: f64, observability: f64, safeguards: f64) -> AgiiScorecard {
        let overall = (self.config.reliability_weight * reliability
            + self.config.observability_weight * observability
            + self.config.safeguards_weight * safeguards)
            .clamp(0.0, 100.0);

        let band = if overall >= self.config.green_threshold {
            BandStatus::Green
        } else if overall >= self.config.amber_threshold {
            BandStatus::Amber
        } else {
            BandStatus::Red
        };

        let weakest = reliability.min(observability).min(safeguards);
        let override_applied = weakest < self.config.dimension_floor && band == BandStatus::Green;
        let status = if override_applied {
            BandStatus::Amber
        } else {
            band
        };

        AgiiScorecard {
            reliability,
            observability,
            safeguards,
            overall,
            status,
            override_applied,
            window_size: 0,
        }
    }

    fn observability(&self, window: &[ExecutionRecord], signals: &LiveSignals) -> f64 {
        let warning_ratio = ratio(signals.warning_decisions, signals.total_decisions);
        let skip_ratio = ratio(signals.memory_skips, signals.scheduler_ticks);
        let latency_score = p95_duration(window).map_or(1.0, |p95| self.latency.velocity(p95));
        (100.0 * (0.4 * (1.0 - warning_ratio) + 0.3 * (1.0 - skip_ratio) + 0.3 * latency_score))
            .clamp(0.0, 100.0)
    }
}

/// Success ratio of the window, 100 when empty
#[must_use]
pub fn reliability(window: &[ExecutionRecord]) -> f64 {
    if window.is_empty() {
        return 100.0;
    }
    let ok = window.iter().filter(|r| r.succeeded()).count();
    #[allow(clippy::cast_precision_loss)]
    let score = 100.0 * ok as f64 / window.len() as f64;
    score
}

/// Safeguards dimension from watchdog signals
#[must_use]
pub fn safeguards(signals: &LiveSignals) -> f64 {
    let base = match signals.watchdog_mode {
        WatchdogMode::Enforcing => 100.0,
        WatchdogMode::Observing => 75.0,
        WatchdogMode::Disabled => 40.0,
    };
    let interventions = (5.0 * f64::from(signals.candidate_interventions)).min(30.0);
    let failures = (10.0 * f64::from(signals.recent_run_failures)).min(40.0);
    (base - interventions - failures).clamp(0.0, 100.0)
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let r = part as f64 / whole as f64;
    r.clamp(0.0, 1.0)
}

/// Nearest-rank 95th percentile of durations
fn p95_duration(window: &[ExecutionRecord]) -> Option<f64> {
    if window.is_empty() {
        return None;
    }
    let mut durations: Vec<f64> = window.iter().map(|r| r.duration_s).collect();
    durations.sort_by(f64::total_cmp);
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let rank = ((0.95 * durations.len() as f64).ceil() as usize).max(1);
    Some(durations[rank - 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use guardrail_core::{ExecutionMode, ExecutionStatus};
    use proptest::prelude::*;

    fn run(status: ExecutionStatus, secs: i64) -> ExecutionRecord {
        let start = Utc::now();
        ExecutionRecord::new(status, ExecutionMode::Apply, start, start + Duration::seconds(secs), 1)
    }

    #[test]
    fn weak_safeguards_force_amber() {
        let agii = AgiiCalculator::default();
        let card = agii.combine(100.0, 100.0, 65.0);
        // 0.5·100 + 0.25·100 + 0.25·65 = 91.25
        assert!(card.overall > 90.0);
        assert_eq!(card.status, BandStatus::Amber);
        assert!(card.override_applied);
    }

    #[test]
    fn bands() {
        let agii = AgiiCalculator::default();
        assert_eq!(agii.combine(95.0, 95.0, 95.0).status, BandStatus::Green);
        assert_eq!(agii.combine(80.0, 80.0, 80.0).status, BandStatus::Amber);
        assert_eq!(agii.combine(50.0, 60.0, 60.0).status, BandStatus::Red);
        assert!(!agii.combine(50.0, 60.0, 60.0).override_applied);
    }

    #[test]
    fn reliability_counts_successes() {
        let window = vec![
            run(ExecutionStatus::Completed, 10),
            run(ExecutionStatus::Failed, 10),
            run(ExecutionStatus::Completed, 10),
            run(ExecutionStatus::Error, 10),
        ];
        assert!((reliability(&window) - 50.0).abs() < 1e-9);
        assert!((reliability(&[]) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn only_recent_window_counts() {
        let agii = AgiiCalculator::new(
            AgiiConfig {
                window: 2,
                ..AgiiConfig::default()
            },
            TesConfig::default(),
        );
        let records = vec![
            run(ExecutionStatus::Failed, 10),
            run(ExecutionStatus::Completed, 10),
            run(ExecutionStatus::Completed, 10),
        ];
        let card = agii.score(&records, &LiveSignals::default());
        assert_eq!(card.window_size, 2);
        assert!((card.reliability - 100.0).abs() < 1e-9);
    }

    #[test]
    fn safeguards_penalties_are_capped() {
        let signals = LiveSignals {
            watchdog_mode: WatchdogMode::Enforcing,
            candidate_interventions: 100,
            recent_run_failures: 100,
            ..LiveSignals::default()
        };
        assert!((safeguards(&signals) - 30.0).abs() < 1e-9);
        let observing = LiveSignals {
            watchdog_mode: WatchdogMode::Observing,
            ..LiveSignals::default()
        };
        assert!((safeguards(&observing) - 75.0).abs() < 1e-9);
    }

    #[test]
    fn slow_tail_hurts_observability() {
        let agii = AgiiCalculator::default();
        let fast: Vec<_> = (0..20).map(|_| run(ExecutionStatus::Completed, 30)).collect();
        let slow: Vec<_> = (0..20).map(|_| run(ExecutionStatus::Completed, 900)).collect();
        let signals = LiveSignals::default();
        let fast_card = agii.score(&fast, &signals);
        let slow_card = agii.score(&slow, &signals);
        assert!((fast_card.observability - 100.0).abs() < 1e-9);
        assert!((slow_card.observability - 70.0).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn prop_floor_never_leaves_green(r in 0.0f64..=100.0, o in 0.0f64..=100.0, s in 0.0f64..=100.0) {
            let agii = AgiiCalculator::default();
            let card = agii.combine(r, o, s);
            if r.min(o).min(s) < 70.0 {
                prop_assert_ne!(card.status, BandStatus::Green);
            }
            prop_assert!((0.0..=100.0).contains(&card.overall));
        }
    }
}
