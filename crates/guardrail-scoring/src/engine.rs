//! Scoring engine and snapshot history
//!
//! [`ScoringEngine::snapshot`] reads one consistent window from the
//! execution log, scores it, and appends the resulting [`ScoreSnapshot`] to
//! an append-only [`ScoreHistory`]. Superseded snapshots stay in the history.

use crate::agii::{AgiiCalculator, AgiiScorecard, LiveSignals};
use crate::log::{ExecutionLog, LogWindow};
use crate::tes::{TesBreakdown, TesCalculator, TesScore};
use chrono::{DateTime, Utc};
use guardrail_core::{ExecutionRecord, ScoringConfig};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// TES statistics over a window
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TesWindowStats {
    pub count: usize,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub latest: Option<f64>,
    /// Mean of each component
    pub breakdown: Option<TesBreakdown>,
}

/// Point-in-time score derived from committed records only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreSnapshot {
    /// Position in the score history
    pub sequence: u64,
    pub computed_at: DateTime<Utc>,
    /// Highest execution-log sequence included
    pub log_through: Option<u64>,
    pub tes: TesWindowStats,
    pub agii: AgiiScorecard,
}

/// Append-only snapshot history
#[derive(Debug, Default)]
pub struct ScoreHistory {
    snapshots: RwLock<Vec<Arc<ScoreSnapshot>>>,
}

impl ScoreHistory {
    /// Empty history
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, build: impl FnOnce(u64) -> ScoreSnapshot) -> Arc<ScoreSnapshot> {
        let mut snapshots = self.snapshots.write();
        let snapshot = Arc::new(build(snapshots.len() as u64));
        snapshots.push(Arc::clone(&snapshot));
        snapshot
    }

    /// Newest snapshot
    #[must_use]
    pub fn latest(&self) -> Option<Arc<ScoreSnapshot>> {
        self.snapshots.read().last().cloned()
    }

    /// All snapshots, oldest first
    #[must_use]
    pub fn all(&self) -> Vec<Arc<ScoreSnapshot>> {
        self.snapshots.read().clone()
    }

    /// Number of snapshots taken
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.read().len()
    }

    /// Whether no snapshot was taken yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.read().is_empty()
    }
}

/// Pure scoring over execution records
#[derive(Debug, Default)]
pub struct ScoringEngine {
    tes: TesCalculator,
    agii: AgiiCalculator,
    history: ScoreHistory,
}

impl ScoringEngine {
    /// Engine with the given thresholds
    #[must_use]
    pub fn new(config: &ScoringConfig) -> Self {
        Self {
            tes: TesCalculator::new(config.tes.clone()),
            agii: AgiiCalculator::new(config.agii.clone(), config.tes.clone()),
            history: ScoreHistory::new(),
        }
    }

    /// TES calculator
    #[inline]
    #[must_use]
    pub fn tes(&self) -> &TesCalculator {
        &self.tes
    }

    /// AGII calculator
    #[inline]
    #[must_use]
    pub fn agii(&self) -> &AgiiCalculator {
        &self.agii
    }

    /// Snapshot history
    #[inline]
    #[must_use]
    pub fn history(&self) -> &ScoreHistory {
        &self.history
    }

    /// TES of one record
    #[must_use]
    pub fn score_execution(&self, record: &ExecutionRecord) -> TesScore {
        self.tes.score(record)
    }

    /// TES statistics of a set of records (oldest first)
    #[must_use]
    pub fn tes_stats(&self, records: &[ExecutionRecord]) -> TesWindowStats {
        if records.is_empty() {
            return TesWindowStats::default();
        }
        let scores: Vec<TesScore> = records.iter().map(|r| self.tes.score(r)).collect();
        #[allow(clippy::cast_precision_loss)]
        let n = scores.len() as f64;
        let mean = scores.iter().map(|s| s.score).sum::<f64>() / n;
        let min = scores.iter().map(|s| s.score).fold(f64::INFINITY, f64::min);
        let max = scores.iter().map(|s| s.score).fold(f64::NEG_INFINITY, f64::max);
        let breakdown = TesBreakdown {
            stability: scores.iter().map(|s| s.breakdown.stability).sum::<f64>() / n,
            velocity: scores.iter().map(|s| s.breakdown.velocity).sum::<f64>() / n,
            footprint: scores.iter().map(|s| s.breakdown.footprint).sum::<f64>() / n,
        };
        TesWindowStats {
            count: scores.len(),
            mean: Some(mean),
            min: Some(min),
            max: Some(max),
            latest: scores.last().map(|s| s.score),
            breakdown: Some(breakdown),
        }
    }

    /// Mean TES of the `n` most recent committed records
    #[must_use]
    pub fn tes_mean(&self, log: &ExecutionLog, n: usize) -> Option<f64> {
        self.tes_stats(&log.window(n).records).mean
    }

    /// Score an already-read window without recording it
    #[must_use]
    pub fn evaluate(&self, window: &LogWindow, signals: &LiveSignals) -> (TesWindowStats, AgiiScorecard) {
        (
            self.tes_stats(&window.records),
            self.agii.score(&window.records, signals),
        )
    }

    /// Read one window, score it, and append the snapshot to the history
    pub fn snapshot(&self, log: &ExecutionLog, signals: &LiveSignals) -> Arc<ScoreSnapshot> {
        let window = log.window(self.agii.window());
        let (tes, agii) = self.evaluate(&window, signals);
        let snapshot = self.history.push(|sequence| ScoreSnapshot {
            sequence,
            computed_at: Utc::now(),
            log_through: window.through_sequence,
            tes,
            agii,
        });
        tracing::info!(
            sequence = snapshot.sequence,
            agii = snapshot.agii.overall,
            status = %snapshot.agii.status,
            "score snapshot recorded"
        );
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agii::BandStatus;
    use chrono::Duration;
    use guardrail_core::{ExecutionMode, ExecutionStatus};

    fn record(status: ExecutionStatus, secs: i64, files: u32) -> ExecutionRecord {
        let start = Utc::now();
        ExecutionRecord::new(status, ExecutionMode::Apply, start, start + Duration::seconds(secs), files)
    }

    #[test]
    fn snapshots_accumulate() {
        let engine = ScoringEngine::default();
        let log = ExecutionLog::new();
        log.append(record(ExecutionStatus::Completed, 30, 1)).unwrap();
        let first = engine.snapshot(&log, &LiveSignals::default());
        log.append(record(ExecutionStatus::Failed, 30, 1)).unwrap();
        let second = engine.snapshot(&log, &LiveSignals::default());

        assert_eq!(engine.history().len(), 2);
        assert_eq!(first.log_through, Some(0));
        assert_eq!(second.log_through, Some(1));
        // the first snapshot is retained untouched
        assert_eq!(engine.history().all()[0].tes.count, 1);
        assert_eq!(second.tes.count, 2);
    }

    #[test]
    fn empty_log_is_green() {
        let engine = ScoringEngine::default();
        let snapshot = engine.snapshot(&ExecutionLog::new(), &LiveSignals::default());
        assert_eq!(snapshot.tes.count, 0);
        assert!(snapshot.tes.mean.is_none());
        assert_eq!(snapshot.agii.status, BandStatus::Green);
    }

    #[test]
    fn tes_stats_mean_and_bounds() {
        let engine = ScoringEngine::default();
        let records = vec![
            record(ExecutionStatus::Completed, 30, 1),  // 100
            record(ExecutionStatus::Completed, 495, 10), // 65
        ];
        let stats = engine.tes_stats(&records);
        assert_eq!(stats.count, 2);
        assert!((stats.mean.unwrap() - 82.5).abs() < 1e-6);
        assert!((stats.min.unwrap() - 65.0).abs() < 1e-6);
        assert!((stats.max.unwrap() - 100.0).abs() < 1e-6);
        assert!((stats.latest.unwrap() - 65.0).abs() < 1e-6);
    }
}
