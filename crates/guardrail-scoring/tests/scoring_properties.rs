//! Boundary and override properties of the scoring engines.

use chrono::{Duration, Utc};
use guardrail_core::{ExecutionMode, ExecutionRecord, ExecutionStatus, GuardrailConfig};
use guardrail_scoring::{BandStatus, ExecutionLog, LiveSignals, ScoreReport, ScoringEngine};
use pretty_assertions::assert_eq;

fn completed(secs: i64, files: u32) -> ExecutionRecord {
    let start = Utc::now();
    ExecutionRecord::new(
        ExecutionStatus::Completed,
        ExecutionMode::Apply,
        start,
        start + Duration::seconds(secs),
        files,
    )
}

/// Velocity and footprint hit their stated endpoints exactly at the breakpoints.
#[test]
fn tes_boundary_values() {
    let engine = ScoringEngine::new(&GuardrailConfig::default().scoring);
    let tes = engine.tes();

    assert_eq!(tes.velocity(90.0), 1.0);
    assert_eq!(tes.velocity(900.0), 0.0);
    assert!((tes.velocity(495.0) - 0.5).abs() < 1e-12);
    assert_eq!(tes.footprint(1), 1.0);
    assert_eq!(tes.footprint(10), 0.0);

    let at_breakpoints = engine.score_execution(&completed(90, 1));
    assert!((at_breakpoints.score - 100.0).abs() < 1e-9);
}

/// A single weak dimension downgrades an otherwise green index.
#[test]
fn agii_override_caps_at_amber() {
    let engine = ScoringEngine::default();
    let card = engine.agii().combine(100.0, 100.0, 65.0);
    assert!(card.overall > 90.0);
    assert_eq!(card.status, BandStatus::Amber);
}

/// The report carries the snapshot it was built from.
#[test]
fn report_mirrors_snapshot() {
    let engine = ScoringEngine::default();
    let log = ExecutionLog::new();
    for files in 1..=3 {
        log.append(completed(30, files)).unwrap();
    }
    let snapshot = engine.snapshot(&log, &LiveSignals::default());
    let report = ScoreReport::from_snapshot(&snapshot, engine.history().len());

    assert_eq!(report.log_through, Some(2));
    assert_eq!(report.tes.count, 3);
    let json = report.to_json().unwrap();
    assert!(json.contains("\"agii\""));
    assert!(json.contains("\"status\": \"green\""));
}
