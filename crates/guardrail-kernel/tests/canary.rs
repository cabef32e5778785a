//! Canary tiers, observation windows, pause and auto-halt

use guardrail_core::{ExecutionStatus, GuardrailConfig, GuardrailError, RolloutError, Tier};
use guardrail_kernel::audit::AuditAction;
use guardrail_kernel::halt::{HaltSource, HealthSample, Level, Metric};
use guardrail_scoring::BandStatus;
use guardrail_test_utils::{healthy_sample, record, TestHarness};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

fn degraded(tes: f64) -> HealthSample {
    HealthSample {
        tes,
        ..healthy_sample(tes)
    }
}

/// Slow failed runs: TES about 15.6 each
fn failing_runs(h: &TestHarness, count: i64) {
    let start = chrono::Utc::now();
    for offset in 0..count {
        let run = record(ExecutionStatus::Failed, start + chrono::Duration::minutes(offset), 3_000, 3);
        h.pipeline.record_execution(run).unwrap();
    }
}

#[tokio::test]
async fn promotion_waits_for_observation_window() {
    let h = TestHarness::new();
    let lease_id = h.started_rollout();
    let canary = h.pipeline.canary();

    h.advance_secs(599);
    let err = canary.approve_next_tier(lease_id).await.unwrap_err();
    assert!(matches!(
        err,
        GuardrailError::Rollout(RolloutError::ObservationPending { remaining_secs: 1 })
    ));
    assert_eq!(canary.state(lease_id).unwrap().tier, Tier::Tier5);

    h.advance_secs(1);
    assert_eq!(canary.approve_next_tier(lease_id).await.unwrap().tier, Tier::Tier25);
}

#[tokio::test]
async fn paused_rollout_does_not_promote() {
    let h = TestHarness::new();
    let lease_id = h.started_rollout();
    let canary = h.pipeline.canary();

    assert!(canary.pause(lease_id).unwrap().paused);
    h.advance_secs(600);
    let err = canary.approve_next_tier(lease_id).await.unwrap_err();
    assert_eq!(err.kind(), "paused");
    assert!(canary.promote_ready().await.is_empty());

    assert!(!canary.resume(lease_id).unwrap().paused);
    assert_eq!(canary.approve_next_tier(lease_id).await.unwrap().tier, Tier::Tier25);
}

#[tokio::test]
async fn missing_health_sample_refuses_promotion() {
    let h = TestHarness::new();
    let lease_id = h.started_rollout();
    h.health.clear(lease_id);
    h.advance_secs(600);

    let err = h.pipeline.canary().approve_next_tier(lease_id).await.unwrap_err();
    assert_eq!(err.kind(), "no_health_data");
    assert_eq!(h.pipeline.canary().state(lease_id).unwrap().tier, Tier::Tier5);
}

#[test]
fn breach_halts_on_evaluation() {
    let h = TestHarness::new();
    let lease_id = h.started_rollout();
    let canary = h.pipeline.canary();

    // Baseline 90, 85 is a 5.6% drop
    h.health.set(lease_id, degraded(85.0));
    let evaluation = canary.evaluate(lease_id).unwrap().unwrap();
    assert_eq!(evaluation.level, Level::Halt);

    let state = canary.state(lease_id).unwrap();
    assert_eq!(state.tier, Tier::Halted);
    let reason = state.halt_reason.unwrap();
    assert_eq!(reason.source, HaltSource::AutoHalt);
    assert_eq!(h.target.traffic(lease_id), 5);
    assert_eq!(canary.active().len(), 1);

    let halted = h
        .pipeline
        .audit()
        .for_subject(&lease_id.to_string())
        .into_iter()
        .filter(|r| matches!(r.action, AuditAction::RolloutHalted { .. }))
        .count();
    assert_eq!(halted, 1);

    // Halted rollouts are not live
    assert!(canary.evaluate(lease_id).unwrap().is_none());
}

#[test]
fn warning_leaves_rollout_running() {
    let h = TestHarness::new();
    let lease_id = h.started_rollout();
    let canary = h.pipeline.canary();

    h.health.set(lease_id, degraded(87.5));
    let evaluation = canary.evaluate(lease_id).unwrap().unwrap();
    assert_eq!(evaluation.level, Level::Warning);
    assert_eq!(canary.state(lease_id).unwrap().tier, Tier::Tier5);
    assert_eq!(canary.degraded_count(), 1);
}

#[tokio::test]
async fn breach_during_promotion_halts_instead() {
    let h = TestHarness::new();
    let lease_id = h.started_rollout();
    h.advance_secs(600);
    h.health.set(lease_id, HealthSample {
        error_rate_pct: 2.5,
        ..healthy_sample(90.0)
    });

    let state = h.pipeline.canary().approve_next_tier(lease_id).await.unwrap();
    assert_eq!(state.tier, Tier::Halted);
    assert_eq!(h.target.traffic(lease_id), 5);
}

#[tokio::test]
async fn breach_without_auto_halt_is_refused() {
    let mut config = GuardrailConfig::default();
    config.canary.auto_halt = false;
    let h = TestHarness::with_config(config);
    let lease_id = h.started_rollout();
    h.advance_secs(600);
    h.health.set(lease_id, degraded(50.0));

    let canary = h.pipeline.canary();
    assert_eq!(canary.evaluate(lease_id).unwrap().unwrap().level, Level::Halt);
    assert_eq!(canary.state(lease_id).unwrap().tier, Tier::Tier5);

    let err = canary.approve_next_tier(lease_id).await.unwrap_err();
    assert_eq!(err.kind(), "health_breach");
}

#[tokio::test]
async fn halt_abandons_waiting_promotion() {
    let h = TestHarness::new();
    let lease_id = h.started_rollout();
    let canary = Arc::clone(h.pipeline.canary());

    let waiting = {
        let canary = Arc::clone(&canary);
        tokio::spawn(async move { canary.promote_when_ready(lease_id).await })
    };
    // Let the task reach its wait
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.health.set(lease_id, degraded(60.0));
    canary.evaluate(lease_id).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .expect("promotion still waiting")
        .unwrap();
    assert!(matches!(
        result,
        Err(GuardrailError::Rollout(RolloutError::PromotionAbandoned(id))) if id == lease_id
    ));
    assert_eq!(canary.state(lease_id).unwrap().tier, Tier::Halted);
}

#[tokio::test]
async fn completed_rollout_cannot_be_promoted_or_paused() {
    let h = TestHarness::new();
    let lease_id = h.started_rollout();
    let canary = h.pipeline.canary();
    for secs in [600, 900, 1_800] {
        h.advance_secs(secs);
        canary.approve_next_tier(lease_id).await.unwrap();
    }

    let err = canary.approve_next_tier(lease_id).await.unwrap_err();
    assert_eq!(err.kind(), "illegal_transition");
    assert_eq!(canary.pause(lease_id).unwrap_err().kind(), "illegal_transition");
}

#[test]
fn second_start_is_refused() {
    let h = TestHarness::new();
    let lease_id = h.started_rollout();
    let err = h.pipeline.canary().start(lease_id).unwrap_err();
    assert_eq!(err.kind(), "already_started");
}

#[tokio::test]
async fn auto_promote_advances_ready_rollouts() {
    let h = TestHarness::new();
    let ready = h.started_rollout();
    h.advance_secs(300);
    let fresh = h.started_rollout();
    h.advance_secs(300);

    let promoted = h.pipeline.canary().promote_ready().await;
    assert_eq!(promoted.len(), 1);
    assert_eq!(promoted[0].lease_id, ready);
    assert_eq!(h.pipeline.canary().state(fresh).unwrap().tier, Tier::Tier5);
}

#[tokio::test]
async fn collapsing_execution_log_halts_promotion() {
    let h = TestHarness::new();
    let lease_id = h.started_rollout();
    let baseline = h.pipeline.canary().state(lease_id).unwrap().baseline_tes;
    assert!((baseline - 90.0).abs() < 1e-9);

    // The sampled TES stays at the baseline; only the log degrades
    failing_runs(&h, 50);
    h.advance_secs(600);
    let state = h.pipeline.canary().approve_next_tier(lease_id).await.unwrap();
    assert_eq!(state.tier, Tier::Halted);
    assert_eq!(h.target.traffic(lease_id), 5);

    let reason = state.halt_reason.unwrap();
    assert_eq!(reason.source, HaltSource::AutoHalt);
    assert!(reason.breaches.iter().any(|r| r.metric == Metric::TesDelta));
}

#[test]
fn periodic_evaluation_scores_the_log() {
    let h = TestHarness::new();
    let lease_id = h.started_rollout();
    failing_runs(&h, 5);

    let evaluation = h.pipeline.canary().evaluate(lease_id).unwrap().unwrap();
    assert_eq!(evaluation.level, Level::Halt);
    assert_eq!(h.pipeline.canary().state(lease_id).unwrap().tier, Tier::Halted);
}

#[tokio::test]
async fn red_agii_refuses_promotion() {
    let h = TestHarness::new();
    // Recorded before the rollout starts, so they set the baseline too
    failing_runs(&h, 50);
    let lease_id = h.started_rollout();
    assert_eq!(h.pipeline.score_snapshot().agii.status, BandStatus::Red);

    h.advance_secs(600);
    let err = h.pipeline.canary().approve_next_tier(lease_id).await.unwrap_err();
    assert!(matches!(
        err,
        GuardrailError::Rollout(RolloutError::GovernanceRed(id)) if id == lease_id
    ));
    let state = h.pipeline.canary().state(lease_id).unwrap();
    assert_eq!(state.tier, Tier::Tier5);
    assert_eq!(state.last_health.unwrap().level, Level::Nominal);
    assert_eq!(h.target.traffic(lease_id), 5);
}
