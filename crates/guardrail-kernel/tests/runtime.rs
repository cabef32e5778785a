//! Control loops against a live pipeline

use guardrail_core::{GuardrailConfig, Tier};
use guardrail_kernel::halt::HealthSample;
use guardrail_kernel::runtime::{sweep_health, HealthSweep, Runtime, CANARY_LOOP, HALT_LOOP, SCHEDULER_LOOP};
use guardrail_test_utils::{healthy_sample, TestHarness};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

fn fast_loops() -> GuardrailConfig {
    let mut config = GuardrailConfig::default();
    config.loops.scheduler_tick_ms = 10;
    config.loops.canary_check_ms = 10;
    config.loops.halt_eval_ms = 10;
    config.canary.auto_promote = true;
    config
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn loops_beat_launch_and_promote() {
    let h = TestHarness::with_config(fast_loops());
    let lease_id = h.started_rollout();
    h.advance_secs(600);

    let runtime = Runtime::start(Arc::clone(&h.pipeline));
    let canary = Arc::clone(h.pipeline.canary());
    eventually("promotion", || {
        canary.state(lease_id).is_ok_and(|s| s.tier == Tier::Tier25)
    })
    .await;
    eventually("a launch", || !h.launcher.tickets().is_empty()).await;

    let heartbeats = Arc::clone(h.pipeline.heartbeats());
    eventually("heartbeats", || heartbeats.snapshot().len() == 3).await;
    let ids: Vec<String> = heartbeats.snapshot().into_iter().map(|b| b.id).collect();
    assert_eq!(ids, vec![HALT_LOOP, CANARY_LOOP, SCHEDULER_LOOP]);
    assert!(heartbeats.stale().is_empty());

    // The scheduler interval has not elapsed on the pipeline clock
    assert_eq!(h.launcher.tickets().len(), 1);
    assert_eq!(h.pipeline.log().len(), 1);

    tokio::time::timeout(Duration::from_secs(5), runtime.shutdown())
        .await
        .expect("loops did not stop");
}

#[tokio::test]
async fn halt_loop_stops_a_breaching_rollout() {
    let h = TestHarness::with_config(fast_loops());
    let lease_id = h.started_rollout();
    let runtime = Runtime::start(Arc::clone(&h.pipeline));

    h.health.set(lease_id, HealthSample {
        cpu_load_pct: 130.0,
        ..healthy_sample(90.0)
    });
    let canary = Arc::clone(h.pipeline.canary());
    eventually("auto-halt", || {
        canary.state(lease_id).is_ok_and(|s| s.tier == Tier::Halted)
    })
    .await;

    runtime.shutdown().await;
    assert!(h.pipeline.heartbeats().snapshot().iter().all(|b| b.beats >= 1));
}

#[test]
fn health_sweep_reports_breaches() {
    let h = TestHarness::new();
    let steady = h.started_rollout();
    let failing = h.started_rollout();
    h.health.set(failing, HealthSample {
        cpu_load_pct: 130.0,
        ..healthy_sample(90.0)
    });

    let sweep = sweep_health(&h.pipeline);
    assert_eq!(sweep, HealthSweep {
        evaluated: 2,
        breaching: 1
    });
    let canary = h.pipeline.canary();
    assert_eq!(canary.state(failing).unwrap().tier, Tier::Halted);
    assert_eq!(canary.state(steady).unwrap().tier, Tier::Tier5);

    // Halted rollouts are no longer swept
    assert_eq!(sweep_health(&h.pipeline), HealthSweep {
        evaluated: 1,
        breaching: 0
    });
}
