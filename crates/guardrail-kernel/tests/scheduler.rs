//! Scheduler decisions: soft limits, strategy, interval and memory backoff

use guardrail_core::{SchedulerConfig, SystemClock};
use guardrail_kernel::scheduler::{
    AdaptiveScheduler, SchedulerParts, SkipReason, Strategy, TickOutcome,
};
use guardrail_scoring::{ExecutionLog, LiveSignals, ScoringEngine, TesBreakdown};
use guardrail_test_utils::{FixedProbe, RecordingLauncher};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

fn scheduler(probe: Arc<FixedProbe>, launcher: Arc<RecordingLauncher>) -> AdaptiveScheduler {
    AdaptiveScheduler::new(
        SchedulerConfig::default(),
        SchedulerParts {
            log: Arc::new(ExecutionLog::new()),
            scoring: Arc::new(ScoringEngine::default()),
            probe,
            launcher,
            clock: Arc::new(SystemClock),
        },
    )
}

fn at_memory(pct: f64) -> AdaptiveScheduler {
    scheduler(Arc::new(FixedProbe::new(pct)), Arc::new(RecordingLauncher::default()))
}

fn breakdown(stability: f64, velocity: f64, footprint: f64) -> TesBreakdown {
    TesBreakdown {
        stability,
        velocity,
        footprint,
    }
}

#[test]
fn soft_limit_bands() {
    let s = at_memory(0.0);
    assert!((s.soft_limit(Some(85.0)) - 70.0).abs() < f64::EPSILON);
    assert!((s.soft_limit(Some(80.0)) - 75.0).abs() < f64::EPSILON);
    assert!((s.soft_limit(Some(60.0)) - 75.0).abs() < f64::EPSILON);
    assert!((s.soft_limit(Some(59.9)) - 78.0).abs() < f64::EPSILON);
    assert!((s.soft_limit(None) - 75.0).abs() < f64::EPSILON);
}

#[test]
fn strategy_targets_weakest_component() {
    let s = at_memory(0.0);
    assert_eq!(s.select_strategy(Some(&breakdown(0.9, 0.9, 0.85))), Strategy::Balanced);
    assert_eq!(
        s.select_strategy(Some(&breakdown(0.9, 0.5, 0.7))),
        Strategy::VelocityFocused
    );
    assert_eq!(
        s.select_strategy(Some(&breakdown(0.4, 0.9, 0.9))),
        Strategy::StabilityFocused
    );
    assert_eq!(s.select_strategy(None), Strategy::Balanced);
}

#[tokio::test]
async fn launch_then_interval_deferral() {
    let launcher = Arc::new(RecordingLauncher::default());
    let s = scheduler(Arc::new(FixedProbe::new(40.0)), Arc::clone(&launcher));
    let (_tx, mut rx) = watch::channel(false);

    let first = s.tick(&mut rx).await;
    assert!(matches!(first, TickOutcome::Launched { sequence: Some(0), .. }));
    let second = s.tick(&mut rx).await;
    assert!(matches!(
        second,
        TickOutcome::Deferred(SkipReason::IntervalNotElapsed { .. })
    ));
    assert_eq!(launcher.tickets().len(), 1);
    let stats = s.stats();
    assert_eq!(stats.launches, 1);
    assert_eq!(stats.interval_skips, 1);
    assert_eq!(stats.ticks, 2);
}

#[tokio::test]
async fn near_limit_launch_is_warning() {
    let s = at_memory(72.0);
    let (_tx, mut rx) = watch::channel(false);
    match s.tick(&mut rx).await {
        TickOutcome::Launched { ticket, .. } => assert!(ticket.warning),
        other => panic!("expected launch, got {other:?}"),
    }
    let signals = s.stats().apply_to(LiveSignals::default());
    assert_eq!(signals.warning_decisions, 1);
}

#[tokio::test(start_paused = true)]
async fn memory_pressure_retries_then_misses() {
    let launcher = Arc::new(RecordingLauncher::default());
    let s = scheduler(Arc::new(FixedProbe::new(90.0)), Arc::clone(&launcher));
    let (_tx, mut rx) = watch::channel(false);
    let started = Instant::now();
    let outcome = s.tick(&mut rx).await;
    assert_eq!(outcome, TickOutcome::Missed { attempts: 4 });
    // 60s + 120s + 240s of backoff
    assert!(started.elapsed() >= Duration::from_secs(420));
    let stats = s.stats();
    assert_eq!(stats.memory_skips, 4);
    assert_eq!(stats.missed, 1);
    assert_eq!(stats.launches, 0);
    assert!(launcher.tickets().is_empty());
}

#[tokio::test(start_paused = true)]
async fn pressure_clearing_during_backoff_launches() {
    let probe = Arc::new(FixedProbe::new(90.0));
    let s = Arc::new(scheduler(Arc::clone(&probe), Arc::new(RecordingLauncher::default())));
    let (_tx, mut rx) = watch::channel(false);
    let task = {
        let s = Arc::clone(&s);
        tokio::spawn(async move { s.tick(&mut rx).await })
    };
    tokio::time::sleep(Duration::from_secs(30)).await;
    probe.set(50.0);
    let outcome = task.await.unwrap();
    assert!(matches!(outcome, TickOutcome::Launched { .. }));
    assert_eq!(s.stats().memory_skips, 1);
}

#[tokio::test]
async fn shutdown_cancels_backoff() {
    let s = Arc::new(at_memory(99.0));
    let (tx, mut rx) = watch::channel(false);
    let task = {
        let s = Arc::clone(&s);
        tokio::spawn(async move { s.tick(&mut rx).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    tx.send(true).unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, TickOutcome::Cancelled);
    assert_eq!(s.stats().cancelled, 1);
}
