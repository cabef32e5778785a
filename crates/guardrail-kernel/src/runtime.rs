//! Control loops
//!
//! Three independent tokio tasks, each on its own cadence from
//! [`LoopConfig`](guardrail_core::LoopConfig):
//!
//! | Loop | Each iteration |
//! |---|---|
//! | `scheduler` | one scheduler tick, then a score snapshot after a launch |
//! | `canary` | promote ready rollouts (only with `canary.auto_promote`) |
//! | `auto_halt` | evaluate live health of every active rollout |
//!
//! All loops beat the heartbeat registry and stop on the shared shutdown
//! signal.

use crate::pipeline::Pipeline;
use crate::scheduler::TickOutcome;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub const SCHEDULER_LOOP: &str = "scheduler";
pub const CANARY_LOOP: &str = "canary";
pub const HALT_LOOP: &str = "auto_halt";

/// Outcome of one pass of the halt loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HealthSweep {
    /// Live rollouts that had a health sample
    pub evaluated: usize,
    /// Of those, rollouts over a halt threshold
    pub breaching: usize,
}

/// Evaluate every live rollout once
#[must_use]
pub fn sweep_health(pipeline: &Pipeline) -> HealthSweep {
    let evaluations = pipeline.canary().evaluate_all();
    let sweep = HealthSweep {
        evaluated: evaluations.len(),
        breaching: evaluations.iter().filter(|(_, e)| e.should_halt()).count(),
    };
    if sweep.breaching > 0 {
        tracing::warn!(
            evaluated = sweep.evaluated,
            breaching = sweep.breaching,
            auto_halt = pipeline.config().canary.auto_halt,
            "halt thresholds breached"
        );
    }
    sweep
}

/// Running control loops
#[derive(Debug)]
pub struct Runtime {
    pipeline: Arc<Pipeline>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Runtime {
    /// Spawn all loops. Must be called inside a tokio runtime.
    #[must_use]
    pub fn start(pipeline: Arc<Pipeline>) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let loops = pipeline.config().loops.clone();
        let mut tasks = Vec::with_capacity(3);

        {
            let p = Arc::clone(&pipeline);
            let stop = rx.clone();
            tasks.push((
                SCHEDULER_LOOP,
                spawn_loop(SCHEDULER_LOOP, loops.scheduler_tick_ms, &pipeline, rx.clone(), move || {
                    let p = Arc::clone(&p);
                    let mut stop = stop.clone();
                    async move {
                        match p.scheduler().tick(&mut stop).await {
                            TickOutcome::Cancelled => return ControlFlow::Break(()),
                            TickOutcome::Launched { .. } => {
                                p.score_snapshot();
                            }
                            TickOutcome::Deferred(_) | TickOutcome::Missed { .. } => {}
                        }
                        ControlFlow::Continue(())
                    }
                }),
            ));
        }
        {
            let p = Arc::clone(&pipeline);
            tasks.push((
                CANARY_LOOP,
                spawn_loop(CANARY_LOOP, loops.canary_check_ms, &pipeline, rx.clone(), move || {
                    let p = Arc::clone(&p);
                    async move {
                        if p.config().canary.auto_promote {
                            let promoted = p.canary().promote_ready().await;
                            if !promoted.is_empty() {
                                tracing::info!(promoted = promoted.len(), "rollouts promoted");
                            }
                        }
                        ControlFlow::Continue(())
                    }
                }),
            ));
        }
        {
            let p = Arc::clone(&pipeline);
            tasks.push((
                HALT_LOOP,
                spawn_loop(HALT_LOOP, loops.halt_eval_ms, &pipeline, rx, move || {
                    let p = Arc::clone(&p);
                    async move {
                        let sweep = sweep_health(&p);
                        tracing::trace!(evaluated = sweep.evaluated, "health sweep");
                        ControlFlow::Continue(())
                    }
                }),
            ));
        }

        tracing::info!(loops = tasks.len(), "control loops started");
        Self {
            pipeline,
            shutdown,
            tasks,
        }
    }

    #[must_use]
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// A receiver of the shared shutdown signal
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Signal every loop to stop and wait for them
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        let (names, tasks): (Vec<_>, Vec<_>) = self.tasks.into_iter().unzip();
        for (name, result) in names.into_iter().zip(futures::future::join_all(tasks).await) {
            if let Err(e) = result {
                tracing::error!(task = name, error = %e, "control loop panicked");
            }
        }
        tracing::info!("control loops stopped");
    }
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    period_ms: u64,
    pipeline: &Arc<Pipeline>,
    mut shutdown: watch::Receiver<bool>,
    mut step: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ControlFlow<()>> + Send + 'static,
{
    let heartbeats = Arc::clone(pipeline.heartbeats());
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(period_ms.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
            heartbeats.beat(name);
            if step().await.is_break() {
                break;
            }
        }
        tracing::debug!(task = name, "control loop exited");
    })
}
