//! Adaptive scheduler
//!
//! Decides, once per tick, whether to launch the next unit of work:
//!
//! 1. If less than the base interval passed since the last launch, the tick
//!    is deferred (`interval_not_elapsed`); the next tick re-checks.
//! 2. Memory utilization is compared to a soft limit derived from recent
//!    TES: healthy systems get the tightest limit (70%), struggling ones the
//!    loosest (78%). Over the limit the tick skips (`memory_limit`) and
//!    retries with exponential backoff; after the last retry the window is
//!    missed.
//! 3. The launch strategy targets the weakest TES component, or is balanced
//!    when every component is strong.
//!
//! Every decision is logged with its reason and counted in
//! [`SchedulerStats`], which feeds the AGII observability dimension.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use guardrail_core::{Clock, ExecutionRecord, SchedulerConfig};
use guardrail_scoring::{ExecutionLog, LiveSignals, ScoringEngine, TesBreakdown, TesComponent};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

/// What the next unit of work should focus on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    StabilityFocused,
    VelocityFocused,
    FootprintFocused,
    Balanced,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::StabilityFocused => "stability_focused",
            Self::VelocityFocused => "velocity_focused",
            Self::FootprintFocused => "footprint_focused",
            Self::Balanced => "balanced",
        })
    }
}

/// Why a tick did not launch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum SkipReason {
    IntervalNotElapsed { remaining_ms: u64 },
    MemoryLimit { utilization: f64, soft_limit: f64 },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IntervalNotElapsed { .. } => f.write_str("interval_not_elapsed"),
            Self::MemoryLimit { .. } => f.write_str("memory_limit"),
        }
    }
}

/// Handed to the launcher with each launch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LaunchTicket {
    pub strategy: Strategy,
    pub soft_limit: f64,
    pub memory_utilization: f64,
    /// Utilization was within the warning margin of the soft limit
    pub warning: bool,
    pub issued_at: DateTime<Utc>,
}

/// Outcome of one tick
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Work ran; `sequence` is its execution-log position when committed
    Launched {
        ticket: LaunchTicket,
        record: ExecutionRecord,
        sequence: Option<u64>,
    },
    /// The base interval has not elapsed; the next tick re-checks
    Deferred(SkipReason),
    /// Memory stayed over the soft limit through every retry
    Missed { attempts: u32 },
    /// Shutdown arrived during backoff
    Cancelled,
}

/// Current memory utilization, in percent
pub trait ResourceProbe: Send + Sync + fmt::Debug {
    fn memory_utilization(&self) -> f64;
}

/// Runs one unit of work.
///
/// Launch failures are reported through the record's status, never as an
/// error.
#[async_trait]
pub trait WorkLauncher: Send + Sync + fmt::Debug {
    async fn launch(&self, ticket: LaunchTicket) -> ExecutionRecord;
}

/// Decision counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub ticks: u64,
    /// Gate checks (interval, memory) including retries
    pub decisions: u64,
    pub launches: u64,
    pub interval_skips: u64,
    pub memory_skips: u64,
    pub missed: u64,
    pub cancelled: u64,
    /// Launches flagged as close to the soft limit
    pub warnings: u64,
}

impl SchedulerStats {
    /// Fill the scheduler-derived part of AGII's live signals
    #[must_use]
    pub fn apply_to(&self, signals: LiveSignals) -> LiveSignals {
        LiveSignals {
            warning_decisions: self.warnings,
            total_decisions: self.decisions,
            memory_skips: self.memory_skips,
            scheduler_ticks: self.decisions,
            ..signals
        }
    }
}

/// Collaborators of an [`AdaptiveScheduler`]
#[derive(Debug, Clone)]
pub struct SchedulerParts {
    pub log: Arc<ExecutionLog>,
    pub scoring: Arc<ScoringEngine>,
    pub probe: Arc<dyn ResourceProbe>,
    pub launcher: Arc<dyn WorkLauncher>,
    pub clock: Arc<dyn Clock>,
}

/// The adaptive scheduler
#[derive(Debug)]
pub struct AdaptiveScheduler {
    config: SchedulerConfig,
    parts: SchedulerParts,
    last_launch: Mutex<Option<Instant>>,
    stats: Mutex<SchedulerStats>,
}

impl AdaptiveScheduler {
    #[must_use]
    pub fn new(config: SchedulerConfig, parts: SchedulerParts) -> Self {
        Self {
            config,
            parts,
            last_launch: Mutex::new(None),
            stats: Mutex::new(SchedulerStats::default()),
        }
    }

    /// Memory soft limit for a recent TES mean
    #[must_use]
    pub fn soft_limit(&self, tes_mean: Option<f64>) -> f64 {
        match tes_mean {
            Some(mean) if mean > self.config.healthy_tes_mean => self.config.healthy_memory_limit,
            Some(mean) if mean < self.config.struggling_tes_mean => self.config.struggling_memory_limit,
            _ => self.config.steady_memory_limit,
        }
    }

    /// Strategy for a mean TES breakdown
    #[must_use]
    pub fn select_strategy(&self, breakdown: Option<&TesBreakdown>) -> Strategy {
        let Some(breakdown) = breakdown else {
            return Strategy::Balanced;
        };
        if breakdown.min() >= self.config.balanced_floor {
            return Strategy::Balanced;
        }
        match breakdown.weakest() {
            TesComponent::Stability => Strategy::StabilityFocused,
            TesComponent::Velocity => Strategy::VelocityFocused,
            TesComponent::Footprint => Strategy::FootprintFocused,
        }
    }

    /// Counters so far
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        *self.stats.lock()
    }

    /// Run one tick. Backoff waits end early with [`TickOutcome::Cancelled`]
    /// once `shutdown` turns true or its sender is dropped.
    pub async fn tick(&self, shutdown: &mut watch::Receiver<bool>) -> TickOutcome {
        self.stats.lock().ticks += 1;

        if let Some(remaining) = self.interval_remaining() {
            let remaining_ms = millis(remaining);
            let reason = SkipReason::IntervalNotElapsed { remaining_ms };
            {
                let mut stats = self.stats.lock();
                stats.decisions += 1;
                stats.interval_skips += 1;
            }
            tracing::info!(decision = "skip", %reason, remaining_ms, "scheduler tick deferred");
            return TickOutcome::Deferred(reason);
        }

        let window = self.parts.log.window(self.config.trend_window);
        let tes = self.parts.scoring.tes_stats(&window.records);
        let soft_limit = self.soft_limit(tes.mean);
        let strategy = self.select_strategy(tes.breakdown.as_ref());

        let attempts = self.config.retry_attempts;
        for attempt in 0..=attempts {
            let utilization = self.parts.probe.memory_utilization();
            self.stats.lock().decisions += 1;
            if utilization <= soft_limit {
                return self.launch(strategy, soft_limit, utilization).await;
            }

            self.stats.lock().memory_skips += 1;
            let reason = SkipReason::MemoryLimit {
                utilization,
                soft_limit,
            };
            if attempt == attempts {
                self.stats.lock().missed += 1;
                tracing::warn!(decision = "miss", %reason, utilization, soft_limit, attempts = attempt + 1, "scheduling window missed");
                return TickOutcome::Missed {
                    attempts: attempt + 1,
                };
            }
            let delay = self.config.retry_delay(attempt);
            tracing::warn!(
                decision = "skip",
                %reason,
                utilization,
                soft_limit,
                retry_in_ms = millis(delay),
                "memory over soft limit, backing off"
            );
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = shutdown.wait_for(|stop| *stop) => {
                    self.stats.lock().cancelled += 1;
                    tracing::info!(decision = "cancel", "backoff cancelled by shutdown");
                    return TickOutcome::Cancelled;
                }
            }
        }
        // The loop always returns on its last attempt.
        TickOutcome::Missed {
            attempts: attempts + 1,
        }
    }

    fn interval_remaining(&self) -> Option<std::time::Duration> {
        let last = (*self.last_launch.lock())?;
        let elapsed = last.elapsed();
        let interval = self.config.base_interval();
        (elapsed < interval).then(|| interval - elapsed)
    }

    async fn launch(&self, strategy: Strategy, soft_limit: f64, utilization: f64) -> TickOutcome {
        let warning = utilization > soft_limit - self.config.warning_margin;
        let ticket = LaunchTicket {
            strategy,
            soft_limit,
            memory_utilization: utilization,
            warning,
            issued_at: self.parts.clock.now(),
        };
        *self.last_launch.lock() = Some(Instant::now());
        {
            let mut stats = self.stats.lock();
            stats.launches += 1;
            if warning {
                stats.warnings += 1;
            }
        }
        tracing::info!(decision = "launch", %strategy, utilization, soft_limit, warning, "launching work");

        let record = self.parts.launcher.launch(ticket).await;
        let sequence = match self.parts.log.append(record.clone()) {
            Ok(sequence) => Some(sequence),
            Err(e) => {
                tracing::warn!(execution = %record.id, error = %e, "execution record not committed");
                None
            }
        };
        TickOutcome::Launched {
            ticket,
            record,
            sequence,
        }
    }
}

fn millis(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
