//! Pipeline wiring
//!
//! Builds every service over one store, one clock and one audit trail, in
//! dependency order: audit, registry and principals, rollback, leases,
//! canary, scheduler.

use crate::audit::AuditTrail;
use crate::canary::{CanaryController, CanaryParts};
use crate::halt::{AutoHaltMonitor, HealthSource};
use crate::heartbeat::HeartbeatRegistry;
use crate::lease::{LeaseService, LeaseServiceParts, PrincipalDirectory, SignatureVerifier};
use crate::registry::IntentRegistry;
use crate::rollback::{DeploymentTarget, RollbackManager};
use crate::scheduler::{AdaptiveScheduler, ResourceProbe, SchedulerParts, WorkLauncher};
use crate::store::StateStore;
use guardrail_core::{Clock, ExecutionRecord, GuardrailConfig, InputError, Result};
use guardrail_scoring::{ExecutionLog, LiveSignals, ScoreReport, ScoreSnapshot, ScoringEngine};
use std::sync::Arc;
use std::time::Duration;

/// Committed executions kept in memory, as a multiple of the widest window
const LOG_RETENTION_WINDOWS: usize = 20;

/// External collaborators of a [`Pipeline`]
#[derive(Debug, Clone)]
pub struct PipelineDeps {
    pub store: Arc<dyn StateStore>,
    pub target: Arc<dyn DeploymentTarget>,
    pub health: Arc<dyn HealthSource>,
    pub probe: Arc<dyn ResourceProbe>,
    pub launcher: Arc<dyn WorkLauncher>,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub clock: Arc<dyn Clock>,
}

/// Every service of the guardrail pipeline
#[derive(Debug)]
pub struct Pipeline {
    config: GuardrailConfig,
    audit: Arc<AuditTrail>,
    registry: Arc<IntentRegistry>,
    directory: Arc<PrincipalDirectory>,
    rollback: Arc<RollbackManager>,
    leases: Arc<LeaseService>,
    canary: Arc<CanaryController>,
    scheduler: Arc<AdaptiveScheduler>,
    scoring: Arc<ScoringEngine>,
    log: Arc<ExecutionLog>,
    heartbeats: Arc<HeartbeatRegistry>,
}

impl Pipeline {
    /// Validate `config` and restore every service from `deps.store`
    ///
    /// # Errors
    /// Returns `GuardrailError::Config` for an invalid configuration, or a
    /// store error if persisted state cannot be read.
    pub fn open(config: GuardrailConfig, deps: PipelineDeps) -> Result<Self> {
        config.validate()?;
        let PipelineDeps {
            store,
            target,
            health,
            probe,
            launcher,
            verifier,
            clock,
        } = deps;

        let audit = Arc::new(AuditTrail::open(Arc::clone(&store), Arc::clone(&clock))?);
        let registry = Arc::new(IntentRegistry::open(
            Arc::clone(&store),
            Arc::clone(&audit),
            Arc::clone(&clock),
        )?);
        let directory = Arc::new(PrincipalDirectory::open(
            Arc::clone(&store),
            Arc::clone(&audit),
            Arc::clone(&clock),
        )?);
        let rollback = Arc::new(RollbackManager::open(
            Arc::clone(&target),
            Arc::clone(&store),
            Arc::clone(&audit),
            Arc::clone(&clock),
        )?);
        let leases = Arc::new(LeaseService::open(
            config.lease.clone(),
            LeaseServiceParts {
                registry: Arc::clone(&registry),
                rollback: Arc::clone(&rollback),
                directory: Arc::clone(&directory),
                verifier,
                store: Arc::clone(&store),
                audit: Arc::clone(&audit),
                clock: Arc::clone(&clock),
            },
        )?);

        let scoring = Arc::new(ScoringEngine::new(&config.scoring));
        let widest = config.scoring.agii.window.max(config.scheduler.trend_window);
        let log = Arc::new(ExecutionLog::with_retention(widest.saturating_mul(LOG_RETENTION_WINDOWS)));

        let canary = Arc::new(CanaryController::open(
            config.canary.clone(),
            AutoHaltMonitor::new(config.halt.clone()),
            CanaryParts {
                leases: Arc::clone(&leases),
                registry: Arc::clone(&registry),
                rollback: Arc::clone(&rollback),
                target,
                health,
                scoring: Arc::clone(&scoring),
                log: Arc::clone(&log),
                store,
                audit: Arc::clone(&audit),
                clock: Arc::clone(&clock),
                signal_window: config.scheduler.trend_window,
            },
        )?);
        let scheduler = Arc::new(AdaptiveScheduler::new(
            config.scheduler.clone(),
            SchedulerParts {
                log: Arc::clone(&log),
                scoring: Arc::clone(&scoring),
                probe,
                launcher,
                clock: Arc::clone(&clock),
            },
        ));
        let heartbeats = Arc::new(HeartbeatRegistry::new(
            Duration::from_millis(config.loops.heartbeat_ttl_ms),
            clock,
        ));

        tracing::info!(
            intents = registry.list().len(),
            leases = leases.list().len(),
            rollouts = canary.all().len(),
            audit_records = audit.len(),
            "pipeline opened"
        );
        Ok(Self {
            config,
            audit,
            registry,
            directory,
            rollback,
            leases,
            canary,
            scheduler,
            scoring,
            log,
            heartbeats,
        })
    }

    #[must_use]
    pub fn config(&self) -> &GuardrailConfig {
        &self.config
    }

    #[must_use]
    pub fn audit(&self) -> &Arc<AuditTrail> {
        &self.audit
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<IntentRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn directory(&self) -> &Arc<PrincipalDirectory> {
        &self.directory
    }

    #[must_use]
    pub fn rollback(&self) -> &Arc<RollbackManager> {
        &self.rollback
    }

    #[must_use]
    pub fn leases(&self) -> &Arc<LeaseService> {
        &self.leases
    }

    #[must_use]
    pub fn canary(&self) -> &Arc<CanaryController> {
        &self.canary
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<AdaptiveScheduler> {
        &self.scheduler
    }

    #[must_use]
    pub fn scoring(&self) -> &Arc<ScoringEngine> {
        &self.scoring
    }

    #[must_use]
    pub fn log(&self) -> &Arc<ExecutionLog> {
        &self.log
    }

    #[must_use]
    pub fn heartbeats(&self) -> &Arc<HeartbeatRegistry> {
        &self.heartbeats
    }

    /// Commit an execution reported from outside the scheduler
    ///
    /// # Errors
    /// Returns `InputError::MalformedRecord` if the record is rejected.
    pub fn record_execution(&self, record: ExecutionRecord) -> Result<u64> {
        self.log
            .append(record)
            .map_err(|e| InputError::MalformedRecord(e.to_string()).into())
    }

    /// Current non-log AGII inputs
    #[must_use]
    pub fn live_signals(&self) -> LiveSignals {
        self.scheduler.stats().apply_to(self.canary.live_signals())
    }

    /// Score the current log window and record the snapshot
    pub fn score_snapshot(&self) -> Arc<ScoreSnapshot> {
        self.scoring.snapshot(&self.log, &self.live_signals())
    }

    /// Score now and render the outbound report
    pub fn score_report(&self) -> ScoreReport {
        let snapshot = self.score_snapshot();
        ScoreReport::from_snapshot(&snapshot, self.scoring.history().len())
    }
}
