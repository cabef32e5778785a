//! Canary rollout controller
//!
//! Moves a cosigned lease's change through the traffic tiers
//! `pending -> 5% -> 25% -> 100% -> complete`, with a minimum observation
//! time at each tier and a live health check before each promotion. The
//! health check scores the execution log: its TES mean stands in for the
//! sampled TES once the log has records, and a red AGII band refuses the
//! promotion.
//!
//! Each rollout has three synchronization points:
//! - an async promotion gate, so at most one promotion per lease is in flight
//! - a state lock held for every read-modify-persist of the rollout state
//! - a halt signal (`watch` channel) that wakes promotions waiting out their
//!   observation window, which then abandon
//!
//! A halt is a state, not an error: operations that observe a halt return
//! the halted state.

mod transitions;

pub use transitions::{allowed_transitions, validate_transition};

use crate::audit::{AuditAction, AuditTrail};
use crate::halt::{AutoHaltMonitor, HaltReason, HealthEvaluation, HealthSample, HealthSource, Level};
use crate::lease::LeaseService;
use crate::registry::IntentRegistry;
use crate::rollback::{DeploymentTarget, RollbackManager, RollbackReceipt};
use crate::store::{load_json, save_json, Collection, StateStore};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use guardrail_core::{
    CanaryConfig, Clock, EntityKind, GuardrailError, IntentId, LeaseId, Result, RollbackError,
    RolloutError, Tier,
};
use guardrail_scoring::{AgiiScorecard, BandStatus, ExecutionLog, LiveSignals, ScoringEngine, WatchdogMode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::watch;

/// TES assumed when neither history nor a live sample is available
const DEFAULT_BASELINE_TES: f64 = 100.0;

/// One tier change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierChange {
    pub from: Tier,
    pub to: Tier,
    pub at: DateTime<Utc>,
}

/// Progress of one lease's rollout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutState {
    pub lease_id: LeaseId,
    pub intent_id: IntentId,
    pub tier: Tier,
    pub started_at: DateTime<Utc>,
    /// When the current tier was entered
    pub tier_entered_at: DateTime<Utc>,
    /// Pre-rollout TES the auto-halt monitor compares against
    pub baseline_tes: f64,
    #[serde(default)]
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health: Option<HealthEvaluation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt_reason: Option<HaltReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackReceipt>,
    pub history: Vec<TierChange>,
}

impl RolloutState {
    fn advance(&mut self, to: Tier, at: DateTime<Utc>) -> std::result::Result<(), RolloutError> {
        validate_transition(self.tier, to)?;
        self.history.push(TierChange {
            from: self.tier,
            to,
            at,
        });
        self.tier = to;
        self.tier_entered_at = at;
        Ok(())
    }
}

#[derive(Debug)]
struct RolloutCell {
    promotion: tokio::sync::Mutex<()>,
    state: Mutex<RolloutState>,
    halted: watch::Sender<bool>,
}

impl RolloutCell {
    fn new(state: RolloutState) -> Self {
        let (halted, _) = watch::channel(state.tier == Tier::Halted);
        Self {
            promotion: tokio::sync::Mutex::new(()),
            state: Mutex::new(state),
            halted,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RolloutDocument {
    rollouts: Vec<RolloutState>,
    #[serde(default)]
    blocked: Vec<LeaseId>,
}

#[derive(Debug, Default)]
struct Persisted {
    rollouts: BTreeMap<LeaseId, RolloutState>,
    blocked: BTreeSet<LeaseId>,
}

impl Persisted {
    fn document(&self) -> RolloutDocument {
        RolloutDocument {
            rollouts: self.rollouts.values().cloned().collect(),
            blocked: self.blocked.iter().copied().collect(),
        }
    }
}

/// Collaborators of a [`CanaryController`]
#[derive(Debug, Clone)]
pub struct CanaryParts {
    pub leases: Arc<LeaseService>,
    pub registry: Arc<IntentRegistry>,
    pub rollback: Arc<RollbackManager>,
    pub target: Arc<dyn DeploymentTarget>,
    pub health: Arc<dyn HealthSource>,
    pub scoring: Arc<ScoringEngine>,
    pub log: Arc<ExecutionLog>,
    pub store: Arc<dyn StateStore>,
    pub audit: Arc<AuditTrail>,
    pub clock: Arc<dyn Clock>,
    /// Recent executions scanned for failures when building live signals
    pub signal_window: usize,
}

/// Drives canary rollouts
#[derive(Debug)]
pub struct CanaryController {
    cells: DashMap<LeaseId, Arc<RolloutCell>>,
    /// Lock order is rollout state, then persisted
    persisted: Mutex<Persisted>,
    start_gate: Mutex<()>,
    monitor: AutoHaltMonitor,
    config: CanaryConfig,
    parts: CanaryParts,
}

impl CanaryController {
    /// Restore rollouts from the store
    ///
    /// # Errors
    /// Returns an error if the stored rollouts cannot be read.
    pub fn open(config: CanaryConfig, monitor: AutoHaltMonitor, parts: CanaryParts) -> Result<Self> {
        let document: RolloutDocument =
            load_json(parts.store.as_ref(), Collection::Rollouts)?.unwrap_or_default();
        let cells = DashMap::new();
        let mut persisted = Persisted::default();
        for state in document.rollouts {
            cells.insert(state.lease_id, Arc::new(RolloutCell::new(state.clone())));
            persisted.rollouts.insert(state.lease_id, state);
        }
        persisted.blocked.extend(document.blocked);
        if !persisted.rollouts.is_empty() {
            tracing::info!(rollouts = persisted.rollouts.len(), "rollouts restored");
        }
        Ok(Self {
            cells,
            persisted: Mutex::new(persisted),
            start_gate: Mutex::new(()),
            monitor,
            config,
            parts,
        })
    }

    /// Begin a rollout at the 5% tier.
    ///
    /// # Errors
    /// - `RolloutError::LeaseBlocked` / `AlreadyStarted`
    /// - `AuthorizationError::LeaseNotUsable` with the precise reason (audited)
    /// - `RollbackError::NoRollbackPack`; the lease is blocked
    /// - `GuardrailError::Target` if the traffic shift was refused
    pub fn start(&self, lease_id: LeaseId) -> Result<RolloutState> {
        let _gate = self.start_gate.lock();
        if self.is_blocked(lease_id) {
            return Err(RolloutError::LeaseBlocked(lease_id).into());
        }
        if self.cells.contains_key(&lease_id) {
            return Err(RolloutError::AlreadyStarted(lease_id).into());
        }
        let lease = match self.parts.leases.require_usable(lease_id) {
            Ok(lease) => lease,
            Err(e) => {
                if e.is_authorization() {
                    self.parts.audit.rejection(lease_id, &e);
                }
                return Err(e);
            }
        };
        if self.parts.rollback.pack(lease_id).is_none() {
            self.block(lease_id)?;
            return Err(RollbackError::NoRollbackPack(lease_id).into());
        }

        let baseline_tes = self.baseline(lease_id);
        self.shift_traffic(lease_id, Tier::Tier5)?;
        let now = self.parts.clock.now();
        let mut state = RolloutState {
            lease_id,
            intent_id: lease.intent_id,
            tier: Tier::Pending,
            started_at: now,
            tier_entered_at: now,
            baseline_tes,
            paused: false,
            last_health: None,
            halt_reason: None,
            rollback: None,
            history: Vec::new(),
        };
        state.advance(Tier::Tier5, now)?;
        if let Err(e) = self.persist(&state) {
            self.restore_traffic(lease_id, Tier::Pending);
            return Err(e);
        }
        self.cells
            .insert(lease_id, Arc::new(RolloutCell::new(state.clone())));

        self.record(lease_id, AuditAction::RolloutTransition {
            from: Tier::Pending,
            to: Tier::Tier5,
        });
        tracing::info!(lease = %lease_id, baseline_tes, "rollout started at 5%");
        Ok(state)
    }

    /// Promote to the next tier now, if allowed.
    ///
    /// If the live health check breaches a halt threshold the rollout is
    /// halted and the halted state is returned.
    ///
    /// # Errors
    /// - `RolloutError::ObservationPending` before the tier's minimum
    ///   observation time
    /// - `RolloutError::Paused`, `PromotionAbandoned` (halted), or
    ///   `IllegalTransition` past completion
    /// - `RolloutError::NoHealthData` without a live sample
    /// - `RolloutError::HealthBreach` on a breach while auto-halt is off
    /// - `RolloutError::GovernanceRed` while the AGII band is red
    /// - `AuthorizationError::LeaseNotUsable` if the lease expired
    pub async fn approve_next_tier(&self, lease_id: LeaseId) -> Result<RolloutState> {
        let cell = self.cell(lease_id)?;
        let _promotion = cell.promotion.lock().await;
        self.promote(&cell)
    }

    /// Wait out the current tier's observation window, then promote.
    ///
    /// A halt raised while waiting abandons the promotion.
    ///
    /// # Errors
    /// As [`Self::approve_next_tier`].
    pub async fn promote_when_ready(&self, lease_id: LeaseId) -> Result<RolloutState> {
        let cell = self.cell(lease_id)?;
        let _promotion = cell.promotion.lock().await;
        let mut halted = cell.halted.subscribe();
        let wait = {
            let state = cell.state.lock();
            if state.tier == Tier::Halted {
                return Err(RolloutError::PromotionAbandoned(lease_id).into());
            }
            self.remaining_observation(&state).to_std().ok()
        };
        if let Some(wait) = wait.filter(|w| !w.is_zero()) {
            tracing::debug!(lease = %lease_id, wait_ms = wait.as_millis(), "waiting out observation window");
            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                _ = halted.wait_for(|h| *h) => {
                    tracing::info!(lease = %lease_id, "halt raised during observation, promotion abandoned");
                    return Err(RolloutError::PromotionAbandoned(lease_id).into());
                }
            }
        }
        self.promote(&cell)
    }

    fn promote(&self, cell: &RolloutCell) -> Result<RolloutState> {
        // Before the state lock; degraded_count visits every cell
        let agii = self.governance();
        let mut state = cell.state.lock();
        let lease_id = state.lease_id;
        if state.tier == Tier::Halted {
            return Err(RolloutError::PromotionAbandoned(lease_id).into());
        }
        if state.paused {
            return Err(RolloutError::Paused(lease_id).into());
        }
        let from = state.tier;
        let Some(next) = from.next() else {
            return Err(RolloutError::IllegalTransition { from, to: from }.into());
        };
        validate_transition(from, next)?;

        let remaining = self.remaining_observation(&state);
        if remaining > Duration::zero() {
            return Err(RolloutError::ObservationPending {
                remaining_secs: ceil_secs(remaining),
            }
            .into());
        }
        if let Err(e) = self.parts.leases.require_usable(lease_id) {
            if e.is_authorization() {
                self.parts.audit.rejection(lease_id, &e);
            }
            return Err(e);
        }

        let sample = self
            .parts
            .health
            .sample(lease_id)
            .ok_or(RolloutError::NoHealthData(lease_id))?;
        let evaluation = self.monitor.evaluate(state.baseline_tes, &self.observed(sample));
        state.last_health = Some(evaluation.clone());
        if evaluation.should_halt() {
            if self.config.auto_halt {
                self.halt_locked(cell, &mut state, HaltReason::auto(&evaluation))?;
                return Ok(state.clone());
            }
            return Err(RolloutError::HealthBreach(lease_id).into());
        }
        if agii.status == BandStatus::Red {
            tracing::warn!(lease = %lease_id, agii = agii.overall, "promotion refused, AGII red");
            return Err(RolloutError::GovernanceRed(lease_id).into());
        }

        self.shift_traffic(lease_id, next)?;
        let previous = state.clone();
        let now = self.parts.clock.now();
        state.advance(next, now)?;
        if let Err(e) = self.persist(&state) {
            *state = previous;
            self.restore_traffic(lease_id, from);
            return Err(e);
        }

        self.record(lease_id, AuditAction::RolloutTransition { from, to: next });
        tracing::info!(lease = %lease_id, %from, to = %next, "rollout promoted");
        if next == Tier::Complete {
            if let Err(e) = self.parts.registry.mark_implemented(state.intent_id) {
                tracing::error!(lease = %lease_id, intent = %state.intent_id, error = %e, "failed to mark intent implemented");
            }
        }
        Ok(state.clone())
    }

    /// Halt a rollout. Halting an already halted or rolled back rollout
    /// returns its state unchanged.
    ///
    /// # Errors
    /// Returns `IllegalTransition` for a completed rollout.
    pub fn halt(&self, lease_id: LeaseId, reason: HaltReason) -> Result<RolloutState> {
        let cell = self.cell(lease_id)?;
        let mut state = cell.state.lock();
        if matches!(state.tier, Tier::Halted | Tier::RolledBack) {
            return Ok(state.clone());
        }
        self.halt_locked(&cell, &mut state, reason)?;
        Ok(state.clone())
    }

    fn halt_locked(&self, cell: &RolloutCell, state: &mut RolloutState, reason: HaltReason) -> Result<()> {
        let previous = state.clone();
        let from = state.tier;
        state.advance(Tier::Halted, self.parts.clock.now())?;
        state.halt_reason = Some(reason.clone());
        state.paused = false;
        if let Err(e) = self.persist(state) {
            *state = previous;
            return Err(e);
        }
        cell.halted.send_replace(true);
        self.record(
            state.lease_id,
            AuditAction::RolloutHalted {
                reason: reason.to_string(),
            },
        );
        tracing::warn!(lease = %state.lease_id, %from, %reason, "rollout halted");
        Ok(())
    }

    /// Stop automatic promotion without halting
    ///
    /// # Errors
    /// Returns `IllegalTransition` unless the rollout is at an active tier.
    pub fn pause(&self, lease_id: LeaseId) -> Result<RolloutState> {
        self.set_paused(lease_id, true)
    }

    /// Undo [`Self::pause`]
    ///
    /// # Errors
    /// Returns `IllegalTransition` unless the rollout is at an active tier.
    pub fn resume(&self, lease_id: LeaseId) -> Result<RolloutState> {
        self.set_paused(lease_id, false)
    }

    fn set_paused(&self, lease_id: LeaseId, paused: bool) -> Result<RolloutState> {
        let cell = self.cell(lease_id)?;
        let mut state = cell.state.lock();
        if !state.tier.is_active() {
            return Err(RolloutError::IllegalTransition {
                from: state.tier,
                to: state.tier,
            }
            .into());
        }
        if state.paused == paused {
            return Ok(state.clone());
        }
        state.paused = paused;
        if let Err(e) = self.persist(&state) {
            state.paused = !paused;
            return Err(e);
        }
        let action = if paused {
            AuditAction::RolloutPaused
        } else {
            AuditAction::RolloutResumed
        };
        self.record(lease_id, action);
        tracing::info!(lease = %lease_id, paused, "rollout pause toggled");
        Ok(state.clone())
    }

    /// Halt (if still live) and revert to the captured prior state.
    ///
    /// Rolling back a rolled back rollout returns its state unchanged.
    ///
    /// # Errors
    /// Rollback errors leave the rollout halted. A missing rollback pack
    /// also blocks the lease.
    pub fn rollback(&self, lease_id: LeaseId) -> Result<RolloutState> {
        let cell = self.cell(lease_id)?;
        let mut state = cell.state.lock();
        if state.tier == Tier::RolledBack {
            return Ok(state.clone());
        }
        if state.tier.is_active() {
            self.halt_locked(&cell, &mut state, HaltReason::operator("rollback requested"))?;
        }
        validate_transition(state.tier, Tier::RolledBack)?;

        let receipt = match self.parts.rollback.rollback(lease_id) {
            Ok(receipt) => receipt,
            Err(e) => {
                if matches!(e, GuardrailError::Rollback(RollbackError::NoRollbackPack(_))) {
                    self.block(lease_id)?;
                }
                return Err(e);
            }
        };

        let previous = state.clone();
        let from = state.tier;
        state.advance(Tier::RolledBack, self.parts.clock.now())?;
        state.rollback = Some(receipt);
        if let Err(e) = self.persist(&state) {
            *state = previous;
            return Err(e);
        }
        self.record(lease_id, AuditAction::RolloutTransition {
            from,
            to: Tier::RolledBack,
        });
        if let Err(e) = self
            .parts
            .registry
            .mark_rolled_back(state.intent_id, Some(format!("lease {lease_id} rolled back")))
        {
            tracing::error!(lease = %lease_id, intent = %state.intent_id, error = %e, "failed to mark intent rolled back");
        }
        tracing::info!(lease = %lease_id, "rollout rolled back");
        Ok(state.clone())
    }

    /// Sample live health for one rollout and halt on a breach.
    ///
    /// Returns `None` when the rollout is not live or no sample exists.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown rollout, or a store error if a halt
    /// could not be persisted.
    pub fn evaluate(&self, lease_id: LeaseId) -> Result<Option<HealthEvaluation>> {
        let cell = self.cell(lease_id)?;
        let Some(sample) = self.parts.health.sample(lease_id) else {
            return Ok(None);
        };
        let sample = self.observed(sample);
        let mut state = cell.state.lock();
        if !state.tier.is_active() {
            return Ok(None);
        }
        let evaluation = self.monitor.evaluate(state.baseline_tes, &sample);
        state.last_health = Some(evaluation.clone());
        match evaluation.level {
            Level::Halt if self.config.auto_halt => {
                self.halt_locked(&cell, &mut state, HaltReason::auto(&evaluation))?;
            }
            Level::Halt => {
                tracing::warn!(lease = %lease_id, reason = %HaltReason::auto(&evaluation), "halt threshold breached, auto-halt disabled");
            }
            Level::Warning => {
                tracing::warn!(lease = %lease_id, warnings = evaluation.warnings().len(), "rollout health degraded");
            }
            Level::Nominal => {}
        }
        Ok(Some(evaluation))
    }

    /// Evaluate every live rollout
    #[must_use]
    pub fn evaluate_all(&self) -> Vec<(LeaseId, HealthEvaluation)> {
        let mut out = Vec::new();
        for lease_id in self.live_ids() {
            match self.evaluate(lease_id) {
                Ok(Some(evaluation)) => out.push((lease_id, evaluation)),
                Ok(None) => {}
                Err(e) => tracing::error!(lease = %lease_id, error = %e, "health evaluation failed"),
            }
        }
        out
    }

    /// Promote every live, unpaused rollout whose observation window has
    /// elapsed
    pub async fn promote_ready(&self) -> Vec<RolloutState> {
        let mut promoted = Vec::new();
        for lease_id in self.live_ids() {
            let Ok(cell) = self.cell(lease_id) else { continue };
            let ready = {
                let state = cell.state.lock();
                !state.paused && self.remaining_observation(&state) <= Duration::zero()
            };
            if !ready {
                continue;
            }
            match self.approve_next_tier(lease_id).await {
                Ok(state) => promoted.push(state),
                Err(GuardrailError::Rollout(
                    RolloutError::ObservationPending { .. } | RolloutError::NoHealthData(_),
                )) => {}
                Err(e) => tracing::warn!(lease = %lease_id, error = %e, "automatic promotion refused"),
            }
        }
        promoted
    }

    /// Current state of a rollout
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown rollout.
    pub fn state(&self, lease_id: LeaseId) -> Result<RolloutState> {
        Ok(self.cell(lease_id)?.state.lock().clone())
    }

    /// Rollouts that have not reached a terminal tier (including halted)
    #[must_use]
    pub fn active(&self) -> Vec<RolloutState> {
        let mut states: Vec<RolloutState> = self
            .cells()
            .into_iter()
            .map(|c| c.state.lock().clone())
            .filter(|s| !s.tier.is_terminal())
            .collect();
        states.sort_by_key(|s| s.started_at);
        states
    }

    /// Every rollout ever started
    #[must_use]
    pub fn all(&self) -> Vec<RolloutState> {
        self.persisted.lock().rollouts.values().cloned().collect()
    }

    /// Live rollouts whose last evaluation raised a warning or breach
    #[must_use]
    pub fn degraded_count(&self) -> u32 {
        let count = self
            .cells()
            .into_iter()
            .filter(|c| {
                let state = c.state.lock();
                state.tier.is_active()
                    && state
                        .last_health
                        .as_ref()
                        .is_some_and(|h| h.level > Level::Nominal)
            })
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// Whether a failed rollback blocked this lease
    #[must_use]
    pub fn is_blocked(&self, lease_id: LeaseId) -> bool {
        self.persisted.lock().blocked.contains(&lease_id)
    }

    /// Canary settings in effect
    #[inline]
    #[must_use]
    pub fn config(&self) -> &CanaryConfig {
        &self.config
    }

    fn block(&self, lease_id: LeaseId) -> Result<()> {
        {
            let mut persisted = self.persisted.lock();
            if !persisted.blocked.insert(lease_id) {
                return Ok(());
            }
            if let Err(e) = save_json(self.parts.store.as_ref(), Collection::Rollouts, &persisted.document()) {
                persisted.blocked.remove(&lease_id);
                return Err(e.into());
            }
        }
        self.record(lease_id, AuditAction::LeaseBlocked);
        tracing::error!(lease = %lease_id, "lease blocked: no rollback pack");
        Ok(())
    }

    /// Non-log AGII inputs the controller can see
    #[must_use]
    pub fn live_signals(&self) -> LiveSignals {
        let watchdog_mode = if self.config.auto_halt {
            WatchdogMode::Enforcing
        } else {
            WatchdogMode::Observing
        };
        let window = self.parts.log.window(self.parts.signal_window);
        let failures = window.records.iter().filter(|r| !r.succeeded()).count();
        LiveSignals {
            watchdog_mode,
            candidate_interventions: self.degraded_count(),
            recent_run_failures: u32::try_from(failures).unwrap_or(u32::MAX),
            ..LiveSignals::default()
        }
    }

    /// AGII over the current log window
    fn governance(&self) -> AgiiScorecard {
        let window = self.parts.log.window(self.parts.scoring.agii().window());
        let (_, agii) = self.parts.scoring.evaluate(&window, &self.live_signals());
        agii
    }

    /// `sample` with the scored log mean as its TES, when the log has one
    fn observed(&self, sample: HealthSample) -> HealthSample {
        let tes = self
            .parts
            .scoring
            .tes_mean(&self.parts.log, self.parts.scoring.agii().window());
        HealthSample {
            tes: tes.unwrap_or(sample.tes),
            ..sample
        }
    }

    fn baseline(&self, lease_id: LeaseId) -> f64 {
        self.parts
            .scoring
            .tes_mean(&self.parts.log, self.parts.scoring.agii().window())
            .or_else(|| self.parts.health.sample(lease_id).map(|s| s.tes))
            .unwrap_or(DEFAULT_BASELINE_TES)
    }

    fn remaining_observation(&self, state: &RolloutState) -> Duration {
        let required = Duration::from_std(self.config.observation_for(state.tier))
            .unwrap_or_else(|_| Duration::days(36_500));
        required - (self.parts.clock.now() - state.tier_entered_at)
    }

    fn shift_traffic(&self, lease_id: LeaseId, tier: Tier) -> Result<()> {
        self.parts
            .target
            .set_traffic(lease_id, tier.traffic_percent())
            .map_err(|e| GuardrailError::Target(e.0))
    }

    fn restore_traffic(&self, lease_id: LeaseId, tier: Tier) {
        if let Err(e) = self.shift_traffic(lease_id, tier) {
            tracing::error!(lease = %lease_id, error = %e, "failed to restore traffic share");
        }
    }

    fn persist(&self, state: &RolloutState) -> Result<()> {
        let mut persisted = self.persisted.lock();
        let previous = persisted.rollouts.insert(state.lease_id, state.clone());
        if let Err(e) = save_json(self.parts.store.as_ref(), Collection::Rollouts, &persisted.document()) {
            match previous {
                Some(previous) => persisted.rollouts.insert(state.lease_id, previous),
                None => persisted.rollouts.remove(&state.lease_id),
            };
            return Err(e.into());
        }
        Ok(())
    }

    fn record(&self, lease_id: LeaseId, action: AuditAction) {
        self.parts.audit.record_committed(lease_id, action);
    }

    fn cell(&self, lease_id: LeaseId) -> Result<Arc<RolloutCell>> {
        self.cells
            .get(&lease_id)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| GuardrailError::not_found(EntityKind::Rollout, lease_id))
    }

    fn cells(&self) -> Vec<Arc<RolloutCell>> {
        self.cells.iter().map(|c| Arc::clone(c.value())).collect()
    }

    fn live_ids(&self) -> Vec<LeaseId> {
        self.cells()
            .into_iter()
            .filter_map(|c| {
                let state = c.state.lock();
                state.tier.is_active().then_some(state.lease_id)
            })
            .collect()
    }
}

#[allow(clippy::cast_sign_loss)]
fn ceil_secs(d: Duration) -> u64 {
    ((d.num_milliseconds() + 999) / 1_000).max(0) as u64
}
