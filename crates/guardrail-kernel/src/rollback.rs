//! Rollback packs and the rollback manager
//!
//! A [`RollbackPack`] is captured when a lease is issued, before any traffic
//! is shifted. It records the prior state hash of the part of the deployment
//! target the lease controls, plus the reverse change. Rolling back applies
//! the reverse change and succeeds only if that part's state hash afterwards
//! equals the captured prior state. Other leases' parts are left alone.
//! Repeating a completed rollback is a no-op.

use crate::audit::{AuditAction, AuditTrail};
use crate::lease::Lease;
use crate::registry::Intent;
use crate::store::{load_json, save_json, Collection, StateStore};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use guardrail_core::{
    Clock, ContentHash, GuardrailError, IntentId, LeaseId, Result, RollbackError,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Failure reported by a deployment target
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct TargetError(pub String);

/// The system changes are deployed to
pub trait DeploymentTarget: Send + Sync + fmt::Debug {
    /// Hash of the whole target
    ///
    /// # Errors
    /// Returns an error if the state cannot be read.
    fn current_state(&self) -> std::result::Result<ContentHash, TargetError>;

    /// Hash of the part of the target the change behind `lease_id` controls
    ///
    /// # Errors
    /// Returns an error if the state cannot be read.
    fn lease_state(&self, lease_id: LeaseId) -> std::result::Result<ContentHash, TargetError>;

    /// Route `percent` of traffic to the change behind `lease_id`
    ///
    /// # Errors
    /// Returns an error if the target refused the shift.
    fn set_traffic(&self, lease_id: LeaseId, percent: u8) -> std::result::Result<(), TargetError>;

    /// Apply a reverse change to `lease_id`'s part, returning that part's
    /// resulting state hash
    ///
    /// # Errors
    /// Returns an error if the target refused the change.
    fn apply_reverse(
        &self,
        lease_id: LeaseId,
        change: &ReverseChange,
    ) -> std::result::Result<ContentHash, TargetError>;
}

/// How to undo a lease's change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseChange {
    /// The intent's rollback plan
    pub plan_ref: String,
    /// Paths the change may have touched
    pub paths: BTreeSet<String>,
    /// State the target must return to
    pub restore_to: ContentHash,
}

/// Snapshot sufficient to revert one lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackPack {
    pub lease_id: LeaseId,
    pub intent_id: IntentId,
    pub prior_state: ContentHash,
    pub reverse_change: ReverseChange,
    pub created_at: DateTime<Utc>,
    /// Content address over every field above
    pub content_hash: ContentHash,
}

impl RollbackPack {
    fn compute_hash(&self) -> ContentHash {
        let paths: Vec<u8> = self
            .reverse_change
            .paths
            .iter()
            .flat_map(|p| p.bytes().chain(std::iter::once(0)))
            .collect();
        ContentHash::compute_parts(&[
            &self.lease_id.0.to_bytes(),
            &self.intent_id.0.to_bytes(),
            self.prior_state.as_bytes(),
            self.reverse_change.plan_ref.as_bytes(),
            &paths,
            self.reverse_change.restore_to.as_bytes(),
            &self.created_at.timestamp_micros().to_le_bytes(),
        ])
    }

    /// Whether the stored content hash still matches the pack
    #[must_use]
    pub fn verify_content(&self) -> bool {
        self.content_hash == self.compute_hash()
    }
}

/// Proof of a completed rollback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReceipt {
    pub lease_id: LeaseId,
    pub pack_hash: ContentHash,
    pub post_state: ContentHash,
    pub completed_at: DateTime<Utc>,
}

/// Owns rollback packs and performs rollbacks
#[derive(Debug)]
pub struct RollbackManager {
    packs: DashMap<LeaseId, Arc<RollbackPack>>,
    receipts: DashMap<LeaseId, RollbackReceipt>,
    /// Serializes rollbacks and the persistence of both collections
    apply_lock: Mutex<()>,
    target: Arc<dyn DeploymentTarget>,
    store: Arc<dyn StateStore>,
    audit: Arc<AuditTrail>,
    clock: Arc<dyn Clock>,
}

impl RollbackManager {
    /// Restore packs and receipts from `store`
    ///
    /// # Errors
    /// Returns an error if the stored documents cannot be read.
    pub fn open(
        target: Arc<dyn DeploymentTarget>,
        store: Arc<dyn StateStore>,
        audit: Arc<AuditTrail>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let packs: Vec<RollbackPack> =
            load_json(store.as_ref(), Collection::RollbackPacks)?.unwrap_or_default();
        let receipts: Vec<RollbackReceipt> =
            load_json(store.as_ref(), Collection::RollbackReceipts)?.unwrap_or_default();
        Ok(Self {
            packs: packs.into_iter().map(|p| (p.lease_id, Arc::new(p))).collect(),
            receipts: receipts.into_iter().map(|r| (r.lease_id, r)).collect(),
            apply_lock: Mutex::new(()),
            target,
            store,
            audit,
            clock,
        })
    }

    /// Capture the pack for a freshly issued lease.
    ///
    /// Capturing twice for the same lease returns the original pack.
    ///
    /// # Errors
    /// Returns `GuardrailError::Target` if the prior state cannot be read.
    pub fn capture(&self, lease: &Lease, intent: &Intent) -> Result<Arc<RollbackPack>> {
        let _guard = self.apply_lock.lock();
        if let Some(existing) = self.packs.get(&lease.id) {
            return Ok(Arc::clone(existing.value()));
        }
        let prior_state = self
            .target
            .lease_state(lease.id)
            .map_err(|e| GuardrailError::Target(e.0))?;
        let mut pack = RollbackPack {
            lease_id: lease.id,
            intent_id: intent.id,
            prior_state,
            reverse_change: ReverseChange {
                plan_ref: intent.rollback_plan_ref.clone(),
                paths: lease.scope.paths.clone(),
                restore_to: prior_state,
            },
            created_at: self.clock.now(),
            content_hash: ContentHash::default(),
        };
        pack.content_hash = pack.compute_hash();
        let pack = Arc::new(pack);

        self.packs.insert(lease.id, Arc::clone(&pack));
        if let Err(e) = self.persist_packs() {
            self.packs.remove(&lease.id);
            return Err(e);
        }
        self.audit
            .record_committed(lease.id, AuditAction::RollbackPackCaptured { prior_state });
        tracing::info!(lease = %lease.id, prior = %prior_state.short(), "rollback pack captured");
        Ok(pack)
    }

    /// Pack bound to a lease
    #[must_use]
    pub fn pack(&self, lease_id: LeaseId) -> Option<Arc<RollbackPack>> {
        self.packs.get(&lease_id).map(|p| Arc::clone(p.value()))
    }

    /// Receipt of a completed rollback
    #[must_use]
    pub fn receipt(&self, lease_id: LeaseId) -> Option<RollbackReceipt> {
        self.receipts.get(&lease_id).map(|r| r.value().clone())
    }

    /// Revert a lease to its captured prior state.
    ///
    /// Idempotent: once a rollback completed, later calls return the same
    /// receipt without touching the target.
    ///
    /// # Errors
    /// - `RollbackError::NoRollbackPack` if no pack was captured
    /// - `RollbackError::CorruptPack` if the pack fails its hash check
    /// - `RollbackError::Target` if the target refused the reverse change
    /// - `RollbackError::VerificationFailed` if the target did not return to
    ///   the prior state
    pub fn rollback(&self, lease_id: LeaseId) -> Result<RollbackReceipt> {
        let _guard = self.apply_lock.lock();
        if let Some(receipt) = self.receipts.get(&lease_id) {
            tracing::debug!(lease = %lease_id, "rollback already completed");
            return Ok(receipt.value().clone());
        }

        let result = self.revert(lease_id);
        match &result {
            Ok(receipt) => {
                self.audit.record_committed(
                    lease_id,
                    AuditAction::RollbackCompleted {
                        post_state: receipt.post_state,
                    },
                );
                tracing::info!(lease = %lease_id, post = %receipt.post_state.short(), "rollback verified");
            }
            Err(e) => {
                tracing::error!(lease = %lease_id, error = %e, "rollback failed");
                self.audit.record_committed(
                    lease_id,
                    AuditAction::RollbackFailed {
                        kind: e.kind().to_string(),
                        detail: e.to_string(),
                    },
                );
            }
        }
        result
    }

    fn revert(&self, lease_id: LeaseId) -> Result<RollbackReceipt> {
        let pack = self
            .pack(lease_id)
            .ok_or(RollbackError::NoRollbackPack(lease_id))?;
        if !pack.verify_content() {
            return Err(RollbackError::CorruptPack(lease_id).into());
        }
        let post_state = self
            .target
            .apply_reverse(lease_id, &pack.reverse_change)
            .map_err(|e| RollbackError::Target(e.0))?;
        if post_state != pack.prior_state {
            return Err(RollbackError::VerificationFailed {
                expected: pack.prior_state,
                actual: post_state,
            }
            .into());
        }

        let receipt = RollbackReceipt {
            lease_id,
            pack_hash: pack.content_hash,
            post_state,
            completed_at: self.clock.now(),
        };
        self.receipts.insert(lease_id, receipt.clone());
        if let Err(e) = self.persist_receipts() {
            self.receipts.remove(&lease_id);
            return Err(e);
        }
        Ok(receipt)
    }

    fn persist_packs(&self) -> Result<()> {
        let packs: BTreeMap<LeaseId, RollbackPack> = self
            .packs
            .iter()
            .map(|p| (*p.key(), p.value().as_ref().clone()))
            .collect();
        let all: Vec<&RollbackPack> = packs.values().collect();
        save_json(self.store.as_ref(), Collection::RollbackPacks, &all)?;
        Ok(())
    }

    fn persist_receipts(&self) -> Result<()> {
        let receipts: BTreeMap<LeaseId, RollbackReceipt> = self
            .receipts
            .iter()
            .map(|r| (*r.key(), r.value().clone()))
            .collect();
        let all: Vec<&RollbackReceipt> = receipts.values().collect();
        save_json(self.store.as_ref(), Collection::RollbackReceipts, &all)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct LeaseSlice {
    state: ContentHash,
    traffic: u8,
}

#[derive(Debug, Serialize, Deserialize)]
struct SimulatedState {
    /// State no live change touches
    base: ContentHash,
    /// Lease id to the part its change controls
    #[serde(default)]
    leases: BTreeMap<String, LeaseSlice>,
}

impl SimulatedState {
    fn lease_state(&self, lease: &str) -> ContentHash {
        self.leases.get(lease).map_or(self.base, |slice| slice.state)
    }

    /// The base alone while no lease holds a part
    fn combined(&self) -> ContentHash {
        if self.leases.is_empty() {
            return self.base;
        }
        let mut parts: Vec<&[u8]> = Vec::with_capacity(1 + 2 * self.leases.len());
        parts.push(self.base.as_bytes());
        for (lease, slice) in &self.leases {
            parts.push(lease.as_bytes());
            parts.push(slice.state.as_bytes());
        }
        ContentHash::compute_parts(&parts)
    }
}

/// Deployment target where each lease controls its own part of the state.
///
/// Shifting traffic for a lease folds the lease and percentage into that
/// lease's part; applying a reverse change restores the part exactly. The
/// whole-target hash combines the base with every part. State is persisted
/// so separate CLI invocations share it.
#[derive(Debug)]
pub struct SimulatedTarget {
    state: Mutex<SimulatedState>,
    store: Option<Arc<dyn StateStore>>,
}

impl SimulatedTarget {
    /// Volatile target starting from `initial`
    #[must_use]
    pub fn new(initial: ContentHash) -> Self {
        Self {
            state: Mutex::new(SimulatedState {
                base: initial,
                leases: BTreeMap::new(),
            }),
            store: None,
        }
    }

    /// Target persisted in `store`, starting from the hash of `seed` if new
    ///
    /// # Errors
    /// Returns an error if stored state cannot be read.
    pub fn open(store: Arc<dyn StateStore>, seed: &str) -> Result<Self> {
        let state = load_json(store.as_ref(), Collection::Target)?.unwrap_or_else(|| SimulatedState {
            base: ContentHash::compute(seed.as_bytes()),
            leases: BTreeMap::new(),
        });
        Ok(Self {
            state: Mutex::new(state),
            store: Some(store),
        })
    }

    /// Traffic currently routed to a lease
    #[must_use]
    pub fn traffic(&self, lease_id: LeaseId) -> u8 {
        self.state
            .lock()
            .leases
            .get(&lease_id.to_string())
            .map_or(0, |slice| slice.traffic)
    }

    fn save(&self, state: &SimulatedState) -> std::result::Result<(), TargetError> {
        match &self.store {
            Some(store) => save_json(store.as_ref(), Collection::Target, state)
                .map_err(|e| TargetError(e.to_string())),
            None => Ok(()),
        }
    }
}

impl DeploymentTarget for SimulatedTarget {
    fn current_state(&self) -> std::result::Result<ContentHash, TargetError> {
        Ok(self.state.lock().combined())
    }

    fn lease_state(&self, lease_id: LeaseId) -> std::result::Result<ContentHash, TargetError> {
        Ok(self.state.lock().lease_state(&lease_id.to_string()))
    }

    fn set_traffic(&self, lease_id: LeaseId, percent: u8) -> std::result::Result<(), TargetError> {
        if percent > 100 {
            return Err(TargetError(format!("traffic share {percent}% out of range")));
        }
        let key = lease_id.to_string();
        let mut state = self.state.lock();
        let shifted = ContentHash::compute_parts(&[
            state.lease_state(&key).as_bytes(),
            &lease_id.0.to_bytes(),
            &[percent],
        ]);
        state.leases.insert(key, LeaseSlice {
            state: shifted,
            traffic: percent,
        });
        self.save(&state)
    }

    fn apply_reverse(
        &self,
        lease_id: LeaseId,
        change: &ReverseChange,
    ) -> std::result::Result<ContentHash, TargetError> {
        let key = lease_id.to_string();
        let mut state = self.state.lock();
        if change.restore_to == state.base {
            state.leases.remove(&key);
        } else {
            state.leases.insert(key.clone(), LeaseSlice {
                state: change.restore_to,
                traffic: 0,
            });
        }
        self.save(&state)?;
        Ok(state.lease_state(&key))
    }
}
