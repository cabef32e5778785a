//! Two-key capability leases
//!
//! A [`Lease`] grants a bounded scope for a bounded time to an approved
//! intent. It becomes usable only once a human and an agent principal have
//! both cosigned its canonical content, and stops being usable when its TTL
//! passes. Issuing a lease captures its rollback pack before anything else
//! can happen to it.
//!
//! Cosigning a lease takes that lease's write lock, so concurrent cosigners
//! are serialized; [`LeaseService::verify`] re-reads the full cosigner set and
//! re-checks every signature on each call.

mod signature;

pub use signature::{ed25519_sign, Ed25519Verifier, Principal, PrincipalDirectory, SignatureVerifier};

use crate::audit::{AuditAction, AuditTrail};
use crate::registry::IntentRegistry;
use crate::rollback::{RollbackManager, RollbackPack};
use crate::store::{load_json, save_json, Collection, StateStore};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use ed25519_dalek::SigningKey;
use guardrail_core::{
    AuthorizationError, Clock, ContentHash, EntityKind, GuardrailError, InputError, IntentId,
    IntentStatus, LeaseConfig, LeaseId, Result, Role, Scope, UnusableReason,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

const SIGNING_DOMAIN: &[u8] = b"guardrail.lease.v1";

/// A recorded cosignature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cosigner {
    pub role: Role,
    pub signer_id: String,
    #[serde(with = "signature::hex_bytes")]
    pub signature: Vec<u8>,
    /// Time claimed by the signer
    pub signed_at: DateTime<Utc>,
    /// Time the kernel accepted the signature
    pub recorded_at: DateTime<Utc>,
}

/// Capability lease bound to one intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: LeaseId,
    pub intent_id: IntentId,
    pub scope: Scope,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// SHA-256 over the canonical content every cosigner signs
    pub canonical_hash: ContentHash,
    #[serde(default)]
    pub cosigners: Vec<Cosigner>,
    /// Set once both roles have cosigned
    #[serde(default)]
    pub sealed_hash: Option<ContentHash>,
}

impl Lease {
    fn build(intent_id: IntentId, scope: Scope, issued_at: DateTime<Utc>, ttl: Duration) -> Self {
        let mut lease = Self {
            id: LeaseId::new(),
            intent_id,
            scope,
            issued_at,
            expires_at: issued_at + ttl,
            canonical_hash: ContentHash::default(),
            cosigners: Vec::new(),
            sealed_hash: None,
        };
        lease.canonical_hash = lease.canonical_digest();
        lease
    }

    #[cfg(test)]
    pub(crate) fn for_tests(intent_id: IntentId, scope: Scope) -> Self {
        Self::build(intent_id, scope, Utc::now(), Duration::hours(1))
    }

    /// Recompute the canonical digest from the lease fields
    #[must_use]
    pub fn canonical_digest(&self) -> ContentHash {
        let mut hasher = Sha256::new();
        hasher.update(SIGNING_DOMAIN);
        hasher.update(self.id.0.to_bytes());
        hasher.update(self.intent_id.0.to_bytes());
        hasher.update(self.scope.canonical_bytes());
        hasher.update(self.issued_at.timestamp_micros().to_le_bytes());
        hasher.update(self.expires_at.timestamp_micros().to_le_bytes());
        ContentHash::new(hasher.finalize().into())
    }

    /// Bytes a principal signs to cosign as `role`
    #[must_use]
    pub fn signing_message(&self, role: Role) -> Vec<u8> {
        let digest = self.canonical_digest();
        let mut msg = Vec::with_capacity(SIGNING_DOMAIN.len() + 32 + 1);
        msg.extend_from_slice(SIGNING_DOMAIN);
        msg.extend_from_slice(digest.as_bytes());
        msg.push(role.as_u8());
        msg
    }

    /// Cosignature for `role`, if present
    #[must_use]
    pub fn cosigner(&self, role: Role) -> Option<&Cosigner> {
        self.cosigners.iter().find(|c| c.role == role)
    }

    /// Whether both roles have cosigned
    #[inline]
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed_hash.is_some()
    }

    /// Whether `now` is at or past the expiry
    #[inline]
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn seal_hash(&self) -> ContentHash {
        let mut cosigners: Vec<&Cosigner> = self.cosigners.iter().collect();
        cosigners.sort_by_key(|c| c.role);
        let mut parts: Vec<&[u8]> = vec![self.canonical_hash.as_bytes()];
        for c in &cosigners {
            parts.push(c.signer_id.as_bytes());
            parts.push(&c.signature);
        }
        ContentHash::compute_parts(&parts)
    }
}

/// A cosignature submitted for a lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CosignatureInput {
    pub lease_id: LeaseId,
    pub role: Role,
    pub signer_id: String,
    #[serde(with = "signature::hex_bytes")]
    pub signature: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl CosignatureInput {
    /// Sign `lease` as `role` with an Ed25519 key
    #[must_use]
    pub fn ed25519(lease: &Lease, role: Role, signer_id: &str, key: &SigningKey) -> Self {
        Self {
            lease_id: lease.id,
            role,
            signer_id: signer_id.to_string(),
            signature: ed25519_sign(key, &lease.signing_message(role)),
            timestamp: Utc::now(),
        }
    }

    /// Structural checks, before any lease is looked at
    ///
    /// # Errors
    /// Returns `InputError::MalformedCosignature` on an empty signer or
    /// signature.
    pub fn validate(&self) -> std::result::Result<(), InputError> {
        if self.signer_id.trim().is_empty() {
            return Err(InputError::MalformedCosignature("signer id is empty".into()));
        }
        if self.signature.is_empty() {
            return Err(InputError::MalformedCosignature("signature is empty".into()));
        }
        Ok(())
    }
}

/// Result of checking a lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub lease_id: LeaseId,
    pub usable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<UnusableReason>,
    pub expires_at: DateTime<Utc>,
    /// Roles with a cosignature that still verifies
    pub valid_roles: Vec<Role>,
}

/// A newly issued lease and its rollback pack
#[derive(Debug, Clone)]
pub struct IssuedLease {
    pub lease: Lease,
    pub rollback_pack: Arc<RollbackPack>,
}

/// Issues, cosigns and verifies leases
#[derive(Debug)]
pub struct LeaseService {
    leases: DashMap<LeaseId, Arc<RwLock<Lease>>>,
    /// Persisted copy; lock order is lease, then documents
    documents: Mutex<BTreeMap<LeaseId, Lease>>,
    registry: Arc<IntentRegistry>,
    rollback: Arc<RollbackManager>,
    directory: Arc<PrincipalDirectory>,
    verifier: Arc<dyn SignatureVerifier>,
    config: LeaseConfig,
    store: Arc<dyn StateStore>,
    audit: Arc<AuditTrail>,
    clock: Arc<dyn Clock>,
}

/// Collaborators of a [`LeaseService`]
#[derive(Debug, Clone)]
pub struct LeaseServiceParts {
    pub registry: Arc<IntentRegistry>,
    pub rollback: Arc<RollbackManager>,
    pub directory: Arc<PrincipalDirectory>,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub store: Arc<dyn StateStore>,
    pub audit: Arc<AuditTrail>,
    pub clock: Arc<dyn Clock>,
}

impl LeaseService {
    /// Restore leases from the store
    ///
    /// # Errors
    /// Returns an error if the stored leases cannot be read.
    pub fn open(config: LeaseConfig, parts: LeaseServiceParts) -> Result<Self> {
        let stored: Vec<Lease> = load_json(parts.store.as_ref(), Collection::Leases)?.unwrap_or_default();
        let leases = DashMap::new();
        let mut documents = BTreeMap::new();
        for lease in stored {
            leases.insert(lease.id, Arc::new(RwLock::new(lease.clone())));
            documents.insert(lease.id, lease);
        }
        Ok(Self {
            leases,
            documents: Mutex::new(documents),
            registry: parts.registry,
            rollback: parts.rollback,
            directory: parts.directory,
            verifier: parts.verifier,
            config,
            store: parts.store,
            audit: parts.audit,
            clock: parts.clock,
        })
    }

    /// Issue a lease for an approved intent and capture its rollback pack.
    ///
    /// `scope` defaults to the intent's scope, `ttl` to the configured
    /// default.
    ///
    /// # Errors
    /// - `AuthorizationError::IntentNotApproved` (audited)
    /// - `InputError::ScopeExceedsIntent` if `scope` is wider than the intent's
    /// - `InputError::MalformedLease` on an empty scope or a TTL outside
    ///   `1..=max_ttl_secs`
    /// - `GuardrailError::Target` if the rollback pack cannot be captured
    pub fn issue_lease(
        &self,
        intent_id: IntentId,
        scope: Option<Scope>,
        ttl: Option<Duration>,
    ) -> Result<IssuedLease> {
        let ttl = ttl.unwrap_or_else(|| secs(self.config.default_ttl_secs));
        if ttl <= Duration::zero() || ttl > secs(self.config.max_ttl_secs) {
            return Err(InputError::MalformedLease(format!(
                "ttl {}s outside 1..={}s",
                ttl.num_seconds(),
                self.config.max_ttl_secs
            ))
            .into());
        }

        let intent = self.registry.get(intent_id)?;
        if intent.status != IntentStatus::Approved {
            let err = GuardrailError::from(AuthorizationError::IntentNotApproved {
                status: intent.status,
            });
            self.audit.rejection(intent_id, &err);
            return Err(err);
        }
        let scope = scope.unwrap_or_else(|| intent.scope.clone());
        if scope.is_empty() {
            return Err(InputError::MalformedLease("scope grants nothing".into()).into());
        }
        if !scope.is_subset_of(&intent.scope) {
            return Err(InputError::ScopeExceedsIntent.into());
        }

        let lease = Lease::build(intent_id, scope, self.clock.now(), ttl);
        let rollback_pack = self.rollback.capture(&lease, &intent)?;
        self.persist(&lease)?;
        self.leases.insert(lease.id, Arc::new(RwLock::new(lease.clone())));

        self.audit.record_committed(lease.id, AuditAction::LeaseIssued);
        tracing::info!(
            lease = %lease.id,
            intent = %intent_id,
            expires_at = %lease.expires_at,
            "lease issued"
        );
        Ok(IssuedLease {
            lease,
            rollback_pack,
        })
    }

    /// Record a cosignature.
    ///
    /// # Errors
    /// - `InputError::MalformedCosignature` for structurally bad input
    /// - `NotFound` for an unknown lease
    /// - `AuthorizationError::{LeaseSealed, UnknownPrincipal, RoleMismatch,
    ///   DuplicateRole, InvalidSignature}`; these are audited and leave the
    ///   lease unchanged
    pub fn cosign(&self, input: CosignatureInput) -> Result<Lease> {
        input.validate()?;
        let result = self.cosign_checked(&input);
        if let Err(e) = &result {
            if e.is_authorization() {
                self.audit.rejection(input.lease_id, e);
            }
        }
        result
    }

    fn cosign_checked(&self, input: &CosignatureInput) -> Result<Lease> {
        let cell = self.cell(input.lease_id)?;
        let mut lease = cell.write();
        if lease.is_sealed() {
            return Err(AuthorizationError::LeaseSealed(lease.id).into());
        }
        let principal = self
            .directory
            .get(&input.signer_id)
            .ok_or_else(|| AuthorizationError::UnknownPrincipal(input.signer_id.clone()))?;
        if principal.role != input.role {
            return Err(AuthorizationError::RoleMismatch {
                signer_id: input.signer_id.clone(),
                declared: principal.role,
                claimed: input.role,
            }
            .into());
        }
        if lease.cosigner(input.role).is_some() {
            return Err(AuthorizationError::DuplicateRole {
                lease_id: lease.id,
                role: input.role,
            }
            .into());
        }
        let message = lease.signing_message(input.role);
        if !self
            .verifier
            .verify(&principal.public_key, &message, &input.signature)
        {
            return Err(AuthorizationError::InvalidSignature {
                lease_id: lease.id,
                role: input.role,
                signer_id: input.signer_id.clone(),
            }
            .into());
        }

        let mut updated = lease.clone();
        updated.cosigners.push(Cosigner {
            role: input.role,
            signer_id: input.signer_id.clone(),
            signature: input.signature.clone(),
            signed_at: input.timestamp,
            recorded_at: self.clock.now(),
        });
        if Role::REQUIRED.iter().all(|r| updated.cosigner(*r).is_some()) {
            updated.sealed_hash = Some(updated.seal_hash());
        }
        self.persist(&updated)?;
        *lease = updated.clone();
        drop(lease);

        self.audit.record_committed(
            updated.id,
            AuditAction::LeaseCosigned {
                role: input.role,
                signer_id: input.signer_id.clone(),
            },
        );
        tracing::info!(lease = %updated.id, role = %input.role, signer = %input.signer_id, "lease cosigned");
        if updated.is_sealed() {
            self.audit.record_committed(updated.id, AuditAction::LeaseSealed);
            tracing::info!(lease = %updated.id, "lease sealed");
        }
        Ok(updated)
    }

    /// Check whether a lease is usable now.
    ///
    /// Expiry is checked first, then each required role; the first failure
    /// is reported.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown lease.
    pub fn verify(&self, lease_id: LeaseId) -> Result<Verification> {
        let lease = self.cell(lease_id)?.read().clone();
        let now = self.clock.now();

        let mut valid_roles = Vec::new();
        let mut reason = lease.is_expired_at(now).then_some(UnusableReason::Expired);
        for role in Role::REQUIRED {
            let verdict = match lease.cosigner(role) {
                None => Err(UnusableReason::MissingRole(role)),
                Some(c) if self.signature_holds(&lease, c) => Ok(()),
                Some(_) => Err(UnusableReason::InvalidSignature(role)),
            };
            match verdict {
                Ok(()) => valid_roles.push(role),
                Err(r) => {
                    reason.get_or_insert(r);
                }
            }
        }

        tracing::debug!(lease = %lease_id, usable = reason.is_none(), ?reason, "lease verified");
        Ok(Verification {
            lease_id,
            usable: reason.is_none(),
            reason,
            expires_at: lease.expires_at,
            valid_roles,
        })
    }

    /// The lease, if it is usable now
    ///
    /// # Errors
    /// Returns `AuthorizationError::LeaseNotUsable` with the precise reason.
    pub fn require_usable(&self, lease_id: LeaseId) -> Result<Lease> {
        let verification = self.verify(lease_id)?;
        match verification.reason {
            None => self.get(lease_id),
            Some(reason) => Err(AuthorizationError::LeaseNotUsable { lease_id, reason }.into()),
        }
    }

    /// Look up a lease
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown lease.
    pub fn get(&self, lease_id: LeaseId) -> Result<Lease> {
        Ok(self.cell(lease_id)?.read().clone())
    }

    /// All leases, oldest id first
    #[must_use]
    pub fn list(&self) -> Vec<Lease> {
        self.documents.lock().values().cloned().collect()
    }

    fn signature_holds(&self, lease: &Lease, cosigner: &Cosigner) -> bool {
        self.directory.get(&cosigner.signer_id).is_some_and(|p| {
            p.role == cosigner.role
                && self.verifier.verify(
                    &p.public_key,
                    &lease.signing_message(cosigner.role),
                    &cosigner.signature,
                )
        })
    }

    fn cell(&self, lease_id: LeaseId) -> Result<Arc<RwLock<Lease>>> {
        self.leases
            .get(&lease_id)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| GuardrailError::not_found(EntityKind::Lease, lease_id))
    }

    fn persist(&self, lease: &Lease) -> Result<()> {
        let mut documents = self.documents.lock();
        let previous = documents.insert(lease.id, lease.clone());
        let all: Vec<&Lease> = documents.values().collect();
        if let Err(e) = save_json(self.store.as_ref(), Collection::Leases, &all) {
            match previous {
                Some(previous) => documents.insert(lease.id, previous),
                None => documents.remove(&lease.id),
            };
            return Err(e.into());
        }
        Ok(())
    }
}

#[allow(clippy::cast_possible_wrap)]
fn secs(s: u64) -> Duration {
    // chrono rejects durations beyond i64::MAX milliseconds
    Duration::seconds(s.min(i64::MAX as u64 / 1_000) as i64)
}
