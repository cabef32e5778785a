//! Error types for the guardrail pipeline
//!
//! The taxonomy follows how callers must react:
//! - [`InputError`]: malformed input, rejected before any state is touched
//! - [`AuthorizationError`]: missing reviews/signatures, audited and surfaced
//! - [`RolloutError`]: illegal canary operations
//! - [`RollbackError`]: reverting a lease failed
//! - [`StoreError`]: persistence failures
//!
//! Live-health breaches are deliberately absent: a breach is a `halted`
//! rollout, not an error.

use crate::hash::ContentHash;
use crate::types::{IntentStatus, LeaseId, ReviewClass, Role, Tier};
use std::fmt;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum GuardrailError {
    /// Malformed caller input
    #[error("invalid input: {0}")]
    Input(#[from] InputError),

    /// Review or signature requirements not met
    #[error("authorization failed: {0}")]
    Authorization(#[from] AuthorizationError),

    /// Illegal rollout operation
    #[error("rollout error: {0}")]
    Rollout(#[from] RolloutError),

    /// Rollback failed
    #[error("rollback error: {0}")]
    Rollback(#[from] RollbackError),

    /// Persistence failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration rejected
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Entity does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    /// Status change not allowed by the lifecycle
    #[error("illegal transition for intent: {from} -> {to}")]
    InvalidTransition { from: IntentStatus, to: IntentStatus },

    /// Deployment target failure outside a rollback
    #[error("deployment target error: {0}")]
    Target(String),
}

impl GuardrailError {
    /// Build a not-found error
    #[inline]
    pub fn not_found(kind: EntityKind, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether the error is an authorization rejection
    #[inline]
    #[must_use]
    pub fn is_authorization(&self) -> bool {
        matches!(self, Self::Authorization(_))
    }

    /// Stable tag for audit records and command responses
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Input(_) => "input",
            Self::Authorization(e) => e.kind(),
            Self::Rollout(e) => e.kind(),
            Self::Rollback(RollbackError::NoRollbackPack(_)) => "no_rollback_pack",
            Self::Rollback(_) => "rollback",
            Self::Store(_) => "store",
            Self::Config(_) => "config",
            Self::NotFound { .. } => "not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Target(_) => "target",
        }
    }
}

/// Kinds of addressable entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Intent,
    Lease,
    Rollout,
    RollbackPack,
    Principal,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Intent => "intent",
            Self::Lease => "lease",
            Self::Rollout => "rollout",
            Self::RollbackPack => "rollback pack",
            Self::Principal => "principal",
        })
    }
}

/// Malformed input
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    #[error("malformed identifier: {0}")]
    MalformedId(String),

    #[error("malformed intent: {0}")]
    MalformedIntent(String),

    #[error("malformed review: {0}")]
    MalformedReview(String),

    #[error("malformed lease request: {0}")]
    MalformedLease(String),

    #[error("malformed cosignature: {0}")]
    MalformedCosignature(String),

    #[error("malformed execution record: {0}")]
    MalformedRecord(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("lease scope exceeds the intent's declared scope")]
    ScopeExceedsIntent,

    #[error("unsupported message schema version {found} (expected {expected})")]
    UnsupportedSchemaVersion { found: u16, expected: u16 },
}

/// Why a lease cannot be used right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "role")]
pub enum UnusableReason {
    /// No valid cosignature for this role
    MissingRole(Role),
    /// Past its TTL
    Expired,
    /// A stored cosignature no longer verifies
    InvalidSignature(Role),
}

impl fmt::Display for UnusableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingRole(role) => write!(f, "missing {role} cosignature"),
            Self::Expired => f.write_str("lease expired"),
            Self::InvalidSignature(role) => write!(f, "{role} cosignature does not verify"),
        }
    }
}

/// Authorization failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthorizationError {
    #[error("lease {lease_id} not usable: {reason}")]
    LeaseNotUsable {
        lease_id: LeaseId,
        reason: UnusableReason,
    },

    #[error("invalid {role} signature from {signer_id} on lease {lease_id}")]
    InvalidSignature {
        lease_id: LeaseId,
        role: Role,
        signer_id: String,
    },

    #[error("lease {lease_id} already has a {role} cosigner")]
    DuplicateRole { lease_id: LeaseId, role: Role },

    #[error("review incomplete, missing passing review from: {}", format_classes(.missing))]
    IncompleteReview { missing: Vec<ReviewClass> },

    #[error("unknown principal {0}")]
    UnknownPrincipal(String),

    #[error("principal {signer_id} is declared as {declared}, cannot sign as {claimed}")]
    RoleMismatch {
        signer_id: String,
        declared: Role,
        claimed: Role,
    },

    #[error("lease {0} is sealed and accepts no further cosignatures")]
    LeaseSealed(LeaseId),

    #[error("intent is {status}, a lease needs an approved intent")]
    IntentNotApproved { status: IntentStatus },
}

impl AuthorizationError {
    /// Stable tag
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LeaseNotUsable { .. } => "lease_not_usable",
            Self::InvalidSignature { .. } => "invalid_signature",
            Self::DuplicateRole { .. } => "duplicate_role",
            Self::IncompleteReview { .. } => "incomplete_review",
            Self::UnknownPrincipal(_) => "unknown_principal",
            Self::RoleMismatch { .. } => "role_mismatch",
            Self::LeaseSealed(_) => "lease_sealed",
            Self::IntentNotApproved { .. } => "intent_not_approved",
        }
    }
}

fn format_classes(classes: &[ReviewClass]) -> String {
    classes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Illegal canary operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RolloutError {
    #[error("illegal tier transition: {from} -> {to}")]
    IllegalTransition { from: Tier, to: Tier },

    #[error("observation window not elapsed, {remaining_secs}s remaining")]
    ObservationPending { remaining_secs: u64 },

    #[error("rollout for lease {0} is paused")]
    Paused(LeaseId),

    #[error("rollout for lease {0} already started")]
    AlreadyStarted(LeaseId),

    #[error("lease {0} is blocked after a failed rollback")]
    LeaseBlocked(LeaseId),

    #[error("promotion abandoned, rollout for lease {0} was halted")]
    PromotionAbandoned(LeaseId),

    #[error("no health sample available for lease {0}")]
    NoHealthData(LeaseId),

    #[error("live health of lease {0} breaches a halt threshold")]
    HealthBreach(LeaseId),

    #[error("AGII status is red, promotion of lease {0} refused")]
    GovernanceRed(LeaseId),
}

impl RolloutError {
    /// Stable tag
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::IllegalTransition { .. } => "illegal_transition",
            Self::ObservationPending { .. } => "observation_pending",
            Self::Paused(_) => "paused",
            Self::AlreadyStarted(_) => "already_started",
            Self::LeaseBlocked(_) => "lease_blocked",
            Self::PromotionAbandoned(_) => "promotion_abandoned",
            Self::NoHealthData(_) => "no_health_data",
            Self::HealthBreach(_) => "health_breach",
            Self::GovernanceRed(_) => "governance_red",
        }
    }
}

/// Rollback failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RollbackError {
    #[error("no rollback pack for lease {0}")]
    NoRollbackPack(LeaseId),

    #[error("post-rollback state {actual} does not match prior state {expected}")]
    VerificationFailed {
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("rollback pack for lease {0} failed its content hash check")]
    CorruptPack(LeaseId),

    #[error("deployment target rejected the reverse change: {0}")]
    Target(String),
}

/// Persistence failures
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A hash-chained collection does not verify
    #[error("{collection} chain broken at sequence {sequence}")]
    Integrity {
        collection: &'static str,
        sequence: u64,
    },
}

/// Configuration failures
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Validation(String),
}

/// Result alias
pub type Result<T, E = GuardrailError> = std::result::Result<T, E>;
