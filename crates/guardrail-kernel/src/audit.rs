//! Audit trail
//!
//! Every state transition and every rejected authorization attempt is
//! recorded as an [`AuditRecord`]. Records are hash-chained and appended to
//! a JSON-lines log, so the trail survives restarts and tampering is
//! detectable. A trail whose chain does not verify is refused at open.
//!
//! Services commit their own state first and then record it with
//! [`AuditTrail::record_committed`]; a failed audit write cannot undo a
//! committed change, so it is logged rather than returned.

use crate::store::{append_json_line, load_json_lines, save_json_lines, Collection, StateStore};
use chrono::{DateTime, Utc};
use guardrail_core::{
    Clock, ContentHash, GuardrailError, IntentStatus, ReviewClass, Role, StoreError, Tier, Verdict,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum AuditAction {
    IntentCreated,
    IntentTransition {
        from: IntentStatus,
        to: IntentStatus,
    },
    ReviewAttached {
        reviewer: String,
        class: ReviewClass,
        verdict: Verdict,
    },
    /// An authorization check failed; nothing was mutated
    AuthorizationRejected { kind: String, detail: String },
    PrincipalRegistered { principal: String, role: Role },
    LeaseIssued,
    LeaseCosigned { role: Role, signer_id: String },
    LeaseSealed,
    RollbackPackCaptured { prior_state: ContentHash },
    RolloutTransition { from: Tier, to: Tier },
    RolloutPaused,
    RolloutResumed,
    RolloutHalted { reason: String },
    RollbackCompleted { post_state: ContentHash },
    RollbackFailed { kind: String, detail: String },
    LeaseBlocked,
}

/// One chained entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// Entity the record is about (intent, lease or principal id)
    pub subject: String,
    pub action: AuditAction,
    pub prev_hash: ContentHash,
    pub hash: ContentHash,
}

/// Integrity failure of the chain
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("audit chain broken at sequence {sequence}")]
pub struct AuditIntegrityError {
    pub sequence: u64,
}

/// Append-only, persisted audit trail
#[derive(Debug)]
pub struct AuditTrail {
    records: Mutex<Vec<AuditRecord>>,
    /// An append failed and may have left a partial line behind
    repair: AtomicBool,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl AuditTrail {
    /// Restore and verify the trail from `store`.
    ///
    /// A torn final line left by an interrupted append is dropped and the
    /// log rewritten without it.
    ///
    /// # Errors
    /// Returns an error if the stored trail cannot be read, or
    /// `StoreError::Integrity` if its hash chain does not verify.
    pub fn open(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let lines = load_json_lines::<AuditRecord>(store.as_ref(), Collection::Audit)?;
        let records = lines.items;
        verify_chain(&records).map_err(|e| StoreError::Integrity {
            collection: "audit",
            sequence: e.sequence,
        })?;
        if lines.torn {
            tracing::warn!(records = records.len(), "dropping torn audit tail");
            save_json_lines(store.as_ref(), Collection::Audit, &records)?;
        }
        Ok(Self {
            records: Mutex::new(records),
            repair: AtomicBool::new(false),
            store,
            clock,
        })
    }

    /// Append and persist a record, returning its sequence
    ///
    /// # Errors
    /// Returns an error if the record could not be persisted; the in-memory
    /// trail is left unchanged in that case.
    pub fn record(&self, subject: impl ToString, action: AuditAction) -> Result<u64, StoreError> {
        let mut records = self.records.lock();
        let sequence = records.len() as u64;
        let prev_hash = records.last().map_or_else(|| ContentHash::new([0; 32]), |r| r.hash);
        let mut record = AuditRecord {
            sequence,
            timestamp: self.clock.now(),
            subject: subject.to_string(),
            action,
            prev_hash,
            hash: ContentHash::new([0; 32]),
        };
        record.hash = compute_hash(&record);
        if self.repair.load(Ordering::Acquire) {
            save_json_lines(self.store.as_ref(), Collection::Audit, &records)?;
            self.repair.store(false, Ordering::Release);
            tracing::info!(records = records.len(), "audit log rewritten after failed append");
        }
        if let Err(e) = append_json_line(self.store.as_ref(), Collection::Audit, &record) {
            self.repair.store(true, Ordering::Release);
            return Err(e);
        }
        records.push(record);
        Ok(sequence)
    }

    /// Record a change its service already committed.
    ///
    /// Persistence failures are logged; the change stands either way.
    pub fn record_committed(&self, subject: impl ToString, action: AuditAction) {
        let subject = subject.to_string();
        if let Err(e) = self.record(&subject, action) {
            tracing::error!(%subject, error = %e, "failed to persist audit record");
        }
    }

    /// Record a rejected authorization attempt
    ///
    /// Persistence failures are logged, the original error is what the caller
    /// reports.
    pub fn rejection(&self, subject: impl ToString, error: &GuardrailError) {
        let subject = subject.to_string();
        tracing::warn!(%subject, kind = error.kind(), %error, "authorization rejected");
        let action = AuditAction::AuthorizationRejected {
            kind: error.kind().to_string(),
            detail: error.to_string(),
        };
        self.record_committed(subject, action);
    }

    /// All records, oldest first
    #[must_use]
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    /// Records about one subject
    #[must_use]
    pub fn for_subject(&self, subject: &str) -> Vec<AuditRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.subject == subject)
            .cloned()
            .collect()
    }

    /// Number of records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Re-walk the chain
    ///
    /// # Errors
    /// Returns the first record whose links do not match.
    pub fn verify_integrity(&self) -> Result<(), AuditIntegrityError> {
        verify_chain(&self.records.lock())
    }
}

/// Verify a chain of records read from anywhere
///
/// # Errors
/// Returns the first record whose links do not match.
pub fn verify_chain(records: &[AuditRecord]) -> Result<(), AuditIntegrityError> {
    let mut prev = ContentHash::new([0; 32]);
    for (expected_sequence, record) in (0u64..).zip(records) {
        if record.sequence != expected_sequence
            || record.prev_hash != prev
            || record.hash != compute_hash(record)
        {
            return Err(AuditIntegrityError {
                sequence: record.sequence,
            });
        }
        prev = record.hash;
    }
    Ok(())
}

fn compute_hash(record: &AuditRecord) -> ContentHash {
    // AuditAction is plain data and always serializes.
    let action = serde_json::to_vec(&record.action).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(record.sequence.to_le_bytes());
    hasher.update(record.timestamp.timestamp_micros().to_le_bytes());
    hasher.update(record.subject.as_bytes());
    hasher.update([0]);
    hasher.update(&action);
    hasher.update([0]);
    hasher.update(record.prev_hash.as_bytes());
    ContentHash::new(hasher.finalize().into())
}
