//! The audit chain records every step and detects edits

use guardrail_core::{
    GuardrailConfig, IntentStatus, RiskTier, StoreError, SystemClock, Tier,
};
use guardrail_kernel::audit::{verify_chain, AuditAction, AuditRecord, AuditTrail};
use guardrail_kernel::store::{
    load_json_lines, save_json_lines, Collection, JsonLines, MemoryStore, StateStore,
};
use guardrail_test_utils::TestHarness;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Store whose audit log refuses writes while `down` is set
#[derive(Debug, Default)]
struct AuditOutage {
    inner: MemoryStore,
    down: AtomicBool,
}

impl AuditOutage {
    fn check(&self, collection: Collection) -> Result<(), StoreError> {
        if collection == Collection::Audit && self.down.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("audit volume offline").into());
        }
        Ok(())
    }
}

impl StateStore for AuditOutage {
    fn load(&self, collection: Collection) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.load(collection)
    }
    fn save(&self, collection: Collection, bytes: &[u8]) -> Result<(), StoreError> {
        self.check(collection)?;
        self.inner.save(collection, bytes)
    }
    fn append(&self, collection: Collection, line: &[u8]) -> Result<(), StoreError> {
        self.check(collection)?;
        self.inner.append(collection, line)
    }
}

#[test]
fn lease_lifecycle_is_chained() {
    let h = TestHarness::new();
    let lease_id = h.started_rollout();
    let audit = h.pipeline.audit();
    audit.verify_integrity().unwrap();

    let actions: Vec<AuditAction> = audit
        .for_subject(&lease_id.to_string())
        .into_iter()
        .map(|r| r.action)
        .collect();
    assert!(matches!(actions[0], AuditAction::RollbackPackCaptured { .. }));
    assert!(matches!(actions[1], AuditAction::LeaseIssued));
    assert!(actions.iter().any(|a| matches!(a, AuditAction::LeaseSealed)));
    assert!(matches!(actions.last(), Some(AuditAction::RolloutTransition { .. })));

    let sequences: Vec<u64> = audit.records().iter().map(|r| r.sequence).collect();
    let expected: Vec<u64> = (0..sequences.len() as u64).collect();
    assert_eq!(sequences, expected);
}

#[test]
fn edited_record_is_refused_on_restart() {
    let h = TestHarness::new();
    h.started_rollout();

    let lines: JsonLines<AuditRecord> = load_json_lines(h.store.as_ref(), Collection::Audit).unwrap();
    let mut records = lines.items;
    assert_eq!(records.len(), h.pipeline.audit().len());
    assert!(verify_chain(&records).is_ok());
    records[2].subject = "someone-else".to_string();
    save_json_lines(h.store.as_ref(), Collection::Audit, &records).unwrap();

    let err = AuditTrail::open(Arc::clone(&h.store), Arc::new(SystemClock)).unwrap_err();
    assert!(matches!(err, StoreError::Integrity { sequence: 2, .. }));
}

#[tokio::test]
async fn audit_outage_does_not_undo_committed_changes() {
    let store = Arc::new(AuditOutage::default());
    let h = TestHarness::with_store(GuardrailConfig::default(), Arc::clone(&store) as _);
    let lease_id = h.started_rollout();
    let recorded = h.pipeline.audit().len();

    store.down.store(true, Ordering::SeqCst);
    let intent = h
        .pipeline
        .registry()
        .create_intent("planner", RiskTier::Low, TestHarness::scope(), "runbooks/rollback.md")
        .unwrap();
    h.advance_secs(600);
    let state = h.pipeline.canary().approve_next_tier(lease_id).await.unwrap();
    assert_eq!(state.tier, Tier::Tier25);
    assert_eq!(h.pipeline.audit().len(), recorded);

    store.down.store(false, Ordering::SeqCst);
    let restarted = h.reopen();
    assert_eq!(restarted.pipeline.registry().get(intent.id).unwrap().status, IntentStatus::Draft);
    assert_eq!(restarted.pipeline.canary().state(lease_id).unwrap().tier, Tier::Tier25);
    assert_eq!(restarted.pipeline.audit().len(), recorded);
    restarted.pipeline.audit().verify_integrity().unwrap();
}

#[test]
fn dropped_record_breaks_the_chain() {
    let h = TestHarness::new();
    h.started_rollout();

    let mut records = h.pipeline.audit().records();
    records.remove(1);
    let err = verify_chain(&records).unwrap_err();
    assert_eq!(err.sequence, 2);
}
