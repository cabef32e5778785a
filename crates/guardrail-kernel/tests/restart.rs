//! State survives a process restart over a file store

use guardrail_core::{GuardrailConfig, Role, Tier};
use guardrail_kernel::rollback::DeploymentTarget;
use guardrail_kernel::store::{FileStore, StateStore};
use guardrail_test_utils::TestHarness;
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn file_harness(dir: &tempfile::TempDir) -> TestHarness {
    let store: Arc<dyn StateStore> = Arc::new(FileStore::open(dir.path()).unwrap());
    TestHarness::with_store(GuardrailConfig::default(), store)
}

#[tokio::test]
async fn rollout_resumes_where_it_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let h = file_harness(&dir);
    let lease_id = h.started_rollout();
    h.advance_secs(600);
    h.pipeline.canary().approve_next_tier(lease_id).await.unwrap();
    let pack = h.pipeline.rollback().pack(lease_id).unwrap();
    let audit_len = h.pipeline.audit().len();

    let restarted = h.reopen();

    let state = restarted.pipeline.canary().state(lease_id).unwrap();
    assert_eq!(state.tier, Tier::Tier25);
    assert_eq!(restarted.target.traffic(lease_id), 25);

    let lease = restarted.pipeline.leases().get(lease_id).unwrap();
    assert!(lease.is_sealed());
    let roles: Vec<Role> = lease.cosigners.iter().map(|c| c.role).collect();
    assert!(roles.contains(&Role::Human) && roles.contains(&Role::Agent));
    assert!(restarted.pipeline.leases().verify(lease_id).unwrap().usable);

    assert_eq!(*restarted.pipeline.rollback().pack(lease_id).unwrap(), *pack);
    assert_eq!(restarted.pipeline.audit().len(), audit_len);
    restarted.pipeline.audit().verify_integrity().unwrap();

    // The restored observation window still counts from the tier change
    restarted.advance_secs(900);
    let state = restarted.pipeline.canary().approve_next_tier(lease_id).await.unwrap();
    assert_eq!(state.tier, Tier::Tier100);
}

#[test]
fn rollback_after_restart_restores_prior_state() {
    let dir = tempfile::tempdir().unwrap();
    let h = file_harness(&dir);
    let before = h.target.current_state().unwrap();
    let lease_id = h.started_rollout();

    let restarted = h.reopen();
    assert_eq!(restarted.target.current_state().unwrap(), h.target.current_state().unwrap());
    let state = restarted.pipeline.canary().rollback(lease_id).unwrap();
    assert_eq!(state.tier, Tier::RolledBack);
    assert_eq!(restarted.target.current_state().unwrap(), before);
}
