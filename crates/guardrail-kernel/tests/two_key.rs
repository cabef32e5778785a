//! No single principal can make a lease usable

use guardrail_core::{AuthorizationError, GuardrailError, Role, UnusableReason};
use guardrail_kernel::lease::CosignatureInput;
use guardrail_test_utils::{TestHarness, TestPrincipal};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Attempt {
    Human,
    Agent,
    /// The human key signing as the agent role
    HumanAsAgent,
    /// A forged agent signature
    ForgedAgent,
}

fn attempt() -> impl Strategy<Value = Attempt> {
    prop_oneof![
        Just(Attempt::Human),
        Just(Attempt::Agent),
        Just(Attempt::HumanAsAgent),
        Just(Attempt::ForgedAgent),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_usable_only_with_both_genuine_roles(attempts in prop::collection::vec(attempt(), 0..6)) {
        let h = TestHarness::new();
        let lease = h.issued_lease().lease;
        let leases = h.pipeline.leases();
        let forger = TestPrincipal::generate("mallory", Role::Agent);

        let mut human_signed = false;
        let mut agent_signed = false;
        for attempt in attempts {
            let input = match attempt {
                Attempt::Human => h.human.cosign(&lease),
                Attempt::Agent => h.agent.cosign(&lease),
                Attempt::HumanAsAgent => CosignatureInput::ed25519(&lease, Role::Agent, &h.human.id, &h.human.key),
                Attempt::ForgedAgent => CosignatureInput::ed25519(&lease, Role::Agent, &h.agent.id, &forger.key),
            };
            let result = leases.cosign(input);
            match attempt {
                Attempt::Human if !human_signed => {
                    prop_assert!(result.is_ok());
                    human_signed = true;
                }
                Attempt::Agent if !agent_signed => {
                    prop_assert!(result.is_ok());
                    agent_signed = true;
                }
                _ => prop_assert!(result.is_err()),
            }
        }

        let verification = leases.verify(lease.id).unwrap();
        prop_assert_eq!(verification.usable, human_signed && agent_signed);
        prop_assert_eq!(leases.get(lease.id).unwrap().is_sealed(), human_signed && agent_signed);
    }
}

#[test]
fn one_principal_cannot_fill_both_roles() {
    let h = TestHarness::new();
    let lease = h.issued_lease().lease;
    let leases = h.pipeline.leases();

    leases.cosign(h.human.cosign(&lease)).unwrap();
    let err = leases
        .cosign(CosignatureInput::ed25519(&lease, Role::Agent, &h.human.id, &h.human.key))
        .unwrap_err();
    assert!(matches!(
        err,
        GuardrailError::Authorization(AuthorizationError::RoleMismatch { .. })
    ));

    let verification = leases.verify(lease.id).unwrap();
    assert!(!verification.usable);
    assert_eq!(verification.reason, Some(UnusableReason::MissingRole(Role::Agent)));
    assert_eq!(verification.valid_roles, vec![Role::Human]);
}

#[test]
fn sealed_lease_rejects_further_cosigners() {
    let h = TestHarness::new();
    let lease = h.cosigned_lease();
    let err = h.pipeline.leases().cosign(h.human.cosign(&lease)).unwrap_err();
    assert_eq!(err.kind(), "lease_sealed");
}
