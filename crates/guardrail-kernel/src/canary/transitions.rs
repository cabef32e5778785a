//! Tier state machine
//!
//! Rollouts only move forward through the traffic tiers, or sideways into
//! `halted` / `rolled_back`. There is no transition back to a lower tier.

use guardrail_core::{RolloutError, Tier};

/// Validates a tier transition.
///
/// # Errors
/// Returns `RolloutError::IllegalTransition` if `from -> to` is not allowed.
pub fn validate_transition(from: Tier, to: Tier) -> Result<(), RolloutError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(RolloutError::IllegalTransition { from, to })
    }
}

/// Tiers reachable from `from`
#[must_use]
pub fn allowed_transitions(from: Tier) -> &'static [Tier] {
    use Tier::*;
    match from {
        Pending => &[Tier5, Halted],
        Tier5 => &[Tier25, Halted],
        Tier25 => &[Tier100, Halted],
        Tier100 => &[Complete, Halted],
        // A completed change can still be reverted.
        Complete => &[RolledBack],
        Halted => &[RolledBack],
        RolledBack => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [Tier; 7] = [
        Tier::Pending,
        Tier::Tier5,
        Tier::Tier25,
        Tier::Tier100,
        Tier::Complete,
        Tier::Halted,
        Tier::RolledBack,
    ];

    #[test]
    fn forward_path_is_legal() {
        let mut tier = Tier::Pending;
        while let Some(next) = tier.next() {
            assert!(validate_transition(tier, next).is_ok());
            tier = next;
        }
        assert_eq!(tier, Tier::Complete);
    }

    #[test]
    fn no_skipping_or_reversing() {
        assert!(validate_transition(Tier::Tier5, Tier::Tier100).is_err());
        assert!(validate_transition(Tier::Tier25, Tier::Tier5).is_err());
        assert!(validate_transition(Tier::Halted, Tier::Tier5).is_err());
        assert!(validate_transition(Tier::RolledBack, Tier::Halted).is_err());
    }

    proptest! {
        #[test]
        fn prop_rank_never_decreases(from in prop::sample::select(ALL.to_vec()), to in prop::sample::select(ALL.to_vec())) {
            if validate_transition(from, to).is_ok() {
                if let (Some(a), Some(b)) = (from.rank(), to.rank()) {
                    prop_assert!(b > a);
                }
                prop_assert!(!from.is_terminal() || to == Tier::RolledBack);
            }
        }
    }
}
