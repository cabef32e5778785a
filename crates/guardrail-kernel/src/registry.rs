//! Intent registry
//!
//! Tracks proposed changes through their lifecycle:
//!
//! ```text
//! draft -> proposed -> under_review -> approved -> implemented -> rolled_back
//!                   \              \-> rejected    \-> rolled_back
//!                    \-> rejected
//! ```
//!
//! Approval requires a passing security review and a passing correctness
//! review from two different reviewers. Every transition is appended to the
//! intent's history and to the audit trail.

use crate::audit::{AuditAction, AuditTrail};
use crate::store::{load_json, save_json, Collection, StateStore};
use chrono::{DateTime, Utc};
use guardrail_core::{
    AuthorizationError, Clock, EntityKind, GuardrailError, InputError, IntentId, IntentStatus,
    Result, ReviewClass, ReviewId, RiskTier, Scope, Verdict,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// One review verdict attached to an intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub id: ReviewId,
    pub reviewer: String,
    pub class: ReviewClass,
    pub verdict: Verdict,
    #[serde(default)]
    pub findings: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Entry in an intent's status history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentTransition {
    /// `None` for creation
    pub from: Option<IntentStatus>,
    pub to: IntentStatus,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// A proposed change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub id: IntentId,
    pub proposer: String,
    pub risk_tier: RiskTier,
    pub scope: Scope,
    /// Reference to the rollback plan the proposer committed to
    pub rollback_plan_ref: String,
    pub status: IntentStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub reviews: Vec<Review>,
    pub history: Vec<IntentTransition>,
}

impl Intent {
    /// The latest verdict per reviewer and class
    fn current_verdicts(&self) -> BTreeMap<(&str, ReviewClass), Verdict> {
        let mut verdicts = BTreeMap::new();
        for review in &self.reviews {
            verdicts.insert((review.reviewer.as_str(), review.class), review.verdict);
        }
        verdicts
    }

    /// Review classes still lacking an independent passing review.
    ///
    /// A single reviewer passing both classes satisfies security only; an
    /// independent correctness review is then still required.
    #[must_use]
    pub fn missing_reviews(&self) -> Vec<ReviewClass> {
        let verdicts = self.current_verdicts();
        let passing = |class: ReviewClass| -> BTreeSet<&str> {
            verdicts
                .iter()
                .filter(|((_, c), v)| *c == class && **v == Verdict::Pass)
                .map(|((reviewer, _), _)| *reviewer)
                .collect()
        };
        let security = passing(ReviewClass::Security);
        let correctness = passing(ReviewClass::Correctness);

        let mut missing = Vec::new();
        if security.is_empty() {
            missing.push(ReviewClass::Security);
        }
        if correctness.is_empty() {
            missing.push(ReviewClass::Correctness);
        }
        if missing.is_empty() {
            let independent = security
                .iter()
                .any(|s| correctness.iter().any(|c| c != s));
            if !independent {
                missing.push(ReviewClass::Correctness);
            }
        }
        missing
    }
}

/// Registry of intents
#[derive(Debug)]
pub struct IntentRegistry {
    intents: RwLock<BTreeMap<IntentId, Intent>>,
    audit: Arc<AuditTrail>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl IntentRegistry {
    /// Restore the registry from `store`
    ///
    /// # Errors
    /// Returns an error if the stored intents cannot be read.
    pub fn open(
        store: Arc<dyn StateStore>,
        audit: Arc<AuditTrail>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let intents: Vec<Intent> = load_json(store.as_ref(), Collection::Intents)?.unwrap_or_default();
        Ok(Self {
            intents: RwLock::new(intents.into_iter().map(|i| (i.id, i)).collect()),
            audit,
            store,
            clock,
        })
    }

    /// Register a new intent in `draft`
    ///
    /// # Errors
    /// Returns `InputError::MalformedIntent` on an empty proposer, scope or
    /// rollback plan reference.
    pub fn create_intent(
        &self,
        proposer: &str,
        risk_tier: RiskTier,
        scope: Scope,
        rollback_plan_ref: &str,
    ) -> Result<Intent> {
        if proposer.trim().is_empty() {
            return Err(InputError::MalformedIntent("proposer is empty".into()).into());
        }
        if scope.is_empty() {
            return Err(InputError::MalformedIntent("scope grants nothing".into()).into());
        }
        if rollback_plan_ref.trim().is_empty() {
            return Err(InputError::MalformedIntent("rollback plan reference is empty".into()).into());
        }

        let now = self.clock.now();
        let intent = Intent {
            id: IntentId::new(),
            proposer: proposer.to_string(),
            risk_tier,
            scope,
            rollback_plan_ref: rollback_plan_ref.to_string(),
            status: IntentStatus::Draft,
            created_at: now,
            reviews: Vec::new(),
            history: vec![IntentTransition {
                from: None,
                to: IntentStatus::Draft,
                at: now,
                note: None,
            }],
        };

        let mut intents = self.intents.write();
        intents.insert(intent.id, intent.clone());
        if let Err(e) = self.persist(&intents) {
            intents.remove(&intent.id);
            return Err(e);
        }
        drop(intents);

        self.audit.record_committed(intent.id, AuditAction::IntentCreated);
        tracing::info!(intent = %intent.id, proposer, risk = ?risk_tier, "intent drafted");
        Ok(intent)
    }

    /// Submit a draft for review, moving it to `proposed`
    ///
    /// # Errors
    /// Returns `InvalidTransition` unless the intent is a `draft`.
    pub fn submit_for_review(&self, id: IntentId) -> Result<Intent> {
        self.transition(id, IntentStatus::Proposed, None)
    }

    /// Attach a review; a proposed intent moves to `under_review`.
    ///
    /// A later review by the same reviewer for the same class supersedes the
    /// earlier one.
    ///
    /// # Errors
    /// Returns `InputError::MalformedReview` on an empty reviewer and
    /// `InvalidTransition` for a draft that was never submitted or once
    /// review has closed.
    pub fn attach_review(
        &self,
        id: IntentId,
        reviewer: &str,
        class: ReviewClass,
        verdict: Verdict,
        findings: Vec<String>,
    ) -> Result<Review> {
        if reviewer.trim().is_empty() {
            return Err(InputError::MalformedReview("reviewer is empty".into()).into());
        }
        let review = Review {
            id: ReviewId::new(),
            reviewer: reviewer.to_string(),
            class,
            verdict,
            findings,
            timestamp: self.clock.now(),
        };
        let attached = review.clone();
        self.update(id, move |intent| {
            if !matches!(intent.status, IntentStatus::Proposed | IntentStatus::UnderReview) {
                return Err(invalid(intent.status, IntentStatus::UnderReview));
            }
            intent.reviews.push(attached);
            if intent.status == IntentStatus::Proposed {
                Ok(Some((IntentStatus::UnderReview, None)))
            } else {
                Ok(None)
            }
        })?;

        self.audit.record_committed(
            id,
            AuditAction::ReviewAttached {
                reviewer: review.reviewer.clone(),
                class,
                verdict,
            },
        );
        tracing::info!(intent = %id, reviewer, %class, ?verdict, "review attached");
        Ok(review)
    }

    /// Approve an intent under review
    ///
    /// # Errors
    /// Returns `AuthorizationError::IncompleteReview` naming the classes
    /// that still lack an independent passing review (audited), or
    /// `InvalidTransition` if the intent is not under review.
    pub fn approve(&self, id: IntentId) -> Result<Intent> {
        let result = self.update(id, |intent| {
            if intent.status != IntentStatus::UnderReview {
                return Err(invalid(intent.status, IntentStatus::Approved));
            }
            let missing = intent.missing_reviews();
            if !missing.is_empty() {
                return Err(AuthorizationError::IncompleteReview { missing }.into());
            }
            Ok(Some((IntentStatus::Approved, None)))
        });
        if let Err(e) = &result {
            if e.is_authorization() {
                self.audit.rejection(id, e);
            }
        }
        result
    }

    /// Reject an intent that is proposed or under review
    ///
    /// # Errors
    /// Returns `InvalidTransition` from any other status.
    pub fn reject(&self, id: IntentId, reason: &str) -> Result<Intent> {
        let note = (!reason.trim().is_empty()).then(|| reason.to_string());
        self.update(id, |intent| {
            if !intent.status.can_transition_to(IntentStatus::Rejected) {
                return Err(invalid(intent.status, IntentStatus::Rejected));
            }
            Ok(Some((IntentStatus::Rejected, note)))
        })
    }

    /// Record that the change reached full rollout
    ///
    /// # Errors
    /// Returns `InvalidTransition` unless the intent is `approved`.
    pub fn mark_implemented(&self, id: IntentId) -> Result<Intent> {
        self.transition(id, IntentStatus::Implemented, None)
    }

    /// Record that the change was reverted
    ///
    /// # Errors
    /// Returns `InvalidTransition` unless the intent is `approved` or
    /// `implemented`.
    pub fn mark_rolled_back(&self, id: IntentId, note: Option<String>) -> Result<Intent> {
        self.transition(id, IntentStatus::RolledBack, note)
    }

    /// Look up an intent
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown id.
    pub fn get(&self, id: IntentId) -> Result<Intent> {
        self.intents
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| GuardrailError::not_found(EntityKind::Intent, id))
    }

    /// All intents, oldest id first
    #[must_use]
    pub fn list(&self) -> Vec<Intent> {
        self.intents.read().values().cloned().collect()
    }

    fn transition(&self, id: IntentId, to: IntentStatus, note: Option<String>) -> Result<Intent> {
        self.update(id, |intent| {
            if !intent.status.can_transition_to(to) {
                return Err(invalid(intent.status, to));
            }
            Ok(Some((to, note)))
        })
    }

    /// Apply `change` to a copy of the intent, persist, then commit.
    ///
    /// `change` returns the status to move to, if any. Nothing is mutated
    /// when it fails or when persistence fails.
    fn update<F>(&self, id: IntentId, change: F) -> Result<Intent>
    where
        F: FnOnce(&mut Intent) -> Result<Option<(IntentStatus, Option<String>)>>,
    {
        let mut intents = self.intents.write();
        let current = intents
            .get(&id)
            .ok_or_else(|| GuardrailError::not_found(EntityKind::Intent, id))?;
        let mut updated = current.clone();
        let from = updated.status;
        let moved = change(&mut updated)?;
        if let Some((to, note)) = &moved {
            updated.status = *to;
            if from != *to {
                updated.history.push(IntentTransition {
                    from: Some(from),
                    to: *to,
                    at: self.clock.now(),
                    note: note.clone(),
                });
            }
        }

        let previous = intents.insert(id, updated.clone());
        if let Err(e) = self.persist(&intents) {
            if let Some(previous) = previous {
                intents.insert(id, previous);
            }
            return Err(e);
        }
        drop(intents);

        if let Some((to, _)) = moved {
            if from != to {
                self.audit.record_committed(id, AuditAction::IntentTransition { from, to });
                tracing::info!(intent = %id, %from, %to, "intent transition");
            }
        }
        Ok(updated)
    }

    fn persist(&self, intents: &BTreeMap<IntentId, Intent>) -> Result<()> {
        let all: Vec<&Intent> = intents.values().collect();
        save_json(self.store.as_ref(), Collection::Intents, &all)?;
        Ok(())
    }
}

fn invalid(from: IntentStatus, to: IntentStatus) -> GuardrailError {
    GuardrailError::InvalidTransition { from, to }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use guardrail_core::SystemClock;
    use pretty_assertions::assert_eq;

    fn registry() -> (IntentRegistry, Arc<AuditTrail>, Arc<dyn StateStore>) {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let audit = Arc::new(AuditTrail::open(Arc::clone(&store), Arc::clone(&clock)).unwrap());
        let registry = IntentRegistry::open(Arc::clone(&store), Arc::clone(&audit), clock).unwrap();
        (registry, audit, store)
    }

    fn draft(registry: &IntentRegistry) -> Intent {
        registry
            .create_intent(
                "agent-7",
                RiskTier::Medium,
                Scope::new().with_path("services/api/"),
                "plans/api-revert.md",
            )
            .unwrap()
    }

    fn propose(registry: &IntentRegistry) -> Intent {
        let intent = draft(registry);
        registry.submit_for_review(intent.id).unwrap()
    }

    #[test]
    fn clean_approval_path() {
        let (registry, audit, _) = registry();
        let created = draft(&registry);
        assert_eq!(created.status, IntentStatus::Draft);
        assert_eq!(created.history.len(), 1);
        let intent = registry.submit_for_review(created.id).unwrap();
        assert_eq!(intent.status, IntentStatus::Proposed);

        registry
            .attach_review(intent.id, "alice", ReviewClass::Security, Verdict::Pass, vec![])
            .unwrap();
        registry
            .attach_review(intent.id, "bob", ReviewClass::Correctness, Verdict::Pass, vec![])
            .unwrap();
        let approved = registry.approve(intent.id).unwrap();
        assert_eq!(approved.status, IntentStatus::Approved);

        let statuses: Vec<_> = approved.history.iter().map(|t| t.to).collect();
        assert_eq!(
            statuses,
            vec![
                IntentStatus::Draft,
                IntentStatus::Proposed,
                IntentStatus::UnderReview,
                IntentStatus::Approved
            ]
        );
        assert!(audit.verify_integrity().is_ok());
    }

    #[test]
    fn draft_must_be_submitted_before_review() {
        let (registry, audit, _) = registry();
        let intent = draft(&registry);
        let err = registry
            .attach_review(intent.id, "alice", ReviewClass::Security, Verdict::Pass, vec![])
            .unwrap_err();
        assert!(matches!(
            err,
            GuardrailError::InvalidTransition {
                from: IntentStatus::Draft,
                to: IntentStatus::UnderReview
            }
        ));
        assert!(matches!(
            registry.approve(intent.id),
            Err(GuardrailError::InvalidTransition { from: IntentStatus::Draft, .. })
        ));
        let stored = registry.get(intent.id).unwrap();
        assert_eq!(stored.status, IntentStatus::Draft);
        assert!(stored.reviews.is_empty());
        assert!(!audit
            .records()
            .iter()
            .any(|r| matches!(r.action, AuditAction::ReviewAttached { .. })));

        registry.submit_for_review(intent.id).unwrap();
        assert!(matches!(
            registry.submit_for_review(intent.id),
            Err(GuardrailError::InvalidTransition { from: IntentStatus::Proposed, .. })
        ));
    }

    #[test]
    fn approval_names_missing_class() {
        let (registry, audit, _) = registry();
        let intent = propose(&registry);
        registry
            .attach_review(intent.id, "alice", ReviewClass::Security, Verdict::Pass, vec![])
            .unwrap();
        let err = registry.approve(intent.id).unwrap_err();
        assert!(matches!(
            err,
            GuardrailError::Authorization(AuthorizationError::IncompleteReview { ref missing })
                if missing == &vec![ReviewClass::Correctness]
        ));
        assert_eq!(registry.get(intent.id).unwrap().status, IntentStatus::UnderReview);
        assert!(audit
            .records()
            .iter()
            .any(|r| matches!(r.action, AuditAction::AuthorizationRejected { .. })));
    }

    #[test]
    fn one_reviewer_cannot_cover_both_classes() {
        let (registry, _, _) = registry();
        let intent = propose(&registry);
        for class in ReviewClass::REQUIRED {
            registry
                .attach_review(intent.id, "alice", class, Verdict::Pass, vec![])
                .unwrap();
        }
        assert_eq!(
            registry.get(intent.id).unwrap().missing_reviews(),
            vec![ReviewClass::Correctness]
        );
        assert!(registry.approve(intent.id).is_err());
    }

    #[test]
    fn later_review_supersedes_earlier() {
        let (registry, _, _) = registry();
        let intent = propose(&registry);
        registry
            .attach_review(intent.id, "alice", ReviewClass::Security, Verdict::Pass, vec![])
            .unwrap();
        registry
            .attach_review(intent.id, "bob", ReviewClass::Correctness, Verdict::Pass, vec![])
            .unwrap();
        registry
            .attach_review(
                intent.id,
                "alice",
                ReviewClass::Security,
                Verdict::Fail,
                vec!["secret in config".into()],
            )
            .unwrap();
        assert_eq!(
            registry.get(intent.id).unwrap().missing_reviews(),
            vec![ReviewClass::Security]
        );
    }

    #[test]
    fn rejected_is_final() {
        let (registry, _, _) = registry();
        let intent = propose(&registry);
        let rejected = registry.reject(intent.id, "out of scope").unwrap();
        assert_eq!(rejected.status, IntentStatus::Rejected);
        assert_eq!(rejected.history.last().unwrap().note.as_deref(), Some("out of scope"));
        assert!(matches!(
            registry.attach_review(intent.id, "bob", ReviewClass::Security, Verdict::Pass, vec![]),
            Err(GuardrailError::InvalidTransition { .. })
        ));
        assert!(registry.mark_implemented(intent.id).is_err());
    }

    #[test]
    fn malformed_intent_rejected_without_state() {
        let (registry, audit, _) = registry();
        let err = registry
            .create_intent("agent", RiskTier::Low, Scope::new(), "plan")
            .unwrap_err();
        assert!(matches!(err, GuardrailError::Input(InputError::MalformedIntent(_))));
        assert!(registry.list().is_empty());
        assert!(audit.is_empty());
    }

    #[test]
    fn state_survives_reopen() {
        let (registry, audit, store) = registry();
        let intent = propose(&registry);
        registry
            .attach_review(intent.id, "alice", ReviewClass::Security, Verdict::Pass, vec![])
            .unwrap();

        let reopened =
            IntentRegistry::open(store, audit, Arc::new(SystemClock)).unwrap();
        assert_eq!(reopened.get(intent.id).unwrap().status, IntentStatus::UnderReview);
    }
}
