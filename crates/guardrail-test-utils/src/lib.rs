//! Testing utilities for the guardrail workspace
//!
//! Shared fixtures: keyed principals, scripted health, a fixed memory probe,
//! a recording launcher, and a [`TestHarness`] that wires a full pipeline
//! over an in-memory store and a manual clock.

#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use ed25519_dalek::SigningKey;
use guardrail_core::{
    ExecutionMode, ExecutionRecord, ExecutionStatus, GuardrailConfig, LeaseId, ManualClock,
    ReviewClass, RiskTier, Role, Scope, Verdict,
};
use guardrail_kernel::halt::{HealthSample, HealthSource};
use guardrail_kernel::lease::{CosignatureInput, Ed25519Verifier, IssuedLease, Lease};
use guardrail_kernel::pipeline::{Pipeline, PipelineDeps};
use guardrail_kernel::registry::Intent;
use guardrail_kernel::rollback::SimulatedTarget;
use guardrail_kernel::scheduler::{LaunchTicket, ResourceProbe, WorkLauncher};
use guardrail_kernel::store::{MemoryStore, StateStore};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const HUMAN_ID: &str = "alice";
pub const AGENT_ID: &str = "deploy-agent";
pub const TARGET_SEED: &str = "test-target";

/// A principal with its signing key
#[derive(Debug, Clone)]
pub struct TestPrincipal {
    pub id: String,
    pub role: Role,
    pub key: SigningKey,
}

impl TestPrincipal {
    #[must_use]
    pub fn generate(id: &str, role: Role) -> Self {
        Self {
            id: id.to_string(),
            role,
            key: SigningKey::generate(&mut OsRng),
        }
    }

    #[must_use]
    pub fn public_key(&self) -> Vec<u8> {
        self.key.verifying_key().to_bytes().to_vec()
    }

    /// Cosignature over `lease` in this principal's role
    #[must_use]
    pub fn cosign(&self, lease: &Lease) -> CosignatureInput {
        CosignatureInput::ed25519(lease, self.role, &self.id, &self.key)
    }
}

/// Health samples set by the test
#[derive(Debug, Default)]
pub struct ScriptedHealth {
    samples: DashMap<LeaseId, HealthSample>,
}

impl ScriptedHealth {
    pub fn set(&self, lease_id: LeaseId, sample: HealthSample) {
        self.samples.insert(lease_id, sample);
    }

    pub fn clear(&self, lease_id: LeaseId) {
        self.samples.remove(&lease_id);
    }
}

impl HealthSource for ScriptedHealth {
    fn sample(&self, lease_id: LeaseId) -> Option<HealthSample> {
        self.samples.get(&lease_id).map(|s| *s.value())
    }
}

/// Sample comfortably inside every threshold
#[must_use]
pub fn healthy_sample(tes: f64) -> HealthSample {
    HealthSample {
        tes,
        error_rate_pct: 0.2,
        cpu_load_pct: 95.0,
        memory_pct: 55.0,
        observed_at: Utc::now(),
    }
}

/// Memory probe returning whatever the test sets
#[derive(Debug)]
pub struct FixedProbe(AtomicU64);

impl FixedProbe {
    #[must_use]
    pub fn new(pct: f64) -> Self {
        Self(AtomicU64::new(pct.to_bits()))
    }

    pub fn set(&self, pct: f64) {
        self.0.store(pct.to_bits(), Ordering::SeqCst);
    }
}

impl ResourceProbe for FixedProbe {
    fn memory_utilization(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::SeqCst))
    }
}

/// Launcher that records every ticket and reports a fixed outcome
#[derive(Debug)]
pub struct RecordingLauncher {
    tickets: Mutex<Vec<LaunchTicket>>,
    status: ExecutionStatus,
    duration_secs: i64,
    files_changed: u32,
}

impl Default for RecordingLauncher {
    fn default() -> Self {
        Self {
            tickets: Mutex::new(Vec::new()),
            status: ExecutionStatus::Completed,
            duration_secs: 60,
            files_changed: 1,
        }
    }
}

impl RecordingLauncher {
    #[must_use]
    pub fn tickets(&self) -> Vec<LaunchTicket> {
        self.tickets.lock().clone()
    }
}

#[async_trait]
impl WorkLauncher for RecordingLauncher {
    async fn launch(&self, ticket: LaunchTicket) -> ExecutionRecord {
        self.tickets.lock().push(ticket);
        record(self.status, ticket.issued_at, self.duration_secs, self.files_changed)
    }
}

/// An apply-mode execution record
#[must_use]
pub fn record(status: ExecutionStatus, started_at: DateTime<Utc>, duration_secs: i64, files: u32) -> ExecutionRecord {
    ExecutionRecord::new(
        status,
        ExecutionMode::Apply,
        started_at,
        started_at + Duration::seconds(duration_secs),
        files,
    )
}

/// A full pipeline over in-memory state
#[derive(Debug)]
pub struct TestHarness {
    pub pipeline: Arc<Pipeline>,
    pub config: GuardrailConfig,
    pub store: Arc<dyn StateStore>,
    pub clock: ManualClock,
    pub health: Arc<ScriptedHealth>,
    pub probe: Arc<FixedProbe>,
    pub launcher: Arc<RecordingLauncher>,
    pub target: Arc<SimulatedTarget>,
    pub human: TestPrincipal,
    pub agent: TestPrincipal,
}

impl TestHarness {
    /// Default configuration, in-memory store
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(GuardrailConfig::default())
    }

    #[must_use]
    pub fn with_config(config: GuardrailConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    /// Fresh principals registered in a pipeline over `store`
    #[must_use]
    pub fn with_store(config: GuardrailConfig, store: Arc<dyn StateStore>) -> Self {
        let harness = Self::build(
            config,
            store,
            ManualClock::default(),
            Arc::new(ScriptedHealth::default()),
            TestPrincipal::generate(HUMAN_ID, Role::Human),
            TestPrincipal::generate(AGENT_ID, Role::Agent),
        );
        for principal in [&harness.human, &harness.agent] {
            harness
                .pipeline
                .directory()
                .register(&principal.id, principal.role, principal.public_key())
                .expect("register principal");
        }
        harness
    }

    /// A new pipeline restored from this harness's store, sharing its clock,
    /// health source and principals
    #[must_use]
    pub fn reopen(&self) -> Self {
        Self::build(
            self.config.clone(),
            Arc::clone(&self.store),
            self.clock.clone(),
            Arc::clone(&self.health),
            self.human.clone(),
            self.agent.clone(),
        )
    }

    fn build(
        config: GuardrailConfig,
        store: Arc<dyn StateStore>,
        clock: ManualClock,
        health: Arc<ScriptedHealth>,
        human: TestPrincipal,
        agent: TestPrincipal,
    ) -> Self {
        let probe = Arc::new(FixedProbe::new(40.0));
        let launcher = Arc::new(RecordingLauncher::default());
        let target = Arc::new(SimulatedTarget::open(Arc::clone(&store), TARGET_SEED).expect("open target"));
        let pipeline = Pipeline::open(
            config.clone(),
            PipelineDeps {
                store: Arc::clone(&store),
                target: Arc::clone(&target) as _,
                health: Arc::clone(&health) as _,
                probe: Arc::clone(&probe) as _,
                launcher: Arc::clone(&launcher) as _,
                verifier: Arc::new(Ed25519Verifier),
                clock: Arc::new(clock.clone()),
            },
        )
        .expect("open pipeline");
        Self {
            pipeline: Arc::new(pipeline),
            config,
            store,
            clock,
            health,
            probe,
            launcher,
            target,
            human,
            agent,
        }
    }

    /// Scope used by [`Self::approved_intent`]
    #[must_use]
    pub fn scope() -> Scope {
        Scope::new()
            .with_path("services/api/config.toml")
            .with_path("services/api/src")
            .with_command("cargo build")
            .with_environment("staging")
    }

    /// Intent that passed both reviews and was approved
    #[must_use]
    pub fn approved_intent(&self) -> Intent {
        let registry = self.pipeline.registry();
        let intent = registry
            .create_intent("planner", RiskTier::Medium, Self::scope(), "runbooks/api-rollback.md")
            .expect("create intent");
        registry.submit_for_review(intent.id).expect("submit");
        registry
            .attach_review(intent.id, "sec-bot", ReviewClass::Security, Verdict::Pass, Vec::new())
            .expect("security review");
        registry
            .attach_review(intent.id, "bob", ReviewClass::Correctness, Verdict::Pass, Vec::new())
            .expect("correctness review");
        registry.approve(intent.id).expect("approve")
    }

    /// Lease issued for a fresh approved intent, not yet cosigned
    #[must_use]
    pub fn issued_lease(&self) -> IssuedLease {
        let intent = self.approved_intent();
        self.pipeline
            .leases()
            .issue_lease(intent.id, None, None)
            .expect("issue lease")
    }

    /// Lease carrying both cosignatures
    #[must_use]
    pub fn cosigned_lease(&self) -> Lease {
        let issued = self.issued_lease();
        let leases = self.pipeline.leases();
        leases.cosign(self.human.cosign(&issued.lease)).expect("human cosign");
        leases.cosign(self.agent.cosign(&issued.lease)).expect("agent cosign")
    }

    /// Cosigned lease whose rollout has started at 5%, with a healthy sample
    #[must_use]
    pub fn started_rollout(&self) -> LeaseId {
        let lease = self.cosigned_lease();
        self.health.set(lease.id, healthy_sample(90.0));
        self.pipeline.canary().start(lease.id).expect("start rollout");
        lease.id
    }

    /// Move the clock forward by `secs`
    pub fn advance_secs(&self, secs: i64) {
        self.clock.advance(Duration::seconds(secs));
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
