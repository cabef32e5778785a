//! Guardrail Kernel
//!
//! Deployment governance for autonomous changes:
//! 1. **Review**: an intent needs passing security and correctness reviews
//!    from distinct reviewers before approval ([`registry`])
//! 2. **Two-key lease**: an approved intent gets a scoped, time-bounded
//!    lease that a human and an agent principal must both cosign ([`lease`])
//! 3. **Canary**: the change moves through 5% / 25% / 100% traffic with an
//!    observation window and a health check at each tier ([`canary`])
//! 4. **Auto-halt and rollback**: a single breached threshold halts the
//!    rollout; rollback restores the state captured at lease issuance
//!    ([`halt`], [`rollback`])
//!
//! The adaptive [`scheduler`] gates how often new work launches, and every
//! state change lands in the hash-chained [`audit`] trail.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use guardrail_kernel::prelude::*;
//!
//! let pipeline = Arc::new(Pipeline::open(config, deps)?);
//! let control = ControlPlane::new(Arc::clone(&pipeline));
//! let response = control.handle(OperatorCommand::StartLease { lease_id }).await;
//! let runtime = Runtime::start(pipeline);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod audit;
pub mod canary;
pub mod control;
pub mod halt;
pub mod heartbeat;
pub mod host;
pub mod lease;
pub mod messages;
pub mod pipeline;
pub mod registry;
pub mod rollback;
pub mod runtime;
pub mod scheduler;
pub mod store;

pub use audit::{AuditAction, AuditRecord, AuditTrail};
pub use canary::{CanaryController, RolloutState};
pub use control::{ControlClient, ControlPlane, ControlReply};
pub use halt::{AutoHaltMonitor, HaltReason, HealthEvaluation, HealthSample, HealthSource};
pub use heartbeat::HeartbeatRegistry;
pub use lease::{CosignatureInput, Lease, LeaseService, Verification};
pub use messages::{CommandResponse, ControlMessage, Envelope, OperatorCommand};
pub use pipeline::{Pipeline, PipelineDeps};
pub use registry::{Intent, IntentRegistry};
pub use rollback::{DeploymentTarget, RollbackManager, RollbackPack, RollbackReceipt, SimulatedTarget};
pub use runtime::Runtime;
pub use scheduler::{AdaptiveScheduler, ResourceProbe, Strategy, TickOutcome, WorkLauncher};
pub use store::{FileStore, MemoryStore, StateStore};

/// Common imports
pub mod prelude {
    pub use crate::control::{ControlPlane, ControlReply};
    pub use crate::halt::{HaltReason, HealthSample, HealthSource};
    pub use crate::lease::{CosignatureInput, Ed25519Verifier, Lease, SignatureVerifier};
    pub use crate::messages::{CommandResponse, ControlMessage, Envelope, OperatorCommand};
    pub use crate::pipeline::{Pipeline, PipelineDeps};
    pub use crate::rollback::{DeploymentTarget, SimulatedTarget};
    pub use crate::runtime::Runtime;
    pub use crate::scheduler::{ResourceProbe, WorkLauncher};
    pub use crate::store::{FileStore, MemoryStore, StateStore};
    pub use guardrail_core::{
        Clock, GuardrailConfig, GuardrailError, LeaseId, Result, Role, Scope, SystemClock, Tier,
    };
    pub use std::sync::Arc;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
