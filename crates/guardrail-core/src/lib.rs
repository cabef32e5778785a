//! Guardrail Core
//!
//! Shared foundation of the deployment guardrail pipeline:
//! - [`ContentHash`] for content addressing
//! - identifiers and the execution/intent/tier data model
//! - the error taxonomy
//! - [`GuardrailConfig`] holding every tunable threshold
//! - [`Clock`] so expiry and observation windows are testable

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod clock;
pub mod config;
pub mod error;
pub mod hash;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AgiiConfig, CanaryConfig, GuardrailConfig, HaltThresholds, LeaseConfig, LoopConfig,
    SchedulerConfig, ScoringConfig, StoreConfig, TesConfig,
};
pub use error::{
    AuthorizationError, ConfigError, EntityKind, GuardrailError, InputError, Result, RollbackError,
    RolloutError, StoreError, UnusableReason,
};
pub use hash::{ContentHash, HashError};
pub use types::{
    ExecutionId, ExecutionMode, ExecutionRecord, ExecutionStatus, FailureSignal, IntentId,
    IntentStatus, LeaseId, MessageId, ReviewClass, ReviewId, RiskTier, Role, Scope, Tier, Verdict,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
