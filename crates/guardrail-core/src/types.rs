//! Core data model
//!
//! Identifiers, execution records and the small closed enums shared by the
//! scoring engine and the kernel services.

use crate::error::InputError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Ulid);

        impl $name {
            /// Generate a new identifier
            #[inline]
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = InputError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ulid::from_string(s)
                    .map(Self)
                    .map_err(|e| InputError::MalformedId(format!("{s}: {e}")))
            }
        }
    };
}

define_id!(
    /// Identifier of a proposed change
    IntentId
);
define_id!(
    /// Identifier of a review verdict
    ReviewId
);
define_id!(
    /// Identifier of a capability lease
    LeaseId
);
define_id!(
    /// Identifier of one scheduled execution
    ExecutionId
);
define_id!(
    /// Identifier of a control-plane message
    MessageId
);

/// Terminal status of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Error,
}

/// Mode the work ran in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Dry,
    Test,
    Apply,
}

/// Failure signal raised during an execution's validation step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FailureSignal {
    /// A validation step failed
    ValidationFailed {
        /// Whether a destructive change had already been applied
        destructive_applied: bool,
    },
}

/// One completed unit of scheduled work.
///
/// Immutable once appended to the execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub duration_s: f64,
    pub files_changed: u32,
    pub mode: ExecutionMode,
    #[serde(default)]
    pub failure_signal: Option<FailureSignal>,
}

impl ExecutionRecord {
    /// Build a record; duration is derived from the timestamps.
    #[must_use]
    pub fn new(
        status: ExecutionStatus,
        mode: ExecutionMode,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        files_changed: u32,
    ) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let duration_s = (ended_at - started_at).num_milliseconds() as f64 / 1000.0;
        Self {
            id: ExecutionId::new(),
            started_at,
            ended_at,
            status,
            duration_s,
            files_changed,
            mode,
            failure_signal: None,
        }
    }

    /// Attach a validation failure signal
    #[must_use]
    pub fn with_failure_signal(mut self, signal: FailureSignal) -> Self {
        self.failure_signal = Some(signal);
        self
    }

    /// Whether the execution finished cleanly
    #[inline]
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Completed && self.failure_signal.is_none()
    }

    /// Reject records that could not have been produced by real work.
    ///
    /// # Errors
    /// Returns `InputError::MalformedRecord` on inverted timestamps or a
    /// negative/non-finite duration.
    pub fn validate(&self) -> Result<(), InputError> {
        if self.ended_at < self.started_at {
            return Err(InputError::MalformedRecord(format!(
                "execution {} ends before it starts",
                self.id
            )));
        }
        if !self.duration_s.is_finite() || self.duration_s < 0.0 {
            return Err(InputError::MalformedRecord(format!(
                "execution {} has invalid duration {}",
                self.id, self.duration_s
            )));
        }
        Ok(())
    }
}

/// Risk classification of an intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    Medium,
    High,
    Critical,
}

impl FromStr for RiskTier {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(InputError::MalformedIntent(format!("unknown risk tier '{other}'"))),
        }
    }
}

/// Lifecycle of an intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Draft,
    Proposed,
    UnderReview,
    Approved,
    Rejected,
    Implemented,
    RolledBack,
}

impl IntentStatus {
    /// Statuses reachable from `self`
    #[must_use]
    pub fn allowed_transitions(self) -> &'static [IntentStatus] {
        use IntentStatus::*;
        match self {
            Draft => &[Proposed],
            Proposed => &[UnderReview, Rejected],
            UnderReview => &[UnderReview, Approved, Rejected],
            Approved => &[Implemented, RolledBack],
            Implemented => &[RolledBack],
            Rejected | RolledBack => &[],
        }
    }

    /// Whether `self -> to` is a legal transition
    #[inline]
    #[must_use]
    pub fn can_transition_to(self, to: IntentStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Proposed => "proposed",
            Self::UnderReview => "under_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Implemented => "implemented",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

/// Class of a reviewing principal
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewClass {
    Security,
    Correctness,
}

impl ReviewClass {
    /// Classes an intent needs before approval
    pub const REQUIRED: [ReviewClass; 2] = [ReviewClass::Security, ReviewClass::Correctness];
}

impl fmt::Display for ReviewClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Security => "security",
            Self::Correctness => "correctness",
        })
    }
}

impl FromStr for ReviewClass {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "security" => Ok(Self::Security),
            "correctness" => Ok(Self::Correctness),
            other => Err(InputError::MalformedReview(format!("unknown review class '{other}'"))),
        }
    }
}

/// Review outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
        })
    }
}

impl FromStr for Verdict {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pass" => Ok(Self::Pass),
            "fail" => Ok(Self::Fail),
            other => Err(InputError::MalformedReview(format!("unknown verdict '{other}'"))),
        }
    }
}

/// Role of a lease cosigner
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Human,
    Agent,
}

impl Role {
    /// Both roles a lease needs
    pub const REQUIRED: [Role; 2] = [Role::Human, Role::Agent];

    /// Stable single-byte tag used in signed content
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Human => 0,
            Self::Agent => 1,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Human => "human",
            Self::Agent => "agent",
        })
    }
}

impl FromStr for Role {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" => Ok(Self::Human),
            "agent" => Ok(Self::Agent),
            other => Err(InputError::MalformedCosignature(format!("unknown role '{other}'"))),
        }
    }
}

/// Canary tier of a rollout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Pending,
    Tier5,
    Tier25,
    Tier100,
    Complete,
    Halted,
    RolledBack,
}

impl Tier {
    /// Traffic fraction in percent while at this tier
    #[must_use]
    pub const fn traffic_percent(self) -> u8 {
        match self {
            Self::Tier5 => 5,
            Self::Tier25 => 25,
            Self::Tier100 | Self::Complete => 100,
            Self::Pending | Self::Halted | Self::RolledBack => 0,
        }
    }

    /// The next forward tier, if any
    #[must_use]
    pub const fn next(self) -> Option<Tier> {
        match self {
            Self::Pending => Some(Self::Tier5),
            Self::Tier5 => Some(Self::Tier25),
            Self::Tier25 => Some(Self::Tier100),
            Self::Tier100 => Some(Self::Complete),
            Self::Complete | Self::Halted | Self::RolledBack => None,
        }
    }

    /// Position on the forward path; side exits have none
    #[must_use]
    pub const fn rank(self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Tier5 => Some(1),
            Self::Tier25 => Some(2),
            Self::Tier100 => Some(3),
            Self::Complete => Some(4),
            Self::Halted | Self::RolledBack => None,
        }
    }

    /// Whether the rollout is still live (traffic may change)
    #[inline]
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Tier5 | Self::Tier25 | Self::Tier100)
    }

    /// Whether no further transition can happen
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::RolledBack)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Tier5 => "tier5",
            Self::Tier25 => "tier25",
            Self::Tier100 => "tier100",
            Self::Complete => "complete",
            Self::Halted => "halted",
            Self::RolledBack => "rolled_back",
        })
    }
}

/// What an intent or lease may touch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    #[serde(default)]
    pub paths: BTreeSet<String>,
    #[serde(default)]
    pub commands: BTreeSet<String>,
    #[serde(default)]
    pub environment: BTreeSet<String>,
}

impl Scope {
    /// Empty scope
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an allowed path (a trailing `/` grants the whole subtree)
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.paths.insert(path.into());
        self
    }

    /// Add an allowed command
    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.commands.insert(command.into());
        self
    }

    /// Add an allowed environment
    #[must_use]
    pub fn with_environment(mut self, env: impl Into<String>) -> Self {
        self.environment.insert(env.into());
        self
    }

    /// Whether nothing is allowed
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.commands.is_empty() && self.environment.is_empty()
    }

    /// Whether `path` is covered by one of this scope's paths
    #[must_use]
    pub fn covers_path(&self, path: &str) -> bool {
        self.paths
            .iter()
            .any(|p| p == path || (p.ends_with('/') && path.starts_with(p.as_str())))
    }

    /// Whether every grant in `self` is also granted by `outer`
    #[must_use]
    pub fn is_subset_of(&self, outer: &Scope) -> bool {
        self.paths.iter().all(|p| outer.covers_path(p))
            && self.commands.is_subset(&outer.commands)
            && self.environment.is_subset(&outer.environment)
    }

    /// Deterministic byte encoding used in signed lease content
    #[must_use]
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (tag, set) in [
            (b'p', &self.paths),
            (b'c', &self.commands),
            (b'e', &self.environment),
        ] {
            out.push(tag);
            out.extend_from_slice(&(set.len() as u64).to_le_bytes());
            for item in set {
                out.extend_from_slice(&(item.len() as u64).to_le_bytes());
                out.extend_from_slice(item.as_bytes());
            }
        }
        out
    }
}
