//! Typed control-plane messages
//!
//! Everything entering the pipeline from outside travels in an
//! [`Envelope`]. Envelopes are validated (schema version, payload shape)
//! before any service sees them.

use crate::canary::RolloutState;
use crate::lease::CosignatureInput;
use chrono::{DateTime, Utc};
use guardrail_core::{ExecutionRecord, GuardrailError, InputError, LeaseId, MessageId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Message schema version understood by this build
pub const SCHEMA_VERSION: u16 = 1;

/// A payload that can check its own shape
pub trait Payload {
    /// # Errors
    /// Returns an `InputError` describing the first malformed field.
    fn validate(&self) -> Result<(), InputError>;
}

/// Versioned, identified wrapper around a payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub schema_version: u16,
    pub message_id: MessageId,
    pub sent_at: DateTime<Utc>,
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Wrap a payload at the current schema version
    pub fn new(payload: T) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            message_id: MessageId::new(),
            sent_at: Utc::now(),
            payload,
        }
    }
}

impl<T: Payload> Envelope<T> {
    /// # Errors
    /// Rejects unknown schema versions and malformed payloads.
    pub fn validate(&self) -> Result<(), InputError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(InputError::UnsupportedSchemaVersion {
                found: self.schema_version,
                expected: SCHEMA_VERSION,
            });
        }
        self.payload.validate()
    }
}

impl<T: Payload + DeserializeOwned> Envelope<T> {
    /// Parse and validate
    ///
    /// # Errors
    /// `MalformedMessage` for unparseable JSON, otherwise whatever
    /// [`Envelope::validate`] rejects.
    pub fn from_json(json: &str) -> Result<Self, InputError> {
        let envelope: Self =
            serde_json::from_str(json).map_err(|e| InputError::MalformedMessage(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }
}

/// Messages accepted by the control plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "body")]
pub enum ControlMessage {
    Cosign(CosignatureInput),
    Command(OperatorCommand),
    ExecutionCompleted(ExecutionRecord),
}

impl Payload for ControlMessage {
    fn validate(&self) -> Result<(), InputError> {
        match self {
            Self::Cosign(input) => input.validate(),
            Self::Command(command) => command.validate(),
            Self::ExecutionCompleted(record) => record.validate(),
        }
    }
}

/// Operator commands for canary rollouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "command")]
pub enum OperatorCommand {
    StartLease { lease_id: LeaseId },
    PauseRollout { lease_id: LeaseId },
    ResumeRollout { lease_id: LeaseId },
    ForceRollback {
        lease_id: LeaseId,
        #[serde(default)]
        reason: Option<String>,
    },
    ApproveNextTier { lease_id: LeaseId },
    ListActiveLeases,
}

impl OperatorCommand {
    /// Command name as used on the CLI
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartLease { .. } => "start-lease",
            Self::PauseRollout { .. } => "pause-rollout",
            Self::ResumeRollout { .. } => "resume-rollout",
            Self::ForceRollback { .. } => "force-rollback",
            Self::ApproveNextTier { .. } => "approve-next-tier",
            Self::ListActiveLeases => "list-active-leases",
        }
    }

    /// Lease the command targets
    #[must_use]
    pub fn lease_id(&self) -> Option<LeaseId> {
        match self {
            Self::StartLease { lease_id }
            | Self::PauseRollout { lease_id }
            | Self::ResumeRollout { lease_id }
            | Self::ForceRollback { lease_id, .. }
            | Self::ApproveNextTier { lease_id } => Some(*lease_id),
            Self::ListActiveLeases => None,
        }
    }
}

impl Payload for OperatorCommand {
    fn validate(&self) -> Result<(), InputError> {
        if let Self::ForceRollback {
            reason: Some(reason),
            ..
        } = self
        {
            if reason.trim().is_empty() {
                return Err(InputError::MalformedMessage(
                    "force-rollback reason is blank".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Failure part of a [`CommandResponse`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandError {
    /// Stable tag, see `GuardrailError::kind`
    pub kind: String,
    pub message: String,
}

impl From<&GuardrailError> for CommandError {
    fn from(e: &GuardrailError) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

/// Reply to an operator command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandError>,
    /// Rollouts affected by, or listed for, the command
    #[serde(default)]
    pub rollouts: Vec<RolloutState>,
}

impl CommandResponse {
    #[must_use]
    pub fn success(rollouts: Vec<RolloutState>) -> Self {
        Self {
            ok: true,
            error: None,
            rollouts,
        }
    }

    /// Refusal, with the rollout's state as it stands when there is one
    #[must_use]
    pub fn failure(error: &GuardrailError, current: Option<RolloutState>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            rollouts: current.into_iter().collect(),
        }
    }
}
