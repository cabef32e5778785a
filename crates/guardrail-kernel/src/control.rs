//! Control plane
//!
//! Single entry point for operator commands, cosignatures and externally
//! reported executions. [`ControlPlane::handle`] and
//! [`ControlPlane::dispatch`] run in-process; [`ControlPlane::spawn`] serves
//! the same surface over a typed channel.

use crate::halt::HaltReason;
use crate::lease::Lease;
use crate::messages::{CommandError, CommandResponse, ControlMessage, Envelope, OperatorCommand};
use crate::pipeline::Pipeline;
use guardrail_core::{GuardrailError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Reply to a [`ControlMessage`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reply")]
pub enum ControlReply {
    Command(CommandResponse),
    Cosigned { lease: Lease, usable: bool },
    Recorded { sequence: u64 },
    Rejected(CommandError),
}

/// The control channel was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("control plane is no longer running")]
pub struct ControlClosed;

type Request = (Envelope<ControlMessage>, oneshot::Sender<ControlReply>);

/// Sending side of a spawned control plane
#[derive(Debug, Clone)]
pub struct ControlClient {
    tx: mpsc::Sender<Request>,
}

impl ControlClient {
    /// Send a message and wait for its reply
    ///
    /// # Errors
    /// Returns [`ControlClosed`] if the control task has stopped.
    pub async fn send(&self, envelope: Envelope<ControlMessage>) -> std::result::Result<ControlReply, ControlClosed> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send((envelope, reply_tx)).await.map_err(|_| ControlClosed)?;
        reply_rx.await.map_err(|_| ControlClosed)
    }

    /// Send an operator command
    ///
    /// # Errors
    /// Returns [`ControlClosed`] if the control task has stopped.
    pub async fn command(&self, command: OperatorCommand) -> std::result::Result<CommandResponse, ControlClosed> {
        match self.send(Envelope::new(ControlMessage::Command(command))).await? {
            ControlReply::Command(response) => Ok(response),
            ControlReply::Rejected(error) => Ok(CommandResponse {
                ok: false,
                error: Some(error),
                rollouts: Vec::new(),
            }),
            other => {
                tracing::error!(reply = ?other, "unexpected reply to command");
                Err(ControlClosed)
            }
        }
    }
}

/// Routes control messages to the pipeline's services
#[derive(Debug, Clone)]
pub struct ControlPlane {
    pipeline: Arc<Pipeline>,
}

impl ControlPlane {
    #[must_use]
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }

    #[must_use]
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Run an operator command
    pub async fn handle(&self, command: OperatorCommand) -> CommandResponse {
        let name = command.name();
        let lease = command.lease_id();
        match self.execute(command).await {
            Ok(rollouts) => {
                tracing::info!(command = name, lease = ?lease, "command applied");
                CommandResponse::success(rollouts)
            }
            Err(e) => {
                tracing::warn!(command = name, lease = ?lease, kind = e.kind(), error = %e, "command refused");
                let current = lease.and_then(|id| self.pipeline.canary().state(id).ok());
                CommandResponse::failure(&e, current)
            }
        }
    }

    async fn execute(&self, command: OperatorCommand) -> Result<Vec<crate::canary::RolloutState>> {
        let canary = self.pipeline.canary();
        let state = match command {
            OperatorCommand::StartLease { lease_id } => canary.start(lease_id)?,
            OperatorCommand::PauseRollout { lease_id } => canary.pause(lease_id)?,
            OperatorCommand::ResumeRollout { lease_id } => canary.resume(lease_id)?,
            OperatorCommand::ApproveNextTier { lease_id } => canary.approve_next_tier(lease_id).await?,
            OperatorCommand::ForceRollback { lease_id, reason } => {
                if let Some(reason) = reason {
                    if canary.state(lease_id)?.tier.is_active() {
                        canary.halt(lease_id, HaltReason::operator(reason))?;
                    }
                }
                canary.rollback(lease_id)?
            }
            OperatorCommand::ListActiveLeases => return Ok(canary.active()),
        };
        Ok(vec![state])
    }

    /// Validate and route one envelope
    pub async fn dispatch(&self, envelope: Envelope<ControlMessage>) -> ControlReply {
        if let Err(e) = envelope.validate() {
            let e = GuardrailError::from(e);
            tracing::warn!(message = %envelope.message_id, error = %e, "control message rejected");
            return ControlReply::Rejected((&e).into());
        }
        match envelope.payload {
            ControlMessage::Command(command) => ControlReply::Command(self.handle(command).await),
            ControlMessage::Cosign(input) => {
                let leases = self.pipeline.leases();
                let result = leases
                    .cosign(input)
                    .and_then(|lease| Ok((leases.verify(lease.id)?.usable, lease)));
                match result {
                    Ok((usable, lease)) => ControlReply::Cosigned { lease, usable },
                    Err(e) => ControlReply::Rejected((&e).into()),
                }
            }
            ControlMessage::ExecutionCompleted(record) => match self.pipeline.record_execution(record) {
                Ok(sequence) => ControlReply::Recorded { sequence },
                Err(e) => ControlReply::Rejected((&e).into()),
            },
        }
    }

    /// Serve messages on a channel until every client is dropped or
    /// `shutdown` turns true
    #[must_use]
    pub fn spawn(self, buffer: usize, mut shutdown: watch::Receiver<bool>) -> (ControlClient, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Request>(buffer.max(1));
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    request = rx.recv() => {
                        let Some((envelope, reply)) = request else { break };
                        let response = self.dispatch(envelope).await;
                        // The caller may have given up waiting.
                        let _ = reply.send(response);
                    }
                    () = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                }
            }
            tracing::debug!("control plane stopped");
        });
        (ControlClient { tx }, handle)
    }
}
