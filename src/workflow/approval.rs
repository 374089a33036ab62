//! External approval for `user_confirmation` steps.

use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

/// What the approver is asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalRequest {
    pub execution_id: String,
    pub workflow_id: String,
    pub step: String,
    pub message: String,
}

/// Decides whether a paused workflow may continue.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    /// `Ok(false)` is a denial; the step then fails.
    async fn confirm(&self, request: ApprovalRequest) -> Result<bool>;
}

/// Approves everything. For unattended runs and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalGate for AutoApprove {
    async fn confirm(&self, _request: ApprovalRequest) -> Result<bool> {
        Ok(true)
    }
}

/// A confirmation waiting for an answer.
#[derive(Debug)]
pub struct PendingApproval {
    pub request: ApprovalRequest,
    reply: oneshot::Sender<bool>,
}

impl PendingApproval {
    pub fn approve(self) {
        let _ = self.reply.send(true);
    }

    pub fn deny(self) {
        let _ = self.reply.send(false);
    }
}

/// Forwards each confirmation to a receiver held by the host application.
///
/// Dropping a [`PendingApproval`] without answering counts as a denial.
#[derive(Debug, Clone)]
pub struct ChannelApprovalGate {
    tx: mpsc::Sender<PendingApproval>,
}

impl ChannelApprovalGate {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PendingApproval>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ApprovalGate for ChannelApprovalGate {
    async fn confirm(&self, request: ApprovalRequest) -> Result<bool> {
        let (reply, answer) = oneshot::channel();
        let step = request.step.clone();
        self.tx
            .send(PendingApproval { request, reply })
            .await
            .map_err(|_| {
                Error::workflow_with_context(
                    "approval channel closed",
                    ErrorContext::new().with_field_path(step),
                )
            })?;
        Ok(answer.await.unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ApprovalRequest {
        ApprovalRequest {
            execution_id: "e".into(),
            workflow_id: "w".into(),
            step: "confirm".into(),
            message: "ok?".into(),
        }
    }

    #[tokio::test]
    async fn test_channel_gate_round_trip() {
        let (gate, mut rx) = ChannelApprovalGate::new(1);
        let approver = tokio::spawn(async move {
            let first = rx.recv().await.unwrap();
            assert_eq!(first.request.message, "ok?");
            first.approve();
            rx.recv().await.unwrap().deny();
            drop(rx.recv().await.unwrap());
        });
        assert!(gate.confirm(request()).await.unwrap());
        assert!(!gate.confirm(request()).await.unwrap());
        assert!(!gate.confirm(request()).await.unwrap());
        approver.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_channel_is_error() {
        let (gate, rx) = ChannelApprovalGate::new(1);
        drop(rx);
        assert!(gate.confirm(request()).await.is_err());
    }
}
