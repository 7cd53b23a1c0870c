//! Out-of-band commands for a running actor process.
//!
//! Commands travel through the process mailbox, so they are linearized with
//! submissions in arrival order. The process parks them in
//! [`PendingSteering`] and acts on them only at suspension points.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use super::actor::{ActorCmd, ActorProcessError};
use crate::app::domain::event::{AgentMode, SteerKind};
use crate::app::domain::types::BranchId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SteerCommand {
    pub branch_id: BranchId,
    pub kind: SteerKind,
    pub issued_at: DateTime<Utc>,
}

impl SteerCommand {
    pub fn new(branch_id: BranchId, kind: SteerKind) -> Self {
        Self {
            branch_id,
            kind,
            issued_at: Utc::now(),
        }
    }

    pub fn is_injection(&self) -> bool {
        matches!(self.kind, SteerKind::Inject { .. })
    }
}

/// Sending half of a branch's steering path. Cheap to clone; every clone
/// feeds the same mailbox.
#[derive(Clone)]
pub struct SteeringChannel {
    branch_id: BranchId,
    cmd_tx: mpsc::Sender<ActorCmd>,
}

impl SteeringChannel {
    pub(crate) fn new(branch_id: BranchId, cmd_tx: mpsc::Sender<ActorCmd>) -> Self {
        Self { branch_id, cmd_tx }
    }

    pub fn branch_id(&self) -> BranchId {
        self.branch_id
    }

    /// Delivers a command. Returns once the process has accepted it, which
    /// says nothing about when it will be honored.
    pub async fn send(&self, kind: SteerKind) -> Result<(), ActorProcessError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ActorCmd::Steer {
                command: SteerCommand::new(self.branch_id, kind),
                reply: reply_tx,
            })
            .await
            .map_err(|_| ActorProcessError::ChannelClosed)?;
        reply_rx.await.map_err(|_| ActorProcessError::ChannelClosed)?
    }

    pub async fn interrupt(&self) -> Result<(), ActorProcessError> {
        self.send(SteerKind::Interrupt).await
    }

    pub async fn redirect(&self, mode: AgentMode) -> Result<(), ActorProcessError> {
        self.send(SteerKind::Redirect { mode }).await
    }

    pub async fn inject(&self, content: impl Into<String>) -> Result<(), ActorProcessError> {
        self.send(SteerKind::Inject {
            content: content.into(),
        })
        .await
    }

    pub async fn cancel(&self) -> Result<(), ActorProcessError> {
        self.send(SteerKind::Cancel).await
    }
}

/// Where the agent loop is when it looks at pending steering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SuspensionPoint {
    /// Before a provider request; every command can be honored.
    RoundBoundary,
    /// After a stream segment or a tool call. Injections wait for the next
    /// round boundary so they never land between a tool request and its
    /// result.
    MidRound,
}

#[derive(Debug, Default)]
pub(crate) struct PendingSteering {
    queue: VecDeque<SteerCommand>,
}

impl PendingSteering {
    pub fn push(&mut self, command: SteerCommand) {
        self.queue.push_back(command);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn pop_front(&mut self) -> Option<SteerCommand> {
        self.queue.pop_front()
    }

    /// Oldest command that may be honored at `point`.
    pub fn next_honorable(&mut self, point: SuspensionPoint) -> Option<SteerCommand> {
        let index = match point {
            SuspensionPoint::RoundBoundary => 0,
            SuspensionPoint::MidRound => self.queue.iter().position(|c| !c.is_injection())?,
        };
        self.queue.remove(index)
    }

    pub fn discard_injections(&mut self) -> usize {
        let before = self.queue.len();
        self.queue.retain(|c| !c.is_injection());
        before - self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(kind: SteerKind) -> SteerCommand {
        SteerCommand::new(BranchId::new(), kind)
    }

    fn inject(content: &str) -> SteerCommand {
        command(SteerKind::Inject {
            content: content.to_string(),
        })
    }

    #[test]
    fn boundary_honors_in_arrival_order() {
        let mut pending = PendingSteering::default();
        pending.push(inject("first"));
        pending.push(command(SteerKind::Interrupt));

        assert!(pending.next_honorable(SuspensionPoint::RoundBoundary).unwrap().is_injection());
        assert_eq!(
            pending.next_honorable(SuspensionPoint::RoundBoundary).unwrap().kind,
            SteerKind::Interrupt
        );
        assert!(pending.is_empty());
    }

    #[test]
    fn mid_round_leaves_injections_queued() {
        let mut pending = PendingSteering::default();
        pending.push(inject("later"));
        pending.push(command(SteerKind::Redirect {
            mode: AgentMode::Plan,
        }));

        let honored = pending.next_honorable(SuspensionPoint::MidRound).unwrap();
        assert_eq!(
            honored.kind,
            SteerKind::Redirect {
                mode: AgentMode::Plan
            }
        );
        assert!(pending.next_honorable(SuspensionPoint::MidRound).is_none());
        assert_eq!(pending.len(), 1);
        assert!(pending.next_honorable(SuspensionPoint::RoundBoundary).unwrap().is_injection());
    }

    #[test]
    fn discarding_injections_keeps_other_commands() {
        let mut pending = PendingSteering::default();
        pending.push(inject("a"));
        pending.push(command(SteerKind::Cancel));
        pending.push(inject("b"));

        assert_eq!(pending.discard_injections(), 2);
        assert_eq!(pending.pop_front().unwrap().kind, SteerKind::Cancel);
        assert!(pending.is_empty());
    }
}
