//! One actor process per live branch.
//!
//! The process task owns the branch's [`ActorState`] and is the only writer
//! of its event log. Everything else talks to it through an [`ActorHandle`]
//! over a bounded mailbox. While a turn is awaiting the provider or a tool,
//! the mailbox keeps draining: submissions are queued, steering commands are
//! parked until the next suspension point, and state queries are answered
//! immediately.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tiller_tools::ToolRegistry;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::agent_loop::{AgentLoop, LoopStart};
use super::steering::{PendingSteering, SteerCommand, SteeringChannel};
use crate::api::Provider;
use crate::app::domain::checkpoint::CheckpointManager;
use crate::app::domain::event::{
    AgentMode, Event, EventKind, MessageOrigin, SteerKind, TurnFailureReason, Usage,
};
use crate::app::domain::session::{
    BranchStatus, EventLog, EventStoreError, SessionStorage,
};
use crate::app::domain::state::{ActorState, Phase, QueuedInput};
use crate::app::domain::types::BranchId;
use crate::config::RuntimeConfig;

#[derive(Debug, thiserror::Error)]
pub enum ActorProcessError {
    #[error("Actor process already running for branch {branch_id}")]
    AlreadyRunning { branch_id: String },

    #[error("No actor process for branch {branch_id}")]
    NotFound { branch_id: String },

    #[error("Actor process failed: {reason}")]
    Failed { reason: String },

    #[error("Actor process is shutting down")]
    ShuttingDown,

    #[error("Channel closed")]
    ChannelClosed,
}

impl ActorProcessError {
    pub fn already_running(branch_id: BranchId) -> Self {
        Self::AlreadyRunning {
            branch_id: branch_id.to_string(),
        }
    }

    pub fn not_found(branch_id: BranchId) -> Self {
        Self::NotFound {
            branch_id: branch_id.to_string(),
        }
    }
}

pub(crate) enum ActorCmd {
    Submit {
        content: String,
        mode: Option<AgentMode>,
        reply: oneshot::Sender<Result<(), ActorProcessError>>,
    },
    Steer {
        command: SteerCommand,
        reply: oneshot::Sender<Result<(), ActorProcessError>>,
    },
    GetState {
        reply: oneshot::Sender<ActorState>,
    },
    Shutdown,
}

/// Snapshot published by the process after every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessStatus {
    pub phase: Phase,
    pub turn: u64,
    /// Submissions and steering commands accepted but not yet acted on.
    pub backlog: usize,
    /// A turn is being driven, including its closing checkpoint.
    pub busy: bool,
}

impl ProcessStatus {
    /// Settled with nothing left to do.
    pub fn is_quiescent(&self) -> bool {
        self.phase.is_settled() && self.backlog == 0 && !self.busy
    }
}

/// Shared collaborators of every actor process.
#[derive(Clone)]
pub struct ActorContext {
    pub event_log: Arc<EventLog>,
    pub storage: Arc<dyn SessionStorage>,
    pub checkpoints: Arc<CheckpointManager>,
    pub provider: Arc<dyn Provider>,
    pub tools: Arc<ToolRegistry>,
    pub config: Arc<RuntimeConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// The process honored the cancel and stopped on its own.
    Graceful,
    /// The process was aborted after the timeout.
    Forced,
}

#[derive(Clone)]
pub struct ActorHandle {
    process_id: u64,
    branch_id: BranchId,
    cmd_tx: mpsc::Sender<ActorCmd>,
    status_rx: watch::Receiver<ProcessStatus>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
    event_log: Arc<EventLog>,
}

impl std::fmt::Debug for ActorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorHandle")
            .field("process_id", &self.process_id)
            .field("branch_id", &self.branch_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl ActorHandle {
    /// Distinguishes process instances across restarts of one branch.
    pub fn process_id(&self) -> u64 {
        self.process_id
    }

    pub fn branch_id(&self) -> BranchId {
        self.branch_id
    }

    pub fn is_alive(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    pub fn status(&self) -> ProcessStatus {
        *self.status_rx.borrow()
    }

    /// Queues user input. It becomes the next turn's input once every
    /// earlier submission has run.
    pub async fn submit(
        &self,
        content: impl Into<String>,
        mode: Option<AgentMode>,
    ) -> Result<(), ActorProcessError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ActorCmd::Submit {
                content: content.into(),
                mode,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ActorProcessError::ChannelClosed)?;
        reply_rx.await.map_err(|_| ActorProcessError::ChannelClosed)?
    }

    pub fn steering(&self) -> SteeringChannel {
        SteeringChannel::new(self.branch_id, self.cmd_tx.clone())
    }

    pub async fn steer(&self, kind: SteerKind) -> Result<(), ActorProcessError> {
        self.steering().send(kind).await
    }

    pub async fn get_state(&self) -> Result<ActorState, ActorProcessError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ActorCmd::GetState { reply: reply_tx })
            .await
            .map_err(|_| ActorProcessError::ChannelClosed)?;
        reply_rx.await.map_err(|_| ActorProcessError::ChannelClosed)
    }

    /// Waits until the published status satisfies `predicate`. Returns
    /// `None` on timeout.
    pub async fn wait_for_status(
        &self,
        timeout: Duration,
        predicate: impl FnMut(&ProcessStatus) -> bool,
    ) -> Option<ProcessStatus> {
        let mut status_rx = self.status_rx.clone();
        match tokio::time::timeout(timeout, status_rx.wait_for(predicate)).await {
            Ok(Ok(status)) => Some(*status),
            _ => None,
        }
    }

    pub async fn wait_until_quiescent(&self, timeout: Duration) -> Option<ProcessStatus> {
        self.wait_for_status(timeout, ProcessStatus::is_quiescent)
            .await
    }

    /// Stops the process, waiting at most `timeout` for it to cancel its
    /// turn and exit. Past the timeout the task is aborted and, if a turn was
    /// open, `TurnFailed{ForcedTeardown}` is appended on its behalf.
    /// Subscriptions to the branch stay open.
    pub async fn terminate(&self, timeout: Duration) -> Result<Teardown, EventStoreError> {
        let graceful = tokio::time::timeout(timeout, async {
            if self.cmd_tx.send(ActorCmd::Shutdown).await.is_ok() {
                let mut status_rx = self.status_rx.clone();
                let _ = status_rx
                    .wait_for(|status| status.phase == Phase::Terminated)
                    .await;
            }
        })
        .await
        .is_ok();

        let mut task = self.task.lock().await;
        let teardown = if graceful {
            if let Some(task) = task.take() {
                let _ = task.await;
            }
            Teardown::Graceful
        } else {
            if let Some(task) = task.take() {
                task.abort();
                let _ = task.await;
            }

            let last = self.status();
            tracing::warn!(
                branch_id = %self.branch_id,
                process_id = self.process_id,
                phase = %last.phase,
                turn = last.turn,
                "Actor process did not stop in time; aborted"
            );
            if last.phase.is_turn_open() {
                self.event_log
                    .append(
                        self.branch_id,
                        EventKind::TurnFailed {
                            turn: last.turn,
                            reason: TurnFailureReason::ForcedTeardown,
                            cost: Usage::default(),
                        },
                    )
                    .await?;
            }
            Teardown::Forced
        };

        Ok(teardown)
    }
}

pub(crate) struct ActorProcess {
    pub(super) ctx: ActorContext,
    pub(super) state: ActorState,
    pub(super) steering: PendingSteering,
    pub(super) tool_calls_since_checkpoint: u32,
    pub(super) cancel: CancellationToken,
    cmd_rx: mpsc::Receiver<ActorCmd>,
    mailbox_open: bool,
    status_tx: watch::Sender<ProcessStatus>,
    failure: Option<String>,
    shutdown_requested: bool,
    busy: bool,
}

impl ActorProcess {
    /// Starts a process task seeded with `state` and returns its handle. A
    /// state with an open turn resumes that turn before reading the mailbox.
    pub(crate) fn spawn(process_id: u64, ctx: ActorContext, state: ActorState) -> ActorHandle {
        let branch_id = state.branch_id;
        let (cmd_tx, cmd_rx) = mpsc::channel(ctx.config.mailbox_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(ProcessStatus {
            phase: state.phase,
            turn: state.turn_cursor.turn,
            backlog: state.queued_inputs.len(),
            busy: false,
        });
        let event_log = ctx.event_log.clone();

        let process = ActorProcess {
            ctx,
            state,
            steering: PendingSteering::default(),
            tool_calls_since_checkpoint: 0,
            cancel: CancellationToken::new(),
            cmd_rx,
            mailbox_open: true,
            status_tx,
            failure: None,
            shutdown_requested: false,
            busy: false,
        };
        let task = tokio::spawn(process.run(process_id));

        ActorHandle {
            process_id,
            branch_id,
            cmd_tx,
            status_rx,
            task: Arc::new(Mutex::new(Some(task))),
            event_log,
        }
    }

    pub(super) fn branch_id(&self) -> BranchId {
        self.state.branch_id
    }

    async fn run(mut self, process_id: u64) {
        tracing::info!(
            branch_id = %self.branch_id(),
            process_id,
            phase = %self.state.phase,
            last_sequence = self.state.last_sequence,
            "Actor process started"
        );

        if self.state.phase.is_turn_open() {
            tracing::info!(
                branch_id = %self.branch_id(),
                turn = self.state.turn_cursor.turn,
                round = self.state.turn_cursor.round,
                "Resuming unfinished turn"
            );
            self.drive_turn(LoopStart::Resume).await;
        }

        loop {
            self.drain_backlog().await;
            if self.shutdown_requested {
                break;
            }
            match self.cmd_rx.recv().await {
                Some(cmd) => self.absorb(cmd),
                None => break,
            }
        }

        self.cancel.cancel();
        self.state.phase = Phase::Terminated;
        self.publish_status();
        tracing::info!(branch_id = %self.branch_id(), process_id, "Actor process stopped");
    }

    /// Runs queued turns and idle steering until there is nothing left.
    async fn drain_backlog(&mut self) {
        while self.failure.is_none() {
            if let Some(command) = self.steering.pop_front() {
                if let Err(e) = self.apply_idle_steering(command).await {
                    self.fail(e).await;
                }
                continue;
            }
            if self.shutdown_requested {
                break;
            }
            let Some(input) = self.state.queued_inputs.front().cloned() else {
                break;
            };
            self.drive_turn(LoopStart::Fresh(input)).await;
        }
    }

    async fn drive_turn(&mut self, start: LoopStart) {
        self.busy = true;
        self.publish_status();
        if let Err(e) = AgentLoop::new(self).run(start).await {
            self.fail(e).await;
        }
        self.busy = false;
        self.publish_status();
    }

    async fn apply_idle_steering(&mut self, command: SteerCommand) -> Result<(), EventStoreError> {
        match &command.kind {
            SteerKind::Interrupt => {
                tracing::debug!(branch_id = %self.branch_id(), "Interrupt while idle; nothing to do");
            }
            SteerKind::Redirect { mode } => {
                self.record_steer(&command).await?;
                tracing::debug!(branch_id = %self.branch_id(), mode = %mode, "Mode set for next turn");
            }
            SteerKind::Inject { content } => {
                self.state.queued_inputs.push_back(QueuedInput {
                    content: content.clone(),
                    mode: None,
                    origin: MessageOrigin::Injected,
                });
                self.record_steer(&command).await?;
            }
            SteerKind::Cancel => {
                if self.state.queued_inputs.is_empty() {
                    tracing::debug!(branch_id = %self.branch_id(), "Cancel while idle; nothing queued");
                } else {
                    self.record_steer(&command).await?;
                }
            }
        }
        Ok(())
    }

    /// The process keeps answering queries after a fatal error but accepts
    /// no further work until restarted.
    async fn fail(&mut self, error: EventStoreError) {
        let reason = error.to_string();
        tracing::error!(
            branch_id = %self.branch_id(),
            error = %error,
            "Event log write failed; actor process is now failed"
        );

        self.failure = Some(reason.clone());
        self.state.phase = Phase::Failed;
        self.state.queued_inputs.clear();
        self.steering = PendingSteering::default();
        self.publish_status();

        if let Err(e) = self
            .ctx
            .storage
            .set_branch_status(self.branch_id(), BranchStatus::Failed { reason })
            .await
        {
            tracing::warn!(
                branch_id = %self.branch_id(),
                error = %e,
                "Failed to record branch failure"
            );
        }
    }

    fn admission(&self) -> Result<(), ActorProcessError> {
        if let Some(reason) = &self.failure {
            return Err(ActorProcessError::Failed {
                reason: reason.clone(),
            });
        }
        if self.shutdown_requested {
            return Err(ActorProcessError::ShuttingDown);
        }
        Ok(())
    }

    fn absorb(&mut self, cmd: ActorCmd) {
        match cmd {
            ActorCmd::Submit {
                content,
                mode,
                reply,
            } => {
                let result = self.admission();
                if result.is_ok() {
                    self.state.queued_inputs.push_back(QueuedInput {
                        content,
                        mode,
                        origin: MessageOrigin::Submitted,
                    });
                    self.publish_status();
                }
                let _ = reply.send(result);
            }
            ActorCmd::Steer { command, reply } => {
                let result = self.admission();
                if result.is_ok() {
                    tracing::debug!(
                        branch_id = %self.branch_id(),
                        command = ?command.kind,
                        phase = %self.state.phase,
                        "Steering command accepted"
                    );
                    self.steering.push(command);
                    self.publish_status();
                }
                let _ = reply.send(result);
            }
            ActorCmd::GetState { reply } => {
                let _ = reply.send(self.state.clone());
            }
            ActorCmd::Shutdown => {
                self.shutdown_requested = true;
                if self.state.phase.is_turn_open() {
                    self.steering
                        .push(SteerCommand::new(self.branch_id(), SteerKind::Cancel));
                }
            }
        }
    }

    /// Awaits `fut` while still draining the mailbox.
    pub(super) async fn absorbing<F: Future>(&mut self, fut: F) -> F::Output {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;

                output = &mut fut => return output,

                cmd = self.cmd_rx.recv(), if self.mailbox_open => match cmd {
                    Some(cmd) => self.absorb(cmd),
                    None => self.mailbox_open = false,
                },
            }
        }
    }

    /// Appends to the branch log and folds the event into local state.
    pub(super) async fn append(&mut self, kind: EventKind) -> Result<Event, EventStoreError> {
        let event = self.ctx.event_log.append(self.branch_id(), kind).await?;
        self.state.apply(&event);
        self.publish_status();
        Ok(event)
    }

    pub(super) async fn record_steer(
        &mut self,
        command: &SteerCommand,
    ) -> Result<Event, EventStoreError> {
        self.append(EventKind::Steered {
            turn: self.state.turn_cursor.turn,
            command: command.kind.clone(),
            issued_at: command.issued_at,
        })
        .await
    }

    /// Best effort: a failed checkpoint is logged and the turn carries on.
    pub(super) async fn checkpoint(&mut self) -> Result<(), EventStoreError> {
        match self.ctx.checkpoints.checkpoint(&self.state).await {
            Ok(checkpoint) => {
                self.tool_calls_since_checkpoint = 0;
                self.append(EventKind::Checkpointed {
                    turn: self.state.turn_cursor.turn,
                    sequence: checkpoint.sequence,
                })
                .await?;
            }
            Err(e) => tracing::warn!(
                branch_id = %self.branch_id(),
                sequence = self.state.last_sequence,
                error = %e,
                "Checkpoint failed; the event log remains authoritative"
            ),
        }
        Ok(())
    }

    pub(super) fn set_phase(&mut self, phase: Phase) {
        self.state.phase = phase;
        self.publish_status();
    }

    fn publish_status(&self) {
        let next = ProcessStatus {
            phase: self.state.phase,
            turn: self.state.turn_cursor.turn,
            backlog: self.state.queued_inputs.len() + self.steering.len(),
            busy: self.busy,
        };
        self.status_tx.send_if_modified(|status| {
            if *status == next {
                false
            } else {
                *status = next;
                true
            }
        });
    }
}
