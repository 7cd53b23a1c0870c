//! The per-turn algorithm, written as an explicit state machine.
//!
//! A turn alternates between two steps: requesting a provider round and
//! running the tool calls that round asked for. Each step returns the next
//! one, or the turn's end. Steering is looked at between steps and after
//! every tool call, never while a call is executing.

use std::collections::VecDeque;

use futures::StreamExt;
use thiserror::Error;
use tiller_tools::{ToolCall, ToolContext, ToolError, ToolRegistry};

use super::actor::ActorProcess;
use super::steering::SuspensionPoint;
use crate::api::{CompletionRequest, ProviderError, StreamChunk};
use crate::app::domain::event::{
    EventKind, MessageOrigin, SteerKind, ToolFailure, TurnFailureReason, Usage,
};
use crate::app::domain::message::fold_history;
use crate::app::domain::session::EventStoreError;
use crate::app::domain::state::{ActorState, Phase, QueuedInput};
use crate::app::domain::types::MessageId;

#[derive(Debug, Error)]
pub enum AgentLoopError {
    #[error("Invalid input for tool {tool}: {message}")]
    InvalidToolInput { tool: String, message: String },

    #[error("Turn exceeded the budget of {max_rounds} rounds")]
    BudgetExceeded { max_rounds: u32 },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    EventStore(#[from] EventStoreError),
}

impl AgentLoopError {
    /// Only a broken event log takes the process down. Decode failures fail
    /// one call; the rest end the turn.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentLoopError::EventStore(_))
    }

    fn into_failure(self) -> Result<TurnFailureReason, EventStoreError> {
        match self {
            AgentLoopError::EventStore(e) => Err(e),
            AgentLoopError::BudgetExceeded { max_rounds } => {
                Ok(TurnFailureReason::BudgetExceeded { max_rounds })
            }
            AgentLoopError::Provider(e) => Ok(TurnFailureReason::Provider {
                message: e.to_string(),
            }),
            AgentLoopError::InvalidToolInput { tool, message } => {
                Ok(TurnFailureReason::InvalidToolInput { tool, message })
            }
        }
    }
}

/// Checks a call's arguments against the tool's declared input shape.
/// Unknown tools pass; execution reports them.
fn decode_call(tools: &ToolRegistry, call: &ToolCall) -> Result<(), AgentLoopError> {
    match tools.validate(call) {
        Err(ToolError::InvalidParams { message, .. }) => Err(AgentLoopError::InvalidToolInput {
            tool: call.name.clone(),
            message,
        }),
        _ => Ok(()),
    }
}

pub(crate) enum LoopStart {
    Fresh(QueuedInput),
    /// Continue the open turn recorded in the process state.
    Resume,
}

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Request { round: u32, attempt: u32 },
    RunTools { round: u32, calls: VecDeque<ToolCall> },
}

impl Step {
    /// Where an open turn picks up after a restart. Streamed text is never
    /// resumed: a round that had not produced its tool calls is issued again
    /// as a new attempt, and its earlier text is superseded.
    fn resume(state: &ActorState) -> Self {
        let cursor = state.turn_cursor;
        if cursor.tools_requested {
            if state.pending_tool_calls.is_empty() {
                Step::Request {
                    round: cursor.round + 1,
                    attempt: 1,
                }
            } else {
                Step::RunTools {
                    round: cursor.round,
                    calls: state.pending_tool_calls.iter().cloned().collect(),
                }
            }
        } else {
            Step::Request {
                round: cursor.round.max(1),
                attempt: cursor.attempt + 1,
            }
        }
    }
}

enum TurnEnd {
    Completed { final_message: String, rounds: u32 },
    Failed(TurnFailureReason),
}

enum Flow {
    Next(Step),
    End(TurnEnd),
}

#[derive(Default)]
struct RoundOutput {
    text: String,
    calls: Vec<ToolCall>,
    usage: Usage,
}

pub(crate) struct AgentLoop<'a> {
    process: &'a mut ActorProcess,
    turn: u64,
    cost: Usage,
}

impl<'a> AgentLoop<'a> {
    pub fn new(process: &'a mut ActorProcess) -> Self {
        Self {
            process,
            turn: 0,
            cost: Usage::default(),
        }
    }

    /// Runs one turn to its end. Only event log failures are returned.
    pub async fn run(mut self, start: LoopStart) -> Result<(), EventStoreError> {
        let mut step = match start {
            LoopStart::Fresh(input) => {
                self.open_turn(input).await?;
                Step::Request {
                    round: 1,
                    attempt: 1,
                }
            }
            LoopStart::Resume => Step::resume(&self.process.state),
        };
        self.turn = self.process.state.turn_cursor.turn;

        let end = loop {
            let flow = match step {
                Step::Request { round, attempt } => self.request_round(round, attempt).await,
                Step::RunTools { round, calls } => self.run_tools(round, calls).await,
            };
            match flow {
                Ok(Flow::Next(next)) => step = next,
                Ok(Flow::End(end)) => break end,
                Err(e) => break TurnEnd::Failed(e.into_failure()?),
            }
        };

        self.finish(end).await
    }

    async fn open_turn(&mut self, input: QueuedInput) -> Result<(), EventStoreError> {
        let turn = self.process.state.turn_cursor.turn + 1;
        let mode = input.mode.unwrap_or(self.process.state.mode);
        self.process
            .append(EventKind::MessageAppended {
                turn,
                message_id: MessageId::for_turn(turn, 0),
                content: input.content,
                mode,
                origin: input.origin,
            })
            .await?;
        self.process.tool_calls_since_checkpoint = 0;

        tracing::info!(
            branch_id = %self.process.branch_id(),
            turn,
            mode = %mode,
            "Turn started"
        );
        Ok(())
    }

    async fn request_round(&mut self, round: u32, attempt: u32) -> Result<Flow, AgentLoopError> {
        let max_rounds = self.process.ctx.config.max_rounds;
        if round > max_rounds {
            return Err(AgentLoopError::BudgetExceeded { max_rounds });
        }

        if let Some(reason) = self.honor_steering(SuspensionPoint::RoundBoundary).await? {
            return Ok(Flow::End(TurnEnd::Failed(reason)));
        }

        let output = match self.stream_round(round, attempt).await {
            Ok(output) => output,
            Err(AgentLoopError::Provider(e))
                if e.is_transient() && self.process.ctx.config.retry.allows(attempt) =>
            {
                let delay = self.process.ctx.config.retry.delay_for(&e, attempt);
                tracing::warn!(
                    branch_id = %self.process.branch_id(),
                    turn = self.turn,
                    round,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient provider error; retrying"
                );
                self.process.absorbing(tokio::time::sleep(delay)).await;
                return Ok(Flow::Next(Step::Request {
                    round,
                    attempt: attempt + 1,
                }));
            }
            Err(e) => return Err(e),
        };
        self.cost += output.usage;

        if let Some(reason) = self.honor_steering(SuspensionPoint::MidRound).await? {
            if output.calls.is_empty() {
                if reason == TurnFailureReason::Interrupted && !output.text.is_empty() {
                    return Ok(Flow::End(TurnEnd::Completed {
                        final_message: output.text,
                        rounds: round,
                    }));
                }
                return Ok(Flow::End(TurnEnd::Failed(reason)));
            }
            for call in &output.calls {
                self.request_call(round, attempt, call).await?;
            }
            for call in &output.calls {
                self.skip_call(call).await?;
            }
            return Ok(Flow::End(TurnEnd::Failed(reason)));
        }

        if output.calls.is_empty() {
            return Ok(Flow::End(TurnEnd::Completed {
                final_message: output.text,
                rounds: round,
            }));
        }

        for call in &output.calls {
            self.request_call(round, attempt, call).await?;
        }
        Ok(Flow::Next(Step::RunTools {
            round,
            calls: output.calls.into(),
        }))
    }

    async fn stream_round(&mut self, round: u32, attempt: u32) -> Result<RoundOutput, AgentLoopError> {
        let branch_id = self.process.branch_id();
        let events = self.process.ctx.event_log.replay(branch_id, None).await?;
        let request = CompletionRequest {
            history: fold_history(&events),
            system_prompt: self.process.ctx.config.instructions.clone(),
            tools: self.process.ctx.tools.schemas(),
            mode: self.process.state.mode,
        };

        let provider = self.process.ctx.provider.clone();
        let timeout = self.process.ctx.config.provider_timeout();
        let token = self.process.cancel.child_token();
        let timed_out = || ProviderError::Timeout {
            provider: provider.name().to_string(),
        };

        tracing::debug!(
            branch_id = %branch_id,
            turn = self.turn,
            round,
            attempt,
            mode = %request.mode,
            history = request.history.len(),
            "Requesting completion"
        );

        let mut stream = self
            .process
            .absorbing(tokio::time::timeout(
                timeout,
                provider.stream_completion(request, token),
            ))
            .await
            .map_err(|_| timed_out())??;

        let mut output = RoundOutput::default();
        loop {
            let chunk = match self
                .process
                .absorbing(tokio::time::timeout(timeout, stream.next()))
                .await
            {
                Err(_) => return Err(timed_out().into()),
                Ok(None) => break,
                Ok(Some(chunk)) => chunk?,
            };

            match chunk {
                StreamChunk::TextDelta(text) => {
                    if text.is_empty() {
                        continue;
                    }
                    output.text.push_str(&text);
                    self.process
                        .append(EventKind::AssistantTextDelta {
                            turn: self.turn,
                            round,
                            attempt,
                            text,
                        })
                        .await?;
                }
                StreamChunk::ToolCallDirective(call) => output.calls.push(call),
                StreamChunk::Final { usage } => {
                    output.usage += usage;
                    break;
                }
            }
        }

        Ok(output)
    }

    async fn run_tools(
        &mut self,
        round: u32,
        mut calls: VecDeque<ToolCall>,
    ) -> Result<Flow, AgentLoopError> {
        while let Some(call) = calls.pop_front() {
            match decode_call(&self.process.ctx.tools, &call) {
                Ok(()) => self.execute_call(&call).await?,
                Err(rejected) => self.reject_call(&call, rejected).await?,
            }

            if self
                .process
                .ctx
                .checkpoints
                .due_mid_turn(self.process.tool_calls_since_checkpoint)
            {
                self.process.checkpoint().await?;
            }

            if let Some(reason) = self.honor_steering(SuspensionPoint::MidRound).await? {
                for skipped in &calls {
                    self.skip_call(skipped).await?;
                }
                return Ok(Flow::End(TurnEnd::Failed(reason)));
            }
        }

        Ok(Flow::Next(Step::Request {
            round: round + 1,
            attempt: 1,
        }))
    }

    async fn request_call(
        &mut self,
        round: u32,
        attempt: u32,
        call: &ToolCall,
    ) -> Result<(), EventStoreError> {
        self.process
            .append(EventKind::ToolCallRequested {
                turn: self.turn,
                round,
                attempt,
                call: call.clone(),
            })
            .await?;
        Ok(())
    }

    async fn skip_call(&mut self, call: &ToolCall) -> Result<(), EventStoreError> {
        self.process
            .append(EventKind::ToolCallFailed {
                turn: self.turn,
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                failure: ToolFailure::Skipped,
            })
            .await?;
        Ok(())
    }

    /// Records a call whose input failed to decode; the turn carries on.
    async fn reject_call(
        &mut self,
        call: &ToolCall,
        rejected: AgentLoopError,
    ) -> Result<(), AgentLoopError> {
        let message = match rejected {
            AgentLoopError::InvalidToolInput { message, .. } => message,
            other => return Err(other),
        };
        tracing::warn!(
            branch_id = %self.process.branch_id(),
            call_id = %call.id,
            tool = %call.name,
            error = %message,
            "Rejected tool call"
        );
        self.process.tool_calls_since_checkpoint += 1;
        self.process
            .append(EventKind::ToolCallFailed {
                turn: self.turn,
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                failure: ToolFailure::InvalidInput { message },
            })
            .await?;
        Ok(())
    }

    async fn execute_call(&mut self, call: &ToolCall) -> Result<(), EventStoreError> {
        let tools = self.process.ctx.tools.clone();
        let timeout = self.process.ctx.config.tool_timeout();
        let ctx = ToolContext {
            call_id: call.id.clone(),
            cancellation_token: self.process.cancel.child_token(),
        };

        let result = self
            .process
            .absorbing(tools.execute(call, ctx, timeout))
            .await;
        self.process.tool_calls_since_checkpoint += 1;

        let kind = match result {
            Ok(output) => EventKind::ToolCallCompleted {
                turn: self.turn,
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                output,
            },
            Err(error) => {
                tracing::debug!(
                    branch_id = %self.process.branch_id(),
                    call_id = %call.id,
                    tool = %call.name,
                    error = %error,
                    "Tool call failed"
                );
                EventKind::ToolCallFailed {
                    turn: self.turn,
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    failure: error.into(),
                }
            }
        };
        self.process.append(kind).await?;
        Ok(())
    }

    /// Acts on parked steering commands in arrival order. Returns the reason
    /// to end the turn if an interrupt or cancel was honored.
    async fn honor_steering(
        &mut self,
        point: SuspensionPoint,
    ) -> Result<Option<TurnFailureReason>, EventStoreError> {
        while let Some(command) = self.process.steering.next_honorable(point) {
            self.process.record_steer(&command).await?;

            match command.kind {
                SteerKind::Interrupt => {
                    self.process.set_phase(Phase::Interrupting);
                    tracing::info!(
                        branch_id = %self.process.branch_id(),
                        turn = self.turn,
                        "Interrupt honored"
                    );
                    return Ok(Some(TurnFailureReason::Interrupted));
                }
                SteerKind::Cancel => {
                    let dropped = self.process.steering.discard_injections();
                    self.process.set_phase(Phase::Interrupting);
                    tracing::info!(
                        branch_id = %self.process.branch_id(),
                        turn = self.turn,
                        dropped_injections = dropped,
                        "Cancel honored"
                    );
                    return Ok(Some(TurnFailureReason::Cancelled));
                }
                SteerKind::Redirect { mode } => {
                    tracing::debug!(
                        branch_id = %self.process.branch_id(),
                        turn = self.turn,
                        mode = %mode,
                        "Redirect honored"
                    );
                }
                SteerKind::Inject { content } => {
                    let index = self.process.state.turn_cursor.inputs;
                    let mode = self.process.state.mode;
                    self.process
                        .append(EventKind::MessageAppended {
                            turn: self.turn,
                            message_id: MessageId::for_turn(self.turn, index),
                            content,
                            mode,
                            origin: MessageOrigin::Injected,
                        })
                        .await?;
                }
            }
        }
        Ok(None)
    }

    async fn finish(mut self, end: TurnEnd) -> Result<(), EventStoreError> {
        let branch_id = self.process.branch_id();
        match end {
            TurnEnd::Completed {
                final_message,
                rounds,
            } => {
                self.process
                    .append(EventKind::TurnCompleted {
                        turn: self.turn,
                        final_message,
                        cost: self.cost,
                        rounds,
                    })
                    .await?;
                tracing::info!(branch_id = %branch_id, turn = self.turn, rounds, "Turn completed");
                self.process.checkpoint().await?;
            }
            TurnEnd::Failed(reason) => {
                tracing::info!(
                    branch_id = %branch_id,
                    turn = self.turn,
                    reason = %reason,
                    "Turn failed"
                );
                self.process
                    .append(EventKind::TurnFailed {
                        turn: self.turn,
                        reason,
                        cost: self.cost,
                    })
                    .await?;
            }
        }
        Ok(())
    }
}
