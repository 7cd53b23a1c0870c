use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tiller_tools::ToolCall;

use super::event::{AgentMode, Event, EventKind, MessageOrigin, SteerKind, Usage};
use super::types::BranchId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    Idle,
    Running,
    Interrupting,
    Terminated,
    Failed,
}

impl Phase {
    pub fn is_turn_open(self) -> bool {
        matches!(self, Phase::Running | Phase::Interrupting)
    }

    /// Phases a graceful teardown waits for.
    pub fn is_settled(self) -> bool {
        matches!(self, Phase::Idle | Phase::Failed | Phase::Terminated)
    }
}

/// Position of the loop within the current turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnCursor {
    pub turn: u64,
    pub round: u32,
    pub attempt: u32,
    /// Set once the current round's tool calls have been requested, meaning
    /// the provider stream for the round was fully received.
    pub tools_requested: bool,
    /// User messages appended in this turn, including injections.
    #[serde(default)]
    pub inputs: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedInput {
    pub content: String,
    pub mode: Option<AgentMode>,
    pub origin: MessageOrigin,
}

/// Resumable state of one branch's actor process. Everything except the
/// in-flight phase markers and queued input can be rebuilt by folding the
/// branch log through [`ActorState::apply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorState {
    pub branch_id: BranchId,
    pub phase: Phase,
    pub turn_cursor: TurnCursor,
    pub pending_tool_calls: Vec<ToolCall>,
    pub accumulated_cost: Usage,
    pub last_checkpoint_sequence: Option<u64>,
    pub last_sequence: u64,
    pub mode: AgentMode,
    #[serde(default)]
    pub queued_inputs: VecDeque<QueuedInput>,
}

impl ActorState {
    pub fn new(branch_id: BranchId) -> Self {
        Self {
            branch_id,
            phase: Phase::Idle,
            turn_cursor: TurnCursor::default(),
            pending_tool_calls: Vec::new(),
            accumulated_cost: Usage::default(),
            last_checkpoint_sequence: None,
            last_sequence: 0,
            mode: AgentMode::default(),
            queued_inputs: VecDeque::new(),
        }
    }

    pub fn replay<'a>(branch_id: BranchId, events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut state = Self::new(branch_id);
        for event in events {
            state.apply(event);
        }
        state
    }

    pub fn apply(&mut self, event: &Event) {
        if event.sequence <= self.last_sequence {
            return;
        }
        self.last_sequence = event.sequence;

        match &event.kind {
            EventKind::MessageAppended {
                turn,
                content,
                mode,
                ..
            } => {
                if *turn > self.turn_cursor.turn {
                    self.phase = Phase::Running;
                    self.turn_cursor = TurnCursor {
                        turn: *turn,
                        inputs: 1,
                        ..TurnCursor::default()
                    };
                    self.pending_tool_calls.clear();
                    self.mode = *mode;
                    if self
                        .queued_inputs
                        .front()
                        .is_some_and(|queued| &queued.content == content)
                    {
                        self.queued_inputs.pop_front();
                    }
                } else if *turn == self.turn_cursor.turn {
                    self.turn_cursor.inputs += 1;
                }
            }
            EventKind::AssistantTextDelta { round, attempt, .. } => {
                if *round > self.turn_cursor.round {
                    self.turn_cursor.tools_requested = false;
                }
                self.turn_cursor.round = *round;
                self.turn_cursor.attempt = *attempt;
            }
            EventKind::ToolCallRequested {
                round,
                attempt,
                call,
                ..
            } => {
                self.turn_cursor.round = *round;
                self.turn_cursor.attempt = *attempt;
                self.turn_cursor.tools_requested = true;
                self.pending_tool_calls.push(call.clone());
            }
            EventKind::ToolCallCompleted { call_id, .. }
            | EventKind::ToolCallFailed { call_id, .. } => {
                self.pending_tool_calls.retain(|call| &call.id != call_id);
            }
            EventKind::TurnCompleted { cost, .. } | EventKind::TurnFailed { cost, .. } => {
                self.accumulated_cost += *cost;
                self.phase = Phase::Idle;
                self.pending_tool_calls.clear();
                self.turn_cursor.tools_requested = false;
            }
            EventKind::Checkpointed { sequence, .. } => {
                self.last_checkpoint_sequence = Some(*sequence);
            }
            EventKind::Steered { command, .. } => match command {
                SteerKind::Redirect { mode } => self.mode = *mode,
                SteerKind::Cancel => self.queued_inputs.clear(),
                SteerKind::Interrupt | SteerKind::Inject { .. } => {}
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::domain::event::TurnFailureReason;
    use crate::app::domain::types::MessageId;
    use chrono::Utc;
    use serde_json::json;
    use tiller_tools::ToolOutput;

    fn event(branch_id: BranchId, sequence: u64, kind: EventKind) -> Event {
        Event {
            branch_id,
            sequence,
            timestamp: Utc::now(),
            kind,
        }
    }

    #[test]
    fn turn_lifecycle_moves_phase_and_cursor() {
        let branch_id = BranchId::new();
        let mut state = ActorState::new(branch_id);

        state.apply(&event(
            branch_id,
            1,
            EventKind::MessageAppended {
                turn: 1,
                message_id: MessageId::for_turn(1, 0),
                content: "hello".to_string(),
                mode: AgentMode::Plan,
                origin: MessageOrigin::Submitted,
            },
        ));
        assert_eq!(state.phase, Phase::Running);
        assert_eq!(state.mode, AgentMode::Plan);

        state.apply(&event(
            branch_id,
            2,
            EventKind::ToolCallRequested {
                turn: 1,
                round: 1,
                attempt: 1,
                call: ToolCall::new("a", "glob", json!({})),
            },
        ));
        state.apply(&event(
            branch_id,
            3,
            EventKind::ToolCallRequested {
                turn: 1,
                round: 1,
                attempt: 1,
                call: ToolCall::new("b", "glob", json!({})),
            },
        ));
        state.apply(&event(
            branch_id,
            4,
            EventKind::ToolCallCompleted {
                turn: 1,
                call_id: "a".to_string(),
                tool_name: "glob".to_string(),
                output: ToolOutput::text("ok"),
            },
        ));
        assert_eq!(state.pending_tool_calls.len(), 1);
        assert_eq!(state.pending_tool_calls[0].id, "b");
        assert!(state.turn_cursor.tools_requested);

        state.apply(&event(
            branch_id,
            5,
            EventKind::TurnFailed {
                turn: 1,
                reason: TurnFailureReason::Interrupted,
                cost: Usage {
                    input_tokens: 3,
                    output_tokens: 2,
                    cost_usd: 0.0,
                },
            },
        ));
        assert_eq!(state.phase, Phase::Idle);
        assert!(state.pending_tool_calls.is_empty());
        assert_eq!(state.accumulated_cost.input_tokens, 3);
        assert_eq!(state.last_sequence, 5);
    }

    #[test]
    fn already_applied_events_are_ignored() {
        let branch_id = BranchId::new();
        let mut state = ActorState::new(branch_id);
        let checkpointed = event(
            branch_id,
            1,
            EventKind::Checkpointed {
                turn: 0,
                sequence: 0,
            },
        );
        state.apply(&checkpointed);
        let snapshot = state.clone();
        state.apply(&checkpointed);
        assert_eq!(state, snapshot);
    }

    #[test]
    fn new_turn_consumes_matching_queued_input() {
        let branch_id = BranchId::new();
        let mut state = ActorState::new(branch_id);
        state.queued_inputs.push_back(QueuedInput {
            content: "second".to_string(),
            mode: None,
            origin: MessageOrigin::Submitted,
        });
        state.apply(&event(
            branch_id,
            1,
            EventKind::MessageAppended {
                turn: 1,
                message_id: MessageId::for_turn(1, 0),
                content: "second".to_string(),
                mode: AgentMode::Build,
                origin: MessageOrigin::Submitted,
            },
        ));
        assert!(state.queued_inputs.is_empty());
    }
}
