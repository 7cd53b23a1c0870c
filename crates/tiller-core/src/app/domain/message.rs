//! Message views folded from a branch's event log.
//!
//! Two folds are provided: [`fold_transcript`] yields the user-visible
//! conversation (user input and final assistant replies), while
//! [`fold_history`] yields what the provider sees, including assistant
//! tool-call rounds and tool results. Both are pure functions of an event
//! prefix, so folding the same prefix twice yields identical output.

use serde::{Deserialize, Serialize};
use tiller_tools::ToolCall;

use super::event::{AgentMode, Event, EventKind, MessageOrigin, SteerKind, Usage};
use super::types::MessageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub mode: AgentMode,
    pub cost: Usage,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Sequence of the event that produced this message.
    pub sequence: u64,
}

impl Message {
    fn user(id: MessageId, content: &str, mode: AgentMode, sequence: u64) -> Self {
        Self {
            id,
            role: Role::User,
            content: content.to_string(),
            mode,
            cost: Usage::default(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            sequence,
        }
    }
}

/// User input and final assistant replies, in log order.
pub fn fold_transcript(events: &[Event]) -> Vec<Message> {
    let mut messages = Vec::new();
    let mut mode = AgentMode::default();

    for event in events {
        match &event.kind {
            EventKind::MessageAppended {
                message_id,
                content,
                mode: message_mode,
                ..
            } => {
                mode = *message_mode;
                messages.push(Message::user(
                    message_id.clone(),
                    content,
                    mode,
                    event.sequence,
                ));
            }
            EventKind::Steered {
                command: SteerKind::Redirect { mode: redirected },
                ..
            } => mode = *redirected,
            EventKind::TurnCompleted {
                turn,
                final_message,
                cost,
                ..
            } => messages.push(Message {
                id: MessageId(format!("turn-{turn}-final")),
                role: Role::Assistant,
                content: final_message.clone(),
                mode,
                cost: *cost,
                tool_calls: Vec::new(),
                tool_call_id: None,
                sequence: event.sequence,
            }),
            _ => {}
        }
    }

    messages
}

/// Assistant output of one provider round, accumulated until the round closes.
struct OpenRound {
    turn: u64,
    round: u32,
    attempt: u32,
    mode: AgentMode,
    text: String,
    calls: Vec<ToolCall>,
    results: Vec<Message>,
    sequence: u64,
}

impl OpenRound {
    fn new(turn: u64, round: u32, attempt: u32, mode: AgentMode, sequence: u64) -> Self {
        Self {
            turn,
            round,
            attempt,
            mode,
            text: String::new(),
            calls: Vec::new(),
            results: Vec::new(),
            sequence,
        }
    }

    /// Rounds without tool calls are represented by the turn's final message,
    /// or dropped when the turn never finished.
    fn close_into(self, messages: &mut Vec<Message>) {
        if self.calls.is_empty() {
            return;
        }
        messages.push(Message {
            id: MessageId(format!("turn-{}-round-{}", self.turn, self.round)),
            role: Role::Assistant,
            content: self.text,
            mode: self.mode,
            cost: Usage::default(),
            tool_calls: self.calls,
            tool_call_id: None,
            sequence: self.sequence,
        });
        messages.extend(self.results);
    }
}

/// Conversation as the provider sees it, including tool rounds. Streamed
/// text from a superseded attempt of a round is discarded.
pub fn fold_history(events: &[Event]) -> Vec<Message> {
    let mut messages = Vec::new();
    let mut mode = AgentMode::default();
    let mut open: Option<OpenRound> = None;

    for event in events {
        match &event.kind {
            EventKind::MessageAppended {
                message_id,
                content,
                mode: message_mode,
                origin,
                ..
            } => {
                if let Some(round) = open.take() {
                    round.close_into(&mut messages);
                }
                if *origin == MessageOrigin::Submitted {
                    mode = *message_mode;
                }
                messages.push(Message::user(
                    message_id.clone(),
                    content,
                    *message_mode,
                    event.sequence,
                ));
            }
            EventKind::Steered {
                command: SteerKind::Redirect { mode: redirected },
                ..
            } => mode = *redirected,
            EventKind::AssistantTextDelta {
                turn,
                round,
                attempt,
                text,
            } => {
                let current = open.take();
                let mut buffer = match current {
                    Some(buf) if buf.turn == *turn && buf.round == *round => buf,
                    other => {
                        if let Some(previous) = other {
                            previous.close_into(&mut messages);
                        }
                        OpenRound::new(*turn, *round, *attempt, mode, event.sequence)
                    }
                };
                if *attempt > buffer.attempt {
                    buffer.attempt = *attempt;
                    buffer.text.clear();
                }
                if *attempt == buffer.attempt {
                    buffer.text.push_str(text);
                }
                open = Some(buffer);
            }
            EventKind::ToolCallRequested {
                turn,
                round,
                attempt,
                call,
            } => {
                let current = open.take();
                let mut buffer = match current {
                    Some(buf) if buf.turn == *turn && buf.round == *round => buf,
                    other => {
                        if let Some(previous) = other {
                            previous.close_into(&mut messages);
                        }
                        OpenRound::new(*turn, *round, *attempt, mode, event.sequence)
                    }
                };
                // A tool-only retry supersedes text streamed by earlier attempts.
                if *attempt > buffer.attempt {
                    buffer.attempt = *attempt;
                    buffer.text.clear();
                }
                buffer.calls.push(call.clone());
                open = Some(buffer);
            }
            EventKind::ToolCallCompleted {
                call_id, output, ..
            } => {
                if let Some(buffer) = open.as_mut() {
                    buffer
                        .results
                        .push(tool_result(call_id, &output.content, mode, event.sequence));
                }
            }
            EventKind::ToolCallFailed {
                call_id, failure, ..
            } => {
                if let Some(buffer) = open.as_mut() {
                    buffer.results.push(tool_result(
                        call_id,
                        &format!("Error: {failure}"),
                        mode,
                        event.sequence,
                    ));
                }
            }
            EventKind::TurnCompleted {
                turn,
                final_message,
                cost,
                ..
            } => {
                if let Some(round) = open.take() {
                    round.close_into(&mut messages);
                }
                messages.push(Message {
                    id: MessageId(format!("turn-{turn}-final")),
                    role: Role::Assistant,
                    content: final_message.clone(),
                    mode,
                    cost: *cost,
                    tool_calls: Vec::new(),
                    tool_call_id: None,
                    sequence: event.sequence,
                });
            }
            EventKind::TurnFailed { .. } => {
                if let Some(round) = open.take() {
                    round.close_into(&mut messages);
                }
            }
            EventKind::Checkpointed { .. } | EventKind::Steered { .. } => {}
        }
    }

    if let Some(round) = open.take() {
        round.close_into(&mut messages);
    }

    messages
}

fn tool_result(call_id: &str, content: &str, mode: AgentMode, sequence: u64) -> Message {
    Message {
        id: MessageId(format!("tool-{call_id}")),
        role: Role::Tool,
        content: content.to_string(),
        mode,
        cost: Usage::default(),
        tool_calls: Vec::new(),
        tool_call_id: Some(call_id.to_string()),
        sequence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::domain::event::{ToolFailure, TurnFailureReason};
    use crate::app::domain::types::BranchId;
    use chrono::Utc;
    use serde_json::json;
    use tiller_tools::ToolOutput;

    fn events(kinds: Vec<EventKind>) -> Vec<Event> {
        let branch_id = BranchId::new();
        kinds
            .into_iter()
            .enumerate()
            .map(|(i, kind)| Event {
                branch_id,
                sequence: i as u64 + 1,
                timestamp: Utc::now(),
                kind,
            })
            .collect()
    }

    fn user(turn: u64, content: &str) -> EventKind {
        EventKind::MessageAppended {
            turn,
            message_id: MessageId::for_turn(turn, 0),
            content: content.to_string(),
            mode: AgentMode::Build,
            origin: MessageOrigin::Submitted,
        }
    }

    fn delta(turn: u64, round: u32, attempt: u32, text: &str) -> EventKind {
        EventKind::AssistantTextDelta {
            turn,
            round,
            attempt,
            text: text.to_string(),
        }
    }

    fn tool_round() -> Vec<EventKind> {
        vec![
            user(1, "list files"),
            EventKind::ToolCallRequested {
                turn: 1,
                round: 1,
                attempt: 1,
                call: ToolCall::new("c1", "glob", json!({"pattern": "*"})),
            },
            EventKind::ToolCallCompleted {
                turn: 1,
                call_id: "c1".to_string(),
                tool_name: "glob".to_string(),
                output: ToolOutput::text("a.rs\nb.rs"),
            },
            delta(1, 2, 0, "Found "),
            delta(1, 2, 0, "two files"),
            EventKind::TurnCompleted {
                turn: 1,
                final_message: "Found two files".to_string(),
                cost: Usage::default(),
                rounds: 2,
            },
        ]
    }

    #[test]
    fn transcript_keeps_user_and_final_assistant() {
        let messages = fold_transcript(&events(tool_round()));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "Found two files");
    }

    #[test]
    fn history_includes_tool_round() {
        let messages = fold_history(&events(tool_round()));
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );
        assert_eq!(messages[1].tool_calls.len(), 1);
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(messages[2].content, "a.rs\nb.rs");
    }

    #[test]
    fn superseded_attempt_text_is_discarded() {
        let log = events(vec![
            user(1, "hi"),
            delta(1, 1, 0, "partial garb"),
            delta(1, 1, 1, "fresh "),
            EventKind::ToolCallRequested {
                turn: 1,
                round: 1,
                attempt: 1,
                call: ToolCall::new("c1", "glob", json!({})),
            },
            EventKind::ToolCallFailed {
                turn: 1,
                call_id: "c1".to_string(),
                tool_name: "glob".to_string(),
                failure: ToolFailure::Timeout,
            },
        ]);
        let messages = fold_history(&log);
        assert_eq!(messages[1].content, "fresh ");
        assert_eq!(messages[2].content, "Error: timed out");
    }

    #[test]
    fn unfinished_text_round_is_dropped() {
        let log = events(vec![
            user(1, "hi"),
            delta(1, 1, 0, "never finished"),
            EventKind::TurnFailed {
                turn: 1,
                reason: TurnFailureReason::Interrupted,
                cost: Usage::default(),
            },
        ]);
        assert_eq!(fold_history(&log).len(), 1);
        assert_eq!(fold_transcript(&log).len(), 1);
    }

    #[test]
    fn redirect_changes_mode_of_following_messages() {
        let log = events(vec![
            user(1, "plan it"),
            EventKind::Steered {
                turn: 1,
                command: SteerKind::Redirect {
                    mode: AgentMode::Plan,
                },
                issued_at: Utc::now(),
            },
            EventKind::TurnCompleted {
                turn: 1,
                final_message: "plan".to_string(),
                cost: Usage::default(),
                rounds: 1,
            },
        ]);
        let transcript = fold_transcript(&log);
        assert_eq!(transcript[1].mode, AgentMode::Plan);
    }
}
