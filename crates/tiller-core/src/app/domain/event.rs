use std::ops::AddAssign;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tiller_tools::{ToolCall, ToolError, ToolOutput};

use super::types::{BranchId, MessageId};

/// Working mode a turn runs in; forwarded to the provider with each request.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AgentMode {
    #[default]
    Build,
    Plan,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
        self.cost_usd += rhs.cost_usd;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOrigin {
    Submitted,
    Injected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolFailure {
    #[error("unknown tool")]
    UnknownTool,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("timed out")]
    Timeout,
    #[error("execution failed: {message}")]
    Execution { message: String },
    #[error("cancelled")]
    Cancelled,
    #[error("skipped after interrupt")]
    Skipped,
}

impl From<ToolError> for ToolFailure {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::UnknownTool(_) => ToolFailure::UnknownTool,
            ToolError::InvalidParams { message, .. } | ToolError::InvalidSchema { message, .. } => {
                ToolFailure::InvalidInput { message }
            }
            ToolError::Timeout(_) => ToolFailure::Timeout,
            ToolError::Cancelled(_) => ToolFailure::Cancelled,
            ToolError::Execution { message, .. } => ToolFailure::Execution { message },
            ToolError::InternalError(message) => ToolFailure::Execution { message },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnFailureReason {
    Interrupted,
    Cancelled,
    BudgetExceeded { max_rounds: u32 },
    Provider { message: String },
    InvalidToolInput { tool: String, message: String },
    ForcedTeardown,
}

impl std::fmt::Display for TurnFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnFailureReason::Interrupted => write!(f, "interrupted"),
            TurnFailureReason::Cancelled => write!(f, "cancelled"),
            TurnFailureReason::BudgetExceeded { max_rounds } => {
                write!(f, "exceeded the budget of {max_rounds} rounds")
            }
            TurnFailureReason::Provider { message } => write!(f, "provider error: {message}"),
            TurnFailureReason::InvalidToolInput { tool, message } => {
                write!(f, "invalid input for {tool}: {message}")
            }
            TurnFailureReason::ForcedTeardown => write!(f, "forced teardown"),
        }
    }
}

/// Out-of-band command delivered to a running actor process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SteerKind {
    Interrupt,
    Redirect { mode: AgentMode },
    Inject { content: String },
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, strum::IntoStaticStr)]
#[serde(tag = "type", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    MessageAppended {
        turn: u64,
        message_id: MessageId,
        content: String,
        mode: AgentMode,
        origin: MessageOrigin,
    },
    AssistantTextDelta {
        turn: u64,
        round: u32,
        attempt: u32,
        text: String,
    },
    ToolCallRequested {
        turn: u64,
        round: u32,
        attempt: u32,
        call: ToolCall,
    },
    ToolCallCompleted {
        turn: u64,
        call_id: String,
        tool_name: String,
        output: ToolOutput,
    },
    ToolCallFailed {
        turn: u64,
        call_id: String,
        tool_name: String,
        failure: ToolFailure,
    },
    TurnCompleted {
        turn: u64,
        final_message: String,
        cost: Usage,
        rounds: u32,
    },
    TurnFailed {
        turn: u64,
        reason: TurnFailureReason,
        cost: Usage,
    },
    Checkpointed {
        turn: u64,
        sequence: u64,
    },
    Steered {
        turn: u64,
        command: SteerKind,
        issued_at: DateTime<Utc>,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        self.into()
    }

    pub fn turn(&self) -> u64 {
        match self {
            EventKind::MessageAppended { turn, .. }
            | EventKind::AssistantTextDelta { turn, .. }
            | EventKind::ToolCallRequested { turn, .. }
            | EventKind::ToolCallCompleted { turn, .. }
            | EventKind::ToolCallFailed { turn, .. }
            | EventKind::TurnCompleted { turn, .. }
            | EventKind::TurnFailed { turn, .. }
            | EventKind::Checkpointed { turn, .. }
            | EventKind::Steered { turn, .. } => *turn,
        }
    }

    /// True for the events that close a turn.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::TurnCompleted { .. } | EventKind::TurnFailed { .. }
        )
    }

    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            EventKind::ToolCallRequested { call, .. } => Some(&call.id),
            EventKind::ToolCallCompleted { call_id, .. }
            | EventKind::ToolCallFailed { call_id, .. } => Some(call_id),
            _ => None,
        }
    }
}

/// An immutable entry in a branch's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub branch_id: BranchId,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_names_are_snake_case() {
        let kind = EventKind::ToolCallRequested {
            turn: 1,
            round: 1,
            attempt: 1,
            call: ToolCall::new("c1", "glob", json!({"pattern": "*"})),
        };
        assert_eq!(kind.name(), "tool_call_requested");
        assert_eq!(kind.tool_call_id(), Some("c1"));
        assert!(!kind.is_terminal());
    }

    #[test]
    fn serialized_kind_is_tagged() {
        let kind = EventKind::TurnFailed {
            turn: 2,
            reason: TurnFailureReason::BudgetExceeded { max_rounds: 4 },
            cost: Usage::default(),
        };
        let value = serde_json::to_value(&kind).unwrap();
        assert_eq!(value["type"], "turn_failed");
        assert_eq!(value["reason"]["kind"], "budget_exceeded");
        let back: EventKind = serde_json::from_value(value).unwrap();
        assert_eq!(back, kind);
    }

    #[test]
    fn tool_errors_map_to_failures() {
        let failure: ToolFailure = ToolError::Timeout("bash".to_string()).into();
        assert_eq!(failure, ToolFailure::Timeout);
        let failure: ToolFailure = ToolError::invalid_params("glob", "missing pattern").into();
        assert_eq!(
            failure,
            ToolFailure::InvalidInput {
                message: "missing pattern".to_string()
            }
        );
    }

    #[test]
    fn usage_accumulates() {
        let mut total = Usage::default();
        total += Usage {
            input_tokens: 10,
            output_tokens: 5,
            cost_usd: 0.5,
        };
        total += Usage {
            input_tokens: 1,
            output_tokens: 1,
            cost_usd: 0.25,
        };
        assert_eq!(total.input_tokens, 11);
        assert_eq!(total.output_tokens, 6);
        assert!((total.cost_usd - 0.75).abs() < f64::EPSILON);
    }
}
