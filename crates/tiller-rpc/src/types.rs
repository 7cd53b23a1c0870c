use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tiller_core::app::domain::event::{AgentMode, SteerKind};
use tiller_core::app::domain::message::Message;
use tiller_core::app::domain::session::{Branch, Session};
use tiller_core::app::domain::types::{BranchId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCreated {
    pub session_id: SessionId,
    pub branch_id: BranchId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub branch_ids: Vec<BranchId>,
}

impl From<Session> for SessionInfo {
    fn from(session: Session) -> Self {
        Self {
            id: session.id,
            name: session.name,
            created_at: session.created_at,
            updated_at: session.updated_at,
            branch_ids: session.branch_ids,
        }
    }
}

/// Unary calls in wire form. Event subscriptions are streamed and go
/// through [`crate::AgentService::subscribe_events`] instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RpcRequest {
    CreateSession {
        #[serde(default)]
        first_message: Option<String>,
        #[serde(default)]
        mode: Option<AgentMode>,
    },
    ListSessions,
    SendMessage {
        session_id: SessionId,
        branch_id: BranchId,
        content: String,
        #[serde(default)]
        mode: Option<AgentMode>,
    },
    ListMessages {
        session_id: SessionId,
        branch_id: BranchId,
    },
    Steer {
        branch_id: BranchId,
        command: SteerKind,
    },
    CreateBranch {
        session_id: SessionId,
        #[serde(default)]
        name: Option<String>,
    },
    RestartBranch {
        branch_id: BranchId,
    },
    DeleteSession {
        session_id: SessionId,
    },
}

impl RpcRequest {
    pub fn method(&self) -> &'static str {
        match self {
            RpcRequest::CreateSession { .. } => "create_session",
            RpcRequest::ListSessions => "list_sessions",
            RpcRequest::SendMessage { .. } => "send_message",
            RpcRequest::ListMessages { .. } => "list_messages",
            RpcRequest::Steer { .. } => "steer",
            RpcRequest::CreateBranch { .. } => "create_branch",
            RpcRequest::RestartBranch { .. } => "restart_branch",
            RpcRequest::DeleteSession { .. } => "delete_session",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RpcResponse {
    SessionCreated(SessionCreated),
    Sessions { sessions: Vec<SessionInfo> },
    Messages { messages: Vec<Message> },
    Branch { branch: Branch },
    Ack,
}
