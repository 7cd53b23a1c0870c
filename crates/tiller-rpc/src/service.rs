use std::pin::Pin;
use std::sync::Arc;

use futures::stream::{self, Stream, StreamExt};
use tiller_core::app::domain::event::{AgentMode, Event, SteerKind};
use tiller_core::app::domain::message::{Message, fold_transcript};
use tiller_core::app::domain::runtime::SessionRegistry;
use tiller_core::app::domain::session::{Branch, SessionFilter, StorageError};
use tiller_core::app::domain::types::{BranchId, SessionId};
use tracing::{debug, info, warn};

use crate::error::RpcError;
use crate::types::{RpcRequest, RpcResponse, SessionCreated, SessionInfo};

pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event, RpcError>> + Send>>;

/// Client-facing operations over a [`SessionRegistry`].
#[derive(Clone)]
pub struct AgentService {
    registry: Arc<SessionRegistry>,
}

impl AgentService {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Creates a session with its main branch and starts the branch's
    /// process, submitting `first_message` when given.
    pub async fn create_session(
        &self,
        first_message: Option<String>,
        mode: Option<AgentMode>,
    ) -> Result<SessionCreated, RpcError> {
        if first_message.as_deref().is_some_and(|m| m.trim().is_empty()) {
            return Err(RpcError::invalid_argument("first message is empty"));
        }

        let (session, branch) = self.registry.create_session(None).await?;
        let handle = self.registry.get_or_start_actor_process(branch.id).await?;
        if let Some(content) = first_message {
            handle.submit(content, mode).await?;
        }

        Ok(SessionCreated {
            session_id: session.id,
            branch_id: branch.id,
        })
    }

    /// Sessions ordered by last update, most recent first.
    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>, RpcError> {
        let sessions = self
            .registry
            .storage()
            .list_sessions(SessionFilter::default())
            .await?;
        Ok(sessions.into_iter().map(SessionInfo::from).collect())
    }

    pub async fn send_message(
        &self,
        session_id: SessionId,
        branch_id: BranchId,
        content: String,
        mode: Option<AgentMode>,
    ) -> Result<(), RpcError> {
        if content.trim().is_empty() {
            return Err(RpcError::invalid_argument("message content is empty"));
        }
        self.branch_of(session_id, branch_id).await?;

        let handle = self.registry.get_or_start_actor_process(branch_id).await?;
        handle.submit(content, mode).await?;

        if let Err(e) = self
            .registry
            .storage()
            .touch_session(session_id, chrono::Utc::now())
            .await
        {
            warn!(session_id = %session_id, error = %e, "Failed to update session timestamp");
        }
        debug!(session_id = %session_id, branch_id = %branch_id, "Message submitted");
        Ok(())
    }

    /// User and final assistant messages folded from the branch's events.
    pub async fn list_messages(
        &self,
        session_id: SessionId,
        branch_id: BranchId,
    ) -> Result<Vec<Message>, RpcError> {
        self.branch_of(session_id, branch_id).await?;
        let events = self.registry.event_log().replay(branch_id, None).await?;
        Ok(fold_transcript(&events))
    }

    pub async fn steer(&self, branch_id: BranchId, command: SteerKind) -> Result<(), RpcError> {
        self.registry.storage().get_branch(branch_id).await?;
        let handle = self.registry.get_or_start_actor_process(branch_id).await?;
        handle.steering().send(command).await?;
        Ok(())
    }

    /// Streams events from the start of every branch of `session_id`, then
    /// live ones, ending when the session is deleted. Without a session the
    /// stream is the live tail of all branches. Dropping the stream
    /// unsubscribes.
    pub async fn subscribe_events(
        &self,
        session_id: Option<SessionId>,
    ) -> Result<EventStream, RpcError> {
        let event_log = self.registry.event_log();

        let Some(session_id) = session_id else {
            let tail = event_log.subscribe_all().into_stream();
            return Ok(Box::pin(tail.map(|item| item.map_err(RpcError::from))));
        };

        let session = self.registry.storage().get_session(session_id).await?;
        let mut branches = Vec::with_capacity(session.branch_ids.len());
        for branch_id in session.branch_ids {
            let subscription = event_log.subscribe(branch_id, 1).await?;
            branches.push(subscription.into_stream().boxed());
        }

        debug!(session_id = %session_id, branches = branches.len(), "Event subscription opened");
        Ok(Box::pin(
            stream::select_all(branches).map(|item| item.map_err(RpcError::from)),
        ))
    }

    pub async fn create_branch(
        &self,
        session_id: SessionId,
        name: Option<String>,
    ) -> Result<Branch, RpcError> {
        self.registry.storage().get_session(session_id).await?;
        Ok(self.registry.create_branch(session_id, name).await?)
    }

    /// Replaces the branch's process, clearing a recorded failure.
    pub async fn restart_branch(&self, branch_id: BranchId) -> Result<(), RpcError> {
        let handle = self.registry.restart_actor_process(branch_id).await?;
        info!(branch_id = %branch_id, process_id = handle.process_id(), "Branch restarted");
        Ok(())
    }

    pub async fn delete_session(&self, session_id: SessionId) -> Result<(), RpcError> {
        Ok(self.registry.delete_session(session_id).await?)
    }

    /// Dispatches a unary request in wire form.
    pub async fn handle(&self, request: RpcRequest) -> Result<RpcResponse, RpcError> {
        let method = request.method();
        let result = match request {
            RpcRequest::CreateSession {
                first_message,
                mode,
            } => self
                .create_session(first_message, mode)
                .await
                .map(RpcResponse::SessionCreated),
            RpcRequest::ListSessions => self
                .list_sessions()
                .await
                .map(|sessions| RpcResponse::Sessions { sessions }),
            RpcRequest::SendMessage {
                session_id,
                branch_id,
                content,
                mode,
            } => self
                .send_message(session_id, branch_id, content, mode)
                .await
                .map(|()| RpcResponse::Ack),
            RpcRequest::ListMessages {
                session_id,
                branch_id,
            } => self
                .list_messages(session_id, branch_id)
                .await
                .map(|messages| RpcResponse::Messages { messages }),
            RpcRequest::Steer { branch_id, command } => {
                self.steer(branch_id, command).await.map(|()| RpcResponse::Ack)
            }
            RpcRequest::CreateBranch { session_id, name } => self
                .create_branch(session_id, name)
                .await
                .map(|branch| RpcResponse::Branch { branch }),
            RpcRequest::RestartBranch { branch_id } => {
                self.restart_branch(branch_id).await.map(|()| RpcResponse::Ack)
            }
            RpcRequest::DeleteSession { session_id } => {
                self.delete_session(session_id).await.map(|()| RpcResponse::Ack)
            }
        };

        if let Err(e) = &result {
            debug!(method, code = e.code(), error = %e, "RPC call failed");
        }
        result
    }

    /// The branch, provided it belongs to `session_id`.
    async fn branch_of(
        &self,
        session_id: SessionId,
        branch_id: BranchId,
    ) -> Result<Branch, RpcError> {
        let branch = self.registry.storage().get_branch(branch_id).await?;
        if branch.session_id != session_id {
            return Err(StorageError::branch_not_found(branch_id).into());
        }
        Ok(branch)
    }
}
