use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::app::domain::types::{BranchId, SessionId};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Branch not found: {branch_id}")]
    BranchNotFound { branch_id: String },

    #[error("Database error: {message}")]
    Database { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("In-memory storage lock poisoned: {message}")]
    LockPoisoned { message: String },
}

impl StorageError {
    pub fn session_not_found(session_id: SessionId) -> Self {
        Self::SessionNotFound {
            session_id: session_id.to_string(),
        }
    }

    pub fn branch_not_found(branch_id: BranchId) -> Self {
        Self::BranchNotFound {
            branch_id: branch_id.to_string(),
        }
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn lock_poisoned(message: impl Into<String>) -> Self {
        Self::LockPoisoned {
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::SessionNotFound { .. } | StorageError::BranchNotFound { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub branch_ids: Vec<BranchId>,
}

impl Session {
    pub fn new(name: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            name,
            created_at: now,
            updated_at: now,
            branch_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BranchStatus {
    Active,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    pub session_id: SessionId,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status: BranchStatus,
}

impl Branch {
    pub fn new(session_id: SessionId, name: Option<String>) -> Self {
        Self {
            id: BranchId::new(),
            session_id,
            name,
            created_at: Utc::now(),
            status: BranchStatus::Active,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Durable CRUD for session and branch metadata, independent of the event log.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    async fn create_session(&self, session: &Session) -> Result<(), StorageError>;

    async fn get_session(&self, session_id: SessionId) -> Result<Session, StorageError>;

    /// Sessions ordered by `updated_at`, most recent first.
    async fn list_sessions(&self, filter: SessionFilter) -> Result<Vec<Session>, StorageError>;

    async fn touch_session(
        &self,
        session_id: SessionId,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Removes the session together with its branch records.
    async fn delete_session(&self, session_id: SessionId) -> Result<(), StorageError>;

    async fn create_branch(&self, branch: &Branch) -> Result<(), StorageError>;

    async fn get_branch(&self, branch_id: BranchId) -> Result<Branch, StorageError>;

    async fn set_branch_status(
        &self,
        branch_id: BranchId,
        status: BranchStatus,
    ) -> Result<(), StorageError>;
}

pub(crate) fn paginate<T>(items: Vec<T>, filter: &SessionFilter) -> Vec<T> {
    let offset = filter.offset.unwrap_or(0);
    let limit = filter.limit.unwrap_or(usize::MAX);
    items.into_iter().skip(offset).take(limit).collect()
}

#[derive(Default)]
pub struct InMemoryStorage {
    sessions: RwLock<HashMap<SessionId, Session>>,
    branches: RwLock<HashMap<BranchId, Branch>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStorage for InMemoryStorage {
    async fn create_session(&self, session: &Session) -> Result<(), StorageError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| StorageError::lock_poisoned("sessions"))?;
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: SessionId) -> Result<Session, StorageError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| StorageError::lock_poisoned("sessions"))?;
        sessions
            .get(&session_id)
            .cloned()
            .ok_or_else(|| StorageError::session_not_found(session_id))
    }

    async fn list_sessions(&self, filter: SessionFilter) -> Result<Vec<Session>, StorageError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| StorageError::lock_poisoned("sessions"))?;
        let mut all: Vec<Session> = sessions.values().cloned().collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(paginate(all, &filter))
    }

    async fn touch_session(
        &self,
        session_id: SessionId,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| StorageError::lock_poisoned("sessions"))?;
        let session = sessions
            .get_mut(&session_id)
            .ok_or_else(|| StorageError::session_not_found(session_id))?;
        session.updated_at = at;
        Ok(())
    }

    async fn delete_session(&self, session_id: SessionId) -> Result<(), StorageError> {
        let removed = self
            .sessions
            .write()
            .map_err(|_| StorageError::lock_poisoned("sessions"))?
            .remove(&session_id)
            .ok_or_else(|| StorageError::session_not_found(session_id))?;

        let mut branches = self
            .branches
            .write()
            .map_err(|_| StorageError::lock_poisoned("branches"))?;
        for branch_id in removed.branch_ids {
            branches.remove(&branch_id);
        }
        Ok(())
    }

    async fn create_branch(&self, branch: &Branch) -> Result<(), StorageError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| StorageError::lock_poisoned("sessions"))?;
        let session = sessions
            .get_mut(&branch.session_id)
            .ok_or_else(|| StorageError::session_not_found(branch.session_id))?;
        session.branch_ids.push(branch.id);
        session.updated_at = branch.created_at.max(session.updated_at);
        drop(sessions);

        let mut branches = self
            .branches
            .write()
            .map_err(|_| StorageError::lock_poisoned("branches"))?;
        branches.insert(branch.id, branch.clone());
        Ok(())
    }

    async fn get_branch(&self, branch_id: BranchId) -> Result<Branch, StorageError> {
        let branches = self
            .branches
            .read()
            .map_err(|_| StorageError::lock_poisoned("branches"))?;
        branches
            .get(&branch_id)
            .cloned()
            .ok_or_else(|| StorageError::branch_not_found(branch_id))
    }

    async fn set_branch_status(
        &self,
        branch_id: BranchId,
        status: BranchStatus,
    ) -> Result<(), StorageError> {
        let mut branches = self
            .branches
            .write()
            .map_err(|_| StorageError::lock_poisoned("branches"))?;
        let branch = branches
            .get_mut(&branch_id)
            .ok_or_else(|| StorageError::branch_not_found(branch_id))?;
        branch.status = status;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn sessions_are_listed_most_recent_first() {
        let storage = InMemoryStorage::new();
        let older = Session::new(Some("older".to_string()));
        let newer = Session::new(Some("newer".to_string()));
        storage.create_session(&older).await.unwrap();
        storage.create_session(&newer).await.unwrap();

        storage
            .touch_session(older.id, Utc::now() + Duration::seconds(10))
            .await
            .unwrap();

        let listed = storage
            .list_sessions(SessionFilter::default())
            .await
            .unwrap();
        assert_eq!(listed[0].id, older.id);
        assert_eq!(listed[1].id, newer.id);

        let limited = storage
            .list_sessions(SessionFilter {
                limit: Some(1),
                offset: Some(1),
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, newer.id);
    }

    #[tokio::test]
    async fn branches_require_a_session() {
        let storage = InMemoryStorage::new();
        let orphan = Branch::new(SessionId::new(), None);
        let err = storage.create_branch(&orphan).await.unwrap_err();
        assert!(matches!(err, StorageError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn deleting_a_session_removes_its_branches() {
        let storage = InMemoryStorage::new();
        let session = Session::new(None);
        storage.create_session(&session).await.unwrap();
        let branch = Branch::new(session.id, Some("main".to_string()));
        storage.create_branch(&branch).await.unwrap();

        assert_eq!(
            storage.get_session(session.id).await.unwrap().branch_ids,
            vec![branch.id]
        );

        storage
            .set_branch_status(
                branch.id,
                BranchStatus::Failed {
                    reason: "disk full".to_string(),
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            storage.get_branch(branch.id).await.unwrap().status,
            BranchStatus::Failed { .. }
        ));

        storage.delete_session(session.id).await.unwrap();
        assert!(storage.get_branch(branch.id).await.unwrap_err().is_not_found());
        assert!(storage.get_session(session.id).await.unwrap_err().is_not_found());
    }
}
