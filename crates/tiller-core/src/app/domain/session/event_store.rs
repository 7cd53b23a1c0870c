use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use crate::app::domain::event::{Event, EventKind};
use crate::app::domain::types::BranchId;

#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("Branch not found: {branch_id}")]
    BranchNotFound { branch_id: String },

    #[error("Durability failure: {message}")]
    IoFailure { message: String },

    #[error("Database error: {message}")]
    Database { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Migration error: {message}")]
    Migration { message: String },

    #[error("In-memory store lock poisoned: {message}")]
    LockPoisoned { message: String },
}

impl EventStoreError {
    pub fn io_failure(message: impl Into<String>) -> Self {
        Self::IoFailure {
            message: message.into(),
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

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn lock_poisoned(message: impl Into<String>) -> Self {
        Self::LockPoisoned {
            message: message.into(),
        }
    }
}

/// Append-only, per-branch ordered event persistence.
///
/// Sequence numbers start at 1 and are gapless within a branch. Only the
/// branch's actor process appends, so implementations need not arbitrate
/// between concurrent writers of one branch, but must allow concurrent reads.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persists the event and returns it with its assigned sequence and
    /// timestamp. The event is durable once this returns `Ok`.
    async fn append(&self, branch_id: BranchId, kind: &EventKind)
    -> Result<Event, EventStoreError>;

    /// Events with `after < sequence <= upto`, in sequence order.
    async fn load_events(
        &self,
        branch_id: BranchId,
        after: u64,
        upto: Option<u64>,
    ) -> Result<Vec<Event>, EventStoreError>;

    /// Highest sequence in the branch, or 0 for an empty branch.
    async fn latest_sequence(&self, branch_id: BranchId) -> Result<u64, EventStoreError>;

    async fn delete_branch(&self, branch_id: BranchId) -> Result<(), EventStoreError>;
}

#[derive(Default)]
pub struct InMemoryEventStore {
    events: RwLock<HashMap<BranchId, Vec<Event>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        branch_id: BranchId,
        kind: &EventKind,
    ) -> Result<Event, EventStoreError> {
        let mut events = self
            .events
            .write()
            .map_err(|_| EventStoreError::lock_poisoned("events"))?;
        let branch_events = events.entry(branch_id).or_default();

        let event = Event {
            branch_id,
            sequence: branch_events.last().map_or(1, |e| e.sequence + 1),
            timestamp: Utc::now(),
            kind: kind.clone(),
        };
        branch_events.push(event.clone());

        Ok(event)
    }

    async fn load_events(
        &self,
        branch_id: BranchId,
        after: u64,
        upto: Option<u64>,
    ) -> Result<Vec<Event>, EventStoreError> {
        let events = self
            .events
            .read()
            .map_err(|_| EventStoreError::lock_poisoned("events"))?;
        Ok(events
            .get(&branch_id)
            .map(|e| {
                e.iter()
                    .filter(|ev| ev.sequence > after && upto.is_none_or(|u| ev.sequence <= u))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn latest_sequence(&self, branch_id: BranchId) -> Result<u64, EventStoreError> {
        let events = self
            .events
            .read()
            .map_err(|_| EventStoreError::lock_poisoned("events"))?;
        Ok(events
            .get(&branch_id)
            .and_then(|e| e.last().map(|ev| ev.sequence))
            .unwrap_or(0))
    }

    async fn delete_branch(&self, branch_id: BranchId) -> Result<(), EventStoreError> {
        let mut events = self
            .events
            .write()
            .map_err(|_| EventStoreError::lock_poisoned("events"))?;
        events.remove(&branch_id);
        Ok(())
    }
}
