//! Best-effort snapshots of actor state for crash recovery.
//!
//! The branch log stays authoritative: a checkpoint only shortens replay.
//! Failures here are reported to the caller, which logs and carries on.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::state::ActorState;
use super::types::BranchId;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Database error: {message}")]
    Database { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("In-memory checkpoint store lock poisoned: {message}")]
    LockPoisoned { message: String },
}

impl CheckpointError {
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
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub branch_id: BranchId,
    /// Last branch sequence folded into the captured state.
    pub sequence: u64,
    /// Serialized [`ActorState`].
    pub state: String,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn capture(state: &ActorState) -> Result<Self, CheckpointError> {
        let serialized = serde_json::to_string(state)
            .map_err(|e| CheckpointError::serialization(format!("Failed to encode state: {e}")))?;
        Ok(Self {
            branch_id: state.branch_id,
            sequence: state.last_sequence,
            state: serialized,
            created_at: Utc::now(),
        })
    }

    pub fn decode(&self) -> Result<ActorState, CheckpointError> {
        serde_json::from_str(&self.state)
            .map_err(|e| CheckpointError::serialization(format!("Failed to decode state: {e}")))
    }
}

/// Persistence for checkpoints keyed by `(branch_id, sequence)`; saving at an
/// existing key replaces it.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// Checkpoints for the branch, newest sequence first.
    async fn list(&self, branch_id: BranchId) -> Result<Vec<Checkpoint>, CheckpointError>;

    /// Removes all but the `keep` newest checkpoints; returns how many went.
    async fn prune(&self, branch_id: BranchId, keep: usize) -> Result<usize, CheckpointError>;

    async fn delete_branch(&self, branch_id: BranchId) -> Result<(), CheckpointError>;
}

#[derive(Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<BranchId, Vec<Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let mut checkpoints = self
            .checkpoints
            .write()
            .map_err(|_| CheckpointError::lock_poisoned("checkpoints"))?;
        let branch = checkpoints.entry(checkpoint.branch_id).or_default();
        branch.retain(|existing| existing.sequence != checkpoint.sequence);
        branch.push(checkpoint.clone());
        branch.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        Ok(())
    }

    async fn list(&self, branch_id: BranchId) -> Result<Vec<Checkpoint>, CheckpointError> {
        let checkpoints = self
            .checkpoints
            .read()
            .map_err(|_| CheckpointError::lock_poisoned("checkpoints"))?;
        Ok(checkpoints.get(&branch_id).cloned().unwrap_or_default())
    }

    async fn prune(&self, branch_id: BranchId, keep: usize) -> Result<usize, CheckpointError> {
        let mut checkpoints = self
            .checkpoints
            .write()
            .map_err(|_| CheckpointError::lock_poisoned("checkpoints"))?;
        let Some(branch) = checkpoints.get_mut(&branch_id) else {
            return Ok(0);
        };
        let before = branch.len();
        branch.truncate(keep);
        Ok(before - branch.len())
    }

    async fn delete_branch(&self, branch_id: BranchId) -> Result<(), CheckpointError> {
        let mut checkpoints = self
            .checkpoints
            .write()
            .map_err(|_| CheckpointError::lock_poisoned("checkpoints"))?;
        checkpoints.remove(&branch_id);
        Ok(())
    }
}

pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    retention: usize,
    every_tool_calls: Option<u32>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>, retention: usize, every_tool_calls: Option<u32>) -> Self {
        Self {
            store,
            retention: retention.max(1),
            every_tool_calls: every_tool_calls.filter(|k| *k > 0),
        }
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Whether a long turn has run enough tool calls to warrant a snapshot.
    pub fn due_mid_turn(&self, tool_calls_since_checkpoint: u32) -> bool {
        self.every_tool_calls
            .is_some_and(|every| tool_calls_since_checkpoint >= every)
    }

    pub async fn checkpoint(&self, state: &ActorState) -> Result<Checkpoint, CheckpointError> {
        let checkpoint = Checkpoint::capture(state)?;
        self.store.save(&checkpoint).await?;

        match self.store.prune(state.branch_id, self.retention).await {
            Ok(0) => {}
            Ok(pruned) => tracing::debug!(
                branch_id = %state.branch_id,
                pruned,
                "Pruned old checkpoints"
            ),
            Err(e) => tracing::warn!(
                branch_id = %state.branch_id,
                error = %e,
                "Failed to prune checkpoints"
            ),
        }

        tracing::debug!(
            branch_id = %state.branch_id,
            sequence = checkpoint.sequence,
            phase = %state.phase,
            "Checkpoint saved"
        );
        Ok(checkpoint)
    }

    /// Latest checkpoint that decodes cleanly, with its decoded state.
    pub async fn restore(
        &self,
        branch_id: BranchId,
    ) -> Result<Option<(Checkpoint, ActorState)>, CheckpointError> {
        for checkpoint in self.store.list(branch_id).await? {
            match checkpoint.decode() {
                Ok(state) if state.branch_id == branch_id => return Ok(Some((checkpoint, state))),
                Ok(_) => tracing::warn!(
                    branch_id = %branch_id,
                    sequence = checkpoint.sequence,
                    "Skipping checkpoint recorded for another branch"
                ),
                Err(e) => tracing::warn!(
                    branch_id = %branch_id,
                    sequence = checkpoint.sequence,
                    error = %e,
                    "Skipping undecodable checkpoint"
                ),
            }
        }
        Ok(None)
    }

    pub async fn delete_branch(&self, branch_id: BranchId) -> Result<(), CheckpointError> {
        self.store.delete_branch(branch_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::domain::state::Phase;

    fn manager(retention: usize) -> CheckpointManager {
        CheckpointManager::new(Arc::new(InMemoryCheckpointStore::new()), retention, Some(2))
    }

    fn state_at(branch_id: BranchId, sequence: u64) -> ActorState {
        let mut state = ActorState::new(branch_id);
        state.last_sequence = sequence;
        state
    }

    #[tokio::test]
    async fn restore_returns_most_recent() {
        let manager = manager(3);
        let branch_id = BranchId::new();
        for seq in [4, 9, 6] {
            manager.checkpoint(&state_at(branch_id, seq)).await.unwrap();
        }

        let (checkpoint, state) = manager.restore(branch_id).await.unwrap().unwrap();
        assert_eq!(checkpoint.sequence, 9);
        assert_eq!(state.last_sequence, 9);
        assert!(manager.restore(BranchId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn old_checkpoints_are_pruned() {
        let manager = manager(2);
        let branch_id = BranchId::new();
        for seq in 1..=5 {
            manager.checkpoint(&state_at(branch_id, seq)).await.unwrap();
        }

        let kept: Vec<u64> = manager
            .store()
            .list(branch_id)
            .await
            .unwrap()
            .iter()
            .map(|c| c.sequence)
            .collect();
        assert_eq!(kept, vec![5, 4]);
    }

    #[tokio::test]
    async fn undecodable_checkpoint_falls_back_to_older() {
        let manager = manager(3);
        let branch_id = BranchId::new();
        let mut running = state_at(branch_id, 3);
        running.phase = Phase::Running;
        manager.checkpoint(&running).await.unwrap();

        manager
            .store()
            .save(&Checkpoint {
                branch_id,
                sequence: 7,
                state: "{not json".to_string(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let (checkpoint, state) = manager.restore(branch_id).await.unwrap().unwrap();
        assert_eq!(checkpoint.sequence, 3);
        assert_eq!(state.phase, Phase::Running);
    }

    #[test]
    fn mid_turn_cadence_follows_configuration() {
        let manager = manager(1);
        assert!(!manager.due_mid_turn(1));
        assert!(manager.due_mid_turn(2));

        let disabled =
            CheckpointManager::new(Arc::new(InMemoryCheckpointStore::new()), 1, Some(0));
        assert!(!disabled.due_mid_turn(100));
    }
}
