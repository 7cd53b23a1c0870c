//! Process-wide map from branch to its live actor process.
//!
//! Each branch has its own `OnceCell`, so construction is single-flight per
//! branch without a lock held across awaits: concurrent callers for one
//! branch share the same initialization and observe the same handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tiller_tools::ToolRegistry;
use tokio::sync::OnceCell;

use super::actor::{ActorContext, ActorHandle, ActorProcess, ActorProcessError, Teardown};
use crate::api::Provider;
use crate::app::domain::checkpoint::{CheckpointError, CheckpointManager};
use crate::app::domain::session::{
    Branch, BranchStatus, EventLog, EventStoreError, Session, SessionStorage, StorageError,
};
use crate::app::domain::state::{ActorState, Phase};
use crate::app::domain::types::{BranchId, SessionId};
use crate::config::{RuntimeConfig, StoreConfig, Stores};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    ActorProcess(#[from] ActorProcessError),

    #[error("Session registry lock poisoned")]
    LockPoisoned,
}

type ProcessSlot = Arc<OnceCell<ActorHandle>>;

pub struct SessionRegistry {
    ctx: ActorContext,
    processes: Mutex<HashMap<BranchId, ProcessSlot>>,
    next_process_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new(
        stores: Stores,
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        config: RuntimeConfig,
    ) -> Self {
        let event_log = Arc::new(EventLog::new(stores.events, config.event_buffer_capacity));
        let checkpoints = Arc::new(CheckpointManager::new(
            stores.checkpoints,
            config.checkpoint_retention,
            config.checkpoint_every_tool_calls,
        ));

        Self {
            ctx: ActorContext {
                event_log,
                storage: stores.storage,
                checkpoints,
                provider,
                tools,
                config: Arc::new(config),
            },
            processes: Mutex::new(HashMap::new()),
            next_process_id: AtomicU64::new(1),
        }
    }

    /// Opens the configured stores and builds a registry over them.
    pub async fn open(
        store: &StoreConfig,
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        config: RuntimeConfig,
    ) -> crate::error::Result<Self> {
        let stores = store.open().await?;
        Ok(Self::new(stores, provider, tools, config))
    }

    pub fn event_log(&self) -> &Arc<EventLog> {
        &self.ctx.event_log
    }

    pub fn storage(&self) -> &Arc<dyn SessionStorage> {
        &self.ctx.storage
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.ctx.checkpoints
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.ctx.config
    }

    /// Persists a session with its first branch. No process is started.
    pub async fn create_session(
        &self,
        name: Option<String>,
    ) -> Result<(Session, Branch), RegistryError> {
        let mut session = Session::new(name);
        self.ctx.storage.create_session(&session).await?;
        let branch = self.create_branch(session.id, Some("main".to_string())).await?;
        session.branch_ids.push(branch.id);

        tracing::info!(session_id = %session.id, branch_id = %branch.id, "Session created");
        Ok((session, branch))
    }

    pub async fn create_branch(
        &self,
        session_id: SessionId,
        name: Option<String>,
    ) -> Result<Branch, RegistryError> {
        let branch = Branch::new(session_id, name);
        self.ctx.storage.create_branch(&branch).await?;
        tracing::debug!(session_id = %session_id, branch_id = %branch.id, "Branch created");
        Ok(branch)
    }

    /// Live process for the branch, if any.
    pub fn actor_process(&self, branch_id: BranchId) -> Option<ActorHandle> {
        let processes = self.processes.lock().ok()?;
        processes
            .get(&branch_id)
            .and_then(|slot| slot.get())
            .filter(|handle| handle.is_alive())
            .cloned()
    }

    /// Returns the live process for the branch, starting one from the log and
    /// the latest checkpoint if there is none.
    pub async fn get_or_start_actor_process(
        &self,
        branch_id: BranchId,
    ) -> Result<ActorHandle, RegistryError> {
        let slot = {
            let mut processes = self
                .processes
                .lock()
                .map_err(|_| RegistryError::LockPoisoned)?;
            let stale = processes
                .get(&branch_id)
                .and_then(|slot| slot.get())
                .is_some_and(|handle| !handle.is_alive());
            if stale {
                processes.remove(&branch_id);
            }
            processes
                .entry(branch_id)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        self.initialize(branch_id, slot, false).await
    }

    /// Starts a process for the branch, failing with
    /// [`ActorProcessError::AlreadyRunning`] if one is live or being built.
    pub async fn start_actor_process(
        &self,
        branch_id: BranchId,
    ) -> Result<ActorHandle, RegistryError> {
        let slot = {
            let mut processes = self
                .processes
                .lock()
                .map_err(|_| RegistryError::LockPoisoned)?;
            if let Some(existing) = processes.get(&branch_id) {
                let live = existing.get().is_none_or(ActorHandle::is_alive);
                if live {
                    return Err(ActorProcessError::already_running(branch_id).into());
                }
            }
            let slot: ProcessSlot = Arc::new(OnceCell::new());
            processes.insert(branch_id, slot.clone());
            slot
        };

        self.initialize(branch_id, slot, false).await
    }

    /// Replaces the branch's process with a fresh one, clearing a recorded
    /// failure.
    pub async fn restart_actor_process(
        &self,
        branch_id: BranchId,
    ) -> Result<ActorHandle, RegistryError> {
        if let Some(handle) = self.take(branch_id)? {
            handle.terminate(self.ctx.config.teardown_timeout()).await?;
        }
        self.ctx
            .storage
            .set_branch_status(branch_id, BranchStatus::Active)
            .await?;

        let slot = {
            let mut processes = self
                .processes
                .lock()
                .map_err(|_| RegistryError::LockPoisoned)?;
            processes
                .entry(branch_id)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        tracing::info!(branch_id = %branch_id, "Restarting actor process");
        self.initialize(branch_id, slot, true).await
    }

    /// Stops the branch's process, if any, without touching its data.
    pub async fn stop_actor_process(
        &self,
        branch_id: BranchId,
    ) -> Result<Option<Teardown>, RegistryError> {
        match self.take(branch_id)? {
            Some(handle) => Ok(Some(
                handle.terminate(self.ctx.config.teardown_timeout()).await?,
            )),
            None => Ok(None),
        }
    }

    /// Tears down every branch process of the session, then removes its
    /// events, checkpoints and metadata. Subscriptions to its branches end.
    pub async fn delete_session(&self, session_id: SessionId) -> Result<(), RegistryError> {
        let session = self.ctx.storage.get_session(session_id).await?;

        for branch_id in &session.branch_ids {
            if let Some(teardown) = self.stop_actor_process(*branch_id).await? {
                tracing::debug!(branch_id = %branch_id, ?teardown, "Stopped actor process");
            }
            self.ctx.event_log.close_branch(*branch_id);
            self.ctx.event_log.store().delete_branch(*branch_id).await?;
            self.ctx.checkpoints.delete_branch(*branch_id).await?;
        }

        self.ctx.storage.delete_session(session_id).await?;
        tracing::info!(session_id = %session_id, "Session deleted");
        Ok(())
    }

    /// Stops every live process.
    pub async fn shutdown(&self) {
        let handles: Vec<ActorHandle> = match self.processes.lock() {
            Ok(mut processes) => processes
                .drain()
                .filter_map(|(_, slot)| slot.get().cloned())
                .collect(),
            Err(_) => return,
        };

        for handle in handles {
            if let Err(e) = handle.terminate(self.ctx.config.teardown_timeout()).await {
                tracing::warn!(
                    branch_id = %handle.branch_id(),
                    error = %e,
                    "Failed to record forced teardown"
                );
            }
        }
    }

    fn take(&self, branch_id: BranchId) -> Result<Option<ActorHandle>, RegistryError> {
        let mut processes = self
            .processes
            .lock()
            .map_err(|_| RegistryError::LockPoisoned)?;
        Ok(processes
            .remove(&branch_id)
            .and_then(|slot| slot.get().cloned()))
    }

    async fn initialize(
        &self,
        branch_id: BranchId,
        slot: ProcessSlot,
        force: bool,
    ) -> Result<ActorHandle, RegistryError> {
        match slot
            .get_or_try_init(|| self.construct(branch_id, force))
            .await
        {
            Ok(handle) => Ok(handle.clone()),
            Err(e) => {
                if let Ok(mut processes) = self.processes.lock()
                    && processes
                        .get(&branch_id)
                        .is_some_and(|current| Arc::ptr_eq(current, &slot) && current.get().is_none())
                {
                    processes.remove(&branch_id);
                }
                Err(e)
            }
        }
    }

    async fn construct(&self, branch_id: BranchId, force: bool) -> Result<ActorHandle, RegistryError> {
        let branch = self.ctx.storage.get_branch(branch_id).await?;
        if let BranchStatus::Failed { reason } = branch.status
            && !force
        {
            return Err(ActorProcessError::Failed { reason }.into());
        }

        let state = restore_state(&self.ctx.event_log, &self.ctx.checkpoints, branch_id).await?;
        let process_id = self.next_process_id.fetch_add(1, Ordering::Relaxed);
        Ok(ActorProcess::spawn(process_id, self.ctx.clone(), state))
    }
}

/// Rebuilds a branch's state from its latest usable checkpoint plus the
/// events after it. Checkpoint trouble falls back to a full replay.
pub async fn restore_state(
    event_log: &EventLog,
    checkpoints: &CheckpointManager,
    branch_id: BranchId,
) -> Result<ActorState, EventStoreError> {
    let latest = event_log.store().latest_sequence(branch_id).await?;

    let (mut state, after) = match checkpoints.restore(branch_id).await {
        Ok(Some((checkpoint, state))) if checkpoint.sequence <= latest => {
            (state, checkpoint.sequence)
        }
        Ok(Some((checkpoint, _))) => {
            tracing::warn!(
                branch_id = %branch_id,
                checkpoint_sequence = checkpoint.sequence,
                latest,
                "Checkpoint is ahead of the event log; replaying from the start"
            );
            (ActorState::new(branch_id), 0)
        }
        Ok(None) => (ActorState::new(branch_id), 0),
        Err(e) => {
            tracing::warn!(
                branch_id = %branch_id,
                error = %e,
                "Failed to load checkpoint; replaying from the start"
            );
            (ActorState::new(branch_id), 0)
        }
    };

    let events = event_log.store().load_events(branch_id, after, None).await?;
    for event in &events {
        state.apply(event);
    }

    state.phase = match state.phase {
        Phase::Interrupting => Phase::Running,
        Phase::Failed | Phase::Terminated => Phase::Idle,
        phase => phase,
    };

    tracing::debug!(
        branch_id = %branch_id,
        from_checkpoint = after,
        replayed = events.len(),
        phase = %state.phase,
        "Restored actor state"
    );
    Ok(state)
}
