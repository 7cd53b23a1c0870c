use std::io::Write;

use async_trait::async_trait;
use eyre::{Result, eyre};
use tiller_core::config::{StoreConfig, Stores};

mod checkpoints;
mod events;
mod messages;
mod sessions;

pub use checkpoints::CheckpointsCommand;
pub use events::EventsCommand;
pub use messages::MessagesCommand;
pub use sessions::SessionsCommand;

#[async_trait]
pub trait Command: Send + Sync {
    async fn execute(&self, out: &mut (dyn Write + Send)) -> Result<()>;
}

pub(crate) async fn open(store: &StoreConfig) -> Result<Stores> {
    store
        .open()
        .await
        .map_err(|e| eyre!("Failed to open session database: {}", e))
}

pub(crate) const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[cfg(test)]
pub(crate) mod fixtures {
    use serde_json::json;
    use tempfile::TempDir;
    use tiller_core::app::domain::checkpoint::CheckpointManager;
    use tiller_core::app::domain::event::{AgentMode, EventKind, MessageOrigin, Usage};
    use tiller_core::app::domain::session::{Branch, Session};
    use tiller_core::app::domain::state::ActorState;
    use tiller_core::app::domain::types::{BranchId, MessageId};
    use tiller_core::config::StoreConfig;
    use tiller_tools::{ToolCall, ToolOutput};

    pub struct Seeded {
        pub _dir: TempDir,
        pub store: StoreConfig,
        pub session: Session,
        pub branch_id: BranchId,
    }

    /// A SQLite database holding one session with a single completed tool
    /// turn and a checkpoint after it.
    pub async fn seeded() -> Seeded {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreConfig::sqlite(dir.path().join("sessions.db"));
        let stores = store.open().await.unwrap();

        let session = Session::new(Some("inspect me".to_string()));
        stores.storage.create_session(&session).await.unwrap();
        let branch = Branch::new(session.id, Some("main".to_string()));
        stores.storage.create_branch(&branch).await.unwrap();

        let call = ToolCall::new("call-1", "glob", json!({"pattern": "*.rs"}));
        let kinds = vec![
            EventKind::MessageAppended {
                turn: 1,
                message_id: MessageId::for_turn(1, 0),
                content: "list the rust files".to_string(),
                mode: AgentMode::Build,
                origin: MessageOrigin::Submitted,
            },
            EventKind::ToolCallRequested {
                turn: 1,
                round: 1,
                attempt: 1,
                call: call.clone(),
            },
            EventKind::ToolCallCompleted {
                turn: 1,
                call_id: call.id,
                tool_name: call.name,
                output: ToolOutput::text("src/lib.rs"),
            },
            EventKind::AssistantTextDelta {
                turn: 1,
                round: 2,
                attempt: 1,
                text: "Just src/lib.rs.".to_string(),
            },
            EventKind::TurnCompleted {
                turn: 1,
                final_message: "Just src/lib.rs.".to_string(),
                cost: Usage::default(),
                rounds: 2,
            },
        ];
        let mut events = Vec::new();
        for kind in &kinds {
            events.push(stores.events.append(branch.id, kind).await.unwrap());
        }

        let checkpoints = CheckpointManager::new(stores.checkpoints.clone(), 3, None);
        checkpoints
            .checkpoint(&ActorState::replay(branch.id, &events))
            .await
            .unwrap();

        Seeded {
            _dir: dir,
            store,
            session,
            branch_id: branch.id,
        }
    }

    pub fn text(out: Vec<u8>) -> String {
        String::from_utf8(out).unwrap()
    }
}
