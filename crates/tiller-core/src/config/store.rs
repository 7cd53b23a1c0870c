use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::app::domain::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use crate::app::domain::session::{
    EventStore, EventStoreError, InMemoryEventStore, InMemoryStorage, SessionStorage, SqliteStore,
};
use crate::utils::paths::AppPaths;

/// Where sessions, events and checkpoints are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    Sqlite { path: PathBuf },
    Memory,
}

impl StoreConfig {
    pub fn sqlite(path: PathBuf) -> Self {
        Self::Sqlite { path }
    }

    pub fn default_sqlite() -> Result<Self, ConfigError> {
        AppPaths::session_db()
            .map(Self::sqlite)
            .ok_or(ConfigError::NoHomeDir)
    }

    pub async fn open(&self) -> Result<Stores, EventStoreError> {
        match self {
            StoreConfig::Sqlite { path } => {
                let store = Arc::new(SqliteStore::new(path).await?);
                tracing::info!(path = %path.display(), "Opened SQLite store");
                Ok(Stores {
                    events: store.clone(),
                    checkpoints: store.clone(),
                    storage: store,
                })
            }
            StoreConfig::Memory => Ok(Stores::in_memory()),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::default_sqlite().unwrap_or_else(|_| Self::sqlite(PathBuf::from("./sessions.db")))
    }
}

/// The three persistence seams, usually backed by one database.
#[derive(Clone)]
pub struct Stores {
    pub events: Arc<dyn EventStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub storage: Arc<dyn SessionStorage>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            events: Arc::new(InMemoryEventStore::new()),
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            storage: Arc::new(InMemoryStorage::new()),
        }
    }
}
