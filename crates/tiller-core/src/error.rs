use thiserror::Error;
use tiller_tools::ToolError;

use crate::api::ProviderError;
use crate::app::domain::checkpoint::CheckpointError;
use crate::app::domain::runtime::{ActorProcessError, RegistryError};
use crate::app::domain::session::{EventStoreError, StorageError};
use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    EventStore(#[from] EventStoreError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    ActorProcess(#[from] ActorProcessError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
