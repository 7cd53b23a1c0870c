use serde::{Deserialize, Serialize};
use thiserror::Error;
use tiller_core::api::ProviderError;
use tiller_core::app::domain::checkpoint::CheckpointError;
use tiller_core::app::domain::runtime::{ActorProcessError, RegistryError};
use tiller_core::app::domain::session::{EventStoreError, StorageError};
use tiller_core::config::ConfigError;
use tiller_tools::ToolError;

/// The one error surface callers see. Serialized with a `kind` tag so a
/// client can branch on it without parsing messages.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RpcError {
    #[error("Storage error: {message}")]
    Storage { message: String, not_found: bool },

    #[error("Event store error: {message}")]
    EventStore { message: String },

    #[error("Checkpoint error: {message}")]
    Checkpoint { message: String },

    #[error("Actor process error: {message}")]
    ActorProcess { message: String, state: ProcessErrorKind },

    #[error("Provider error: {message}")]
    Provider { message: String, transient: bool },

    #[error("Tool error: {message}")]
    Tool { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessErrorKind {
    AlreadyRunning,
    NotFound,
    Failed,
    Unavailable,
}

impl RpcError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable identifier for the error family.
    pub fn code(&self) -> &'static str {
        match self {
            RpcError::Storage { not_found: true, .. } => "not_found",
            RpcError::Storage { .. } => "storage",
            RpcError::EventStore { .. } => "event_store",
            RpcError::Checkpoint { .. } => "checkpoint",
            RpcError::ActorProcess { .. } => "actor_process",
            RpcError::Provider { .. } => "provider",
            RpcError::Tool { .. } => "tool",
            RpcError::Config { .. } => "config",
            RpcError::InvalidArgument { .. } => "invalid_argument",
            RpcError::Internal { .. } => "internal",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RpcError::Storage {
                not_found: true,
                ..
            } | RpcError::ActorProcess {
                state: ProcessErrorKind::NotFound,
                ..
            }
        )
    }
}

impl From<StorageError> for RpcError {
    fn from(err: StorageError) -> Self {
        RpcError::Storage {
            not_found: err.is_not_found(),
            message: err.to_string(),
        }
    }
}

impl From<EventStoreError> for RpcError {
    fn from(err: EventStoreError) -> Self {
        RpcError::EventStore {
            message: err.to_string(),
        }
    }
}

impl From<CheckpointError> for RpcError {
    fn from(err: CheckpointError) -> Self {
        RpcError::Checkpoint {
            message: err.to_string(),
        }
    }
}

impl From<ActorProcessError> for RpcError {
    fn from(err: ActorProcessError) -> Self {
        let state = match &err {
            ActorProcessError::AlreadyRunning { .. } => ProcessErrorKind::AlreadyRunning,
            ActorProcessError::NotFound { .. } => ProcessErrorKind::NotFound,
            ActorProcessError::Failed { .. } => ProcessErrorKind::Failed,
            ActorProcessError::ShuttingDown | ActorProcessError::ChannelClosed => {
                ProcessErrorKind::Unavailable
            }
        };
        RpcError::ActorProcess {
            message: err.to_string(),
            state,
        }
    }
}

impl From<ProviderError> for RpcError {
    fn from(err: ProviderError) -> Self {
        RpcError::Provider {
            transient: err.is_transient(),
            message: err.to_string(),
        }
    }
}

impl From<ToolError> for RpcError {
    fn from(err: ToolError) -> Self {
        RpcError::Tool {
            message: err.to_string(),
        }
    }
}

impl From<ConfigError> for RpcError {
    fn from(err: ConfigError) -> Self {
        RpcError::Config {
            message: err.to_string(),
        }
    }
}

impl From<RegistryError> for RpcError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Storage(e) => e.into(),
            RegistryError::EventStore(e) => e.into(),
            RegistryError::Checkpoint(e) => e.into(),
            RegistryError::ActorProcess(e) => e.into(),
            RegistryError::LockPoisoned => RpcError::internal(err.to_string()),
        }
    }
}

impl From<tiller_core::error::Error> for RpcError {
    fn from(err: tiller_core::error::Error) -> Self {
        use tiller_core::error::Error;
        match err {
            Error::Storage(e) => e.into(),
            Error::EventStore(e) => e.into(),
            Error::Checkpoint(e) => e.into(),
            Error::ActorProcess(e) => e.into(),
            Error::Registry(e) => e.into(),
            Error::Provider(e) => e.into(),
            Error::Tool(e) => e.into(),
            Error::Config(e) => e.into(),
            Error::Io(e) => RpcError::internal(e.to_string()),
        }
    }
}
