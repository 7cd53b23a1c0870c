pub mod store;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::RetryPolicy;
use crate::app::domain::session::event_log::DEFAULT_EVENT_BUFFER_CAPACITY;
use crate::utils::paths::AppPaths;

pub use store::{StoreConfig, Stores};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Could not determine home directory")]
    NoHomeDir,
}

/// Tunables for actor processes and their agent loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Provider rounds allowed per turn before it fails as over budget.
    pub max_rounds: u32,
    /// Checkpoint inside a long turn after this many tool calls; `None`
    /// checkpoints only at turn boundaries.
    pub checkpoint_every_tool_calls: Option<u32>,
    pub checkpoint_retention: usize,
    pub provider_timeout_ms: u64,
    pub tool_timeout_ms: u64,
    pub retry: RetryPolicy,
    pub mailbox_capacity: usize,
    pub event_buffer_capacity: usize,
    pub teardown_timeout_ms: u64,
    /// System prompt sent with every completion request.
    pub instructions: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_rounds: 25,
            checkpoint_every_tool_calls: Some(8),
            checkpoint_retention: 3,
            provider_timeout_ms: 120_000,
            tool_timeout_ms: 60_000,
            retry: RetryPolicy::default(),
            mailbox_capacity: 32,
            event_buffer_capacity: DEFAULT_EVENT_BUFFER_CAPACITY,
            teardown_timeout_ms: 5_000,
            instructions: None,
        }
    }
}

impl RuntimeConfig {
    pub fn default_path() -> Option<PathBuf> {
        AppPaths::config_file()
    }

    /// Reads config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_toml_str(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file; using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_rounds == 0 {
            return Err(ConfigError::Invalid("max_rounds must be at least 1".into()));
        }
        if self.mailbox_capacity == 0 || self.event_buffer_capacity == 0 {
            return Err(ConfigError::Invalid(
                "channel capacities must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn empty_toml_is_all_defaults() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn partial_toml_overrides_fields() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            max_rounds = 4
            instructions = "be brief"

            [retry]
            max_attempts = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.max_rounds, 4);
        assert_eq!(config.instructions.as_deref(), Some("be brief"));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_backoff_ms, RetryPolicy::default().initial_backoff_ms);
        assert_eq!(config.checkpoint_retention, 3);
    }

    #[rstest]
    #[case::zero_rounds("max_rounds = 0")]
    #[case::zero_mailbox("mailbox_capacity = 0")]
    #[case::wrong_type("max_rounds = \"many\"")]
    fn rejects_bad_config(#[case] contents: &str) {
        assert!(RuntimeConfig::from_toml_str(contents).is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "teardown_timeout_ms = 10\n").unwrap();
        let config = RuntimeConfig::load(&path).unwrap();
        assert_eq!(config.teardown_timeout(), Duration::from_millis(10));
    }
}
