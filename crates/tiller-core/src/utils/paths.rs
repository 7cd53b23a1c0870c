use std::path::PathBuf;

/// Standard user-level locations for Tiller state.
///
/// Everything lives under `~/.tiller`; `None` when no home directory can be
/// resolved.
pub struct AppPaths;

impl AppPaths {
    pub fn home_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".tiller"))
    }

    /// `~/.tiller/config.toml`
    pub fn config_file() -> Option<PathBuf> {
        Self::home_dir().map(|d| d.join("config.toml"))
    }

    /// `~/.tiller/sessions.db`
    pub fn session_db() -> Option<PathBuf> {
        Self::home_dir().map(|d| d.join("sessions.db"))
    }

    pub fn log_dir() -> Option<PathBuf> {
        Self::home_dir().map(|d| d.join("logs"))
    }
}
