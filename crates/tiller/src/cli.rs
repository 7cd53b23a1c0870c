use std::path::PathBuf;

use clap::{Parser, Subcommand};
use eyre::Result;
use tiller_core::app::domain::types::BranchId;
use tiller_core::config::StoreConfig;

/// Inspect the sessions, event logs and checkpoints of a Tiller database.
#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the session database file (defaults to ~/.tiller/sessions.db)
    #[arg(long, env = "TILLER_SESSION_DB", global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn store(&self) -> Result<StoreConfig> {
        match &self.db {
            Some(path) => Ok(StoreConfig::sqlite(path.clone())),
            None => Ok(StoreConfig::default_sqlite()?),
        }
    }
}

#[derive(Subcommand, Clone)]
pub enum Commands {
    /// List sessions, most recently updated first
    Sessions {
        /// Maximum number of sessions to show
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Dump a branch's event log
    Events {
        branch: BranchId,
        /// First sequence number to show
        #[arg(long, default_value_t = 1)]
        from: u64,
        /// Print one JSON object per event
        #[arg(long)]
        json: bool,
    },
    /// Show the conversation folded from a branch's events
    Messages {
        branch: BranchId,
        /// Include assistant tool rounds and tool results
        #[arg(long)]
        history: bool,
    },
    /// List the checkpoints kept for a branch
    Checkpoints { branch: BranchId },
}
