use std::io::Write;

use async_trait::async_trait;
use chrono::Local;
use eyre::{Result, eyre};
use tiller_core::app::domain::types::BranchId;
use tiller_core::config::StoreConfig;

use super::{Command, TIME_FORMAT, open};

pub struct CheckpointsCommand {
    pub store: StoreConfig,
    pub branch: BranchId,
}

#[async_trait]
impl Command for CheckpointsCommand {
    async fn execute(&self, out: &mut (dyn Write + Send)) -> Result<()> {
        let stores = open(&self.store).await?;
        let checkpoints = stores
            .checkpoints
            .list(self.branch)
            .await
            .map_err(|e| eyre!("Failed to list checkpoints for {}: {}", self.branch, e))?;

        if checkpoints.is_empty() {
            writeln!(out, "No checkpoints for branch {}.", self.branch)?;
            return Ok(());
        }

        writeln!(
            out,
            "{:>8} {:<20} {:<12} {:>6} {:>8}",
            "Sequence", "Created", "Phase", "Turn", "Queued"
        )?;
        writeln!(out, "{}", "-".repeat(58))?;

        for checkpoint in checkpoints {
            let created = checkpoint.created_at.with_timezone(&Local).format(TIME_FORMAT);
            match checkpoint.decode() {
                Ok(state) => writeln!(
                    out,
                    "{:>8} {:<20} {:<12} {:>6} {:>8}",
                    checkpoint.sequence,
                    created,
                    state.phase,
                    state.turn_cursor.turn,
                    state.queued_inputs.len(),
                )?,
                Err(e) => {
                    tracing::debug!(sequence = checkpoint.sequence, error = %e, "Undecodable checkpoint");
                    writeln!(
                        out,
                        "{:>8} {:<20} {:<12}",
                        checkpoint.sequence, created, "undecodable"
                    )?;
                }
            }
        }

        Ok(())
    }
}
