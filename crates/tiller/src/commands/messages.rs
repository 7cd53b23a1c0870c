use std::io::Write;

use async_trait::async_trait;
use eyre::{Result, eyre};
use tiller_core::app::domain::message::{Role, fold_history, fold_transcript};
use tiller_core::app::domain::types::BranchId;
use tiller_core::config::StoreConfig;

use super::{Command, open};

pub struct MessagesCommand {
    pub store: StoreConfig,
    pub branch: BranchId,
    pub history: bool,
}

#[async_trait]
impl Command for MessagesCommand {
    async fn execute(&self, out: &mut (dyn Write + Send)) -> Result<()> {
        let stores = open(&self.store).await?;
        let events = stores
            .events
            .load_events(self.branch, 0, None)
            .await
            .map_err(|e| eyre!("Failed to load events for {}: {}", self.branch, e))?;

        let messages = if self.history {
            fold_history(&events)
        } else {
            fold_transcript(&events)
        };
        if messages.is_empty() {
            writeln!(out, "No messages on branch {}.", self.branch)?;
            return Ok(());
        }

        for message in messages {
            let role = match message.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            writeln!(out, "[{role}] ({}) #{}", message.mode, message.sequence)?;
            for call in &message.tool_calls {
                writeln!(out, "  -> {} {}", call.name, call.parameters)?;
            }
            if !message.content.is_empty() {
                writeln!(out, "{}", message.content)?;
            }
            writeln!(out)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::fixtures::{seeded, text};

    #[tokio::test]
    async fn transcript_has_user_and_final_reply() {
        let seeded = seeded().await;
        let mut out = Vec::new();
        MessagesCommand {
            store: seeded.store.clone(),
            branch: seeded.branch_id,
            history: false,
        }
        .execute(&mut out)
        .await
        .unwrap();

        let out = text(out);
        assert_eq!(out.matches("[user]").count(), 1);
        assert_eq!(out.matches("[assistant]").count(), 1);
        assert!(out.contains("Just src/lib.rs."));
        assert!(!out.contains("[tool]"));
    }

    #[tokio::test]
    async fn history_includes_tool_rounds() {
        let seeded = seeded().await;
        let mut out = Vec::new();
        MessagesCommand {
            store: seeded.store.clone(),
            branch: seeded.branch_id,
            history: true,
        }
        .execute(&mut out)
        .await
        .unwrap();

        let out = text(out);
        assert!(out.contains("-> glob"));
        assert!(out.contains("[tool]"));
    }

    #[tokio::test]
    async fn unknown_branch_has_no_messages() {
        let seeded = seeded().await;
        let branch = BranchId::new();
        let mut out = Vec::new();
        MessagesCommand {
            store: seeded.store.clone(),
            branch,
            history: false,
        }
        .execute(&mut out)
        .await
        .unwrap();
        assert_eq!(text(out), format!("No messages on branch {branch}.\n"));
    }
}
