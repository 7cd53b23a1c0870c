use std::io::Write;

use async_trait::async_trait;
use chrono::Local;
use eyre::{Result, eyre};
use tiller_core::app::domain::session::SessionFilter;
use tiller_core::config::StoreConfig;

use super::{Command, TIME_FORMAT, open};

pub struct SessionsCommand {
    pub store: StoreConfig,
    pub limit: Option<usize>,
}

#[async_trait]
impl Command for SessionsCommand {
    async fn execute(&self, out: &mut (dyn Write + Send)) -> Result<()> {
        let stores = open(&self.store).await?;
        let sessions = stores
            .storage
            .list_sessions(SessionFilter {
                limit: self.limit,
                offset: None,
            })
            .await
            .map_err(|e| eyre!("Failed to list sessions: {}", e))?;

        if sessions.is_empty() {
            writeln!(out, "No sessions found.")?;
            return Ok(());
        }

        writeln!(
            out,
            "{:<36} {:<20} {:<20} {:<8} {:<30}",
            "ID", "Created", "Updated", "Branches", "Name"
        )?;
        writeln!(out, "{}", "-".repeat(118))?;

        for session in sessions {
            writeln!(
                out,
                "{:<36} {:<20} {:<20} {:<8} {:<30}",
                session.id,
                session.created_at.with_timezone(&Local).format(TIME_FORMAT),
                session.updated_at.with_timezone(&Local).format(TIME_FORMAT),
                session.branch_ids.len(),
                session.name.as_deref().unwrap_or("N/A"),
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::fixtures::{seeded, text};

    #[tokio::test]
    async fn lists_seeded_session() {
        let seeded = seeded().await;
        let mut out = Vec::new();
        SessionsCommand {
            store: seeded.store.clone(),
            limit: None,
        }
        .execute(&mut out)
        .await
        .unwrap();

        let out = text(out);
        assert!(out.contains(&seeded.session.id.to_string()));
        assert!(out.contains("inspect me"));
    }

    #[tokio::test]
    async fn empty_database() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = Vec::new();
        SessionsCommand {
            store: StoreConfig::sqlite(dir.path().join("empty.db")),
            limit: Some(5),
        }
        .execute(&mut out)
        .await
        .unwrap();
        assert_eq!(text(out), "No sessions found.\n");
    }
}
