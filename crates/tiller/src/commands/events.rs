use std::io::Write;

use async_trait::async_trait;
use chrono::Local;
use eyre::{Result, eyre};
use tiller_core::app::domain::event::{Event, EventKind};
use tiller_core::app::domain::types::BranchId;
use tiller_core::config::StoreConfig;

use super::{Command, TIME_FORMAT, open};

pub struct EventsCommand {
    pub store: StoreConfig,
    pub branch: BranchId,
    pub from: u64,
    pub json: bool,
}

#[async_trait]
impl Command for EventsCommand {
    async fn execute(&self, out: &mut (dyn Write + Send)) -> Result<()> {
        let stores = open(&self.store).await?;
        let events = stores
            .events
            .load_events(self.branch, self.from.saturating_sub(1), None)
            .await
            .map_err(|e| eyre!("Failed to load events for {}: {}", self.branch, e))?;

        if events.is_empty() && !self.json {
            writeln!(out, "No events for branch {} from {}.", self.branch, self.from)?;
            return Ok(());
        }

        for event in &events {
            if self.json {
                writeln!(out, "{}", serde_json::to_string(event)?)?;
            } else {
                writeln!(
                    out,
                    "{:>6} {:<20} {:<20} turn {:<4} {}",
                    event.sequence,
                    event.timestamp.with_timezone(&Local).format(TIME_FORMAT),
                    event.kind.name(),
                    event.kind.turn(),
                    summary(event),
                )?;
            }
        }

        Ok(())
    }
}

fn summary(event: &Event) -> String {
    match &event.kind {
        EventKind::MessageAppended {
            content, origin, ..
        } => format!("{origin:?}: {}", clip(content)),
        EventKind::AssistantTextDelta {
            round,
            attempt,
            text,
            ..
        } => format!("round {round} attempt {attempt}: {}", clip(text)),
        EventKind::ToolCallRequested { call, .. } => format!("{} ({})", call.name, call.id),
        EventKind::ToolCallCompleted {
            tool_name, call_id, ..
        } => format!("{tool_name} ({call_id}) ok"),
        EventKind::ToolCallFailed {
            tool_name,
            call_id,
            failure,
            ..
        } => format!("{tool_name} ({call_id}) {failure}"),
        EventKind::TurnCompleted { rounds, cost, .. } => format!(
            "{rounds} rounds, {} in / {} out tokens",
            cost.input_tokens, cost.output_tokens
        ),
        EventKind::TurnFailed { reason, .. } => reason.to_string(),
        EventKind::Checkpointed { sequence, .. } => format!("at sequence {sequence}"),
        EventKind::Steered { command, .. } => format!("{command:?}"),
    }
}

fn clip(text: &str) -> String {
    const MAX: usize = 60;
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > MAX || line.len() < text.len() {
        let clipped: String = line.chars().take(MAX).collect();
        format!("{clipped}...")
    } else {
        line.to_string()
    }
}
