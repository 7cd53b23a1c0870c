use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    Row,
    sqlite::{
        SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
        SqliteSynchronous,
    },
};
use std::path::Path;
use std::str::FromStr;

use super::event_store::{EventStore, EventStoreError};
use super::storage::{Branch, BranchStatus, Session, SessionFilter, SessionStorage, StorageError};
use crate::app::domain::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use crate::app::domain::event::{Event, EventKind};
use crate::app::domain::types::{BranchId, SessionId};

/// SQLite-backed event log, checkpoint store and metadata storage sharing one
/// pool. A single connection serializes writes, which also keeps sequence
/// assignment gapless.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(path: &Path) -> Result<Self, EventStoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EventStoreError::connection(format!("Failed to create directory: {e}"))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(|e| EventStoreError::connection(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        Self::connect(options).await
    }

    pub async fn new_in_memory() -> Result<Self, EventStoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| EventStoreError::connection(format!("Invalid SQLite path: {e}")))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, EventStoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| {
                EventStoreError::connection(format!("Failed to connect to SQLite: {e}"))
            })?;

        let store = Self { pool };
        store.run_migrations().await?;

        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), EventStoreError> {
        const MIGRATIONS: [(&str, &str); 5] = [
            (
                "sessions table",
                r"
                CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    name TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )
                ",
            ),
            (
                "branches table",
                r"
                CREATE TABLE IF NOT EXISTS branches (
                    id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL,
                    name TEXT,
                    created_at TEXT NOT NULL,
                    status TEXT NOT NULL,
                    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
                )
                ",
            ),
            (
                "events table",
                r"
                CREATE TABLE IF NOT EXISTS events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    branch_id TEXT NOT NULL,
                    sequence INTEGER NOT NULL,
                    event_type TEXT NOT NULL,
                    event_data TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    UNIQUE(branch_id, sequence)
                )
                ",
            ),
            (
                "checkpoints table",
                r"
                CREATE TABLE IF NOT EXISTS checkpoints (
                    branch_id TEXT NOT NULL,
                    sequence INTEGER NOT NULL,
                    state TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (branch_id, sequence)
                )
                ",
            ),
            (
                "sessions index",
                r"
                CREATE INDEX IF NOT EXISTS idx_sessions_updated_at
                ON sessions(updated_at DESC)
                ",
            ),
        ];

        for (name, sql) in MIGRATIONS {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| EventStoreError::Migration {
                    message: format!("Failed to create {name}: {e}"),
                })?;
        }

        Ok(())
    }

    fn decode_event(row: &SqliteRow, branch_id: BranchId) -> Result<Event, EventStoreError> {
        let sequence: i64 = row
            .try_get("sequence")
            .map_err(|e| EventStoreError::database(format!("Invalid sequence column: {e}")))?;
        let timestamp: DateTime<Utc> = row
            .try_get("created_at")
            .map_err(|e| EventStoreError::database(format!("Invalid timestamp column: {e}")))?;
        let event_data: String = row
            .try_get("event_data")
            .map_err(|e| EventStoreError::database(format!("Invalid event column: {e}")))?;
        let kind: EventKind = serde_json::from_str(&event_data)
            .map_err(|e| EventStoreError::serialization(format!("Invalid event data: {e}")))?;

        Ok(Event {
            branch_id,
            sequence: sequence as u64,
            timestamp,
            kind,
        })
    }

    async fn branch_ids_for(&self, session_id: SessionId) -> Result<Vec<BranchId>, StorageError> {
        let rows = sqlx::query(
            "SELECT id FROM branches WHERE session_id = ?1 ORDER BY created_at ASC, id ASC",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::database(format!("Failed to load branches: {e}")))?;

        rows.iter()
            .map(|row| {
                let id: String = row
                    .try_get("id")
                    .map_err(|e| StorageError::database(format!("Invalid branch id: {e}")))?;
                id.parse()
                    .map_err(|e| StorageError::serialization(format!("Invalid branch id: {e}")))
            })
            .collect()
    }

    async fn decode_session(&self, row: &SqliteRow) -> Result<Session, StorageError> {
        let id: String = row
            .try_get("id")
            .map_err(|e| StorageError::database(format!("Invalid session id: {e}")))?;
        let id: SessionId = id
            .parse()
            .map_err(|e| StorageError::serialization(format!("Invalid session id: {e}")))?;
        Ok(Session {
            id,
            name: row
                .try_get("name")
                .map_err(|e| StorageError::database(format!("Invalid session name: {e}")))?,
            created_at: row
                .try_get("created_at")
                .map_err(|e| StorageError::database(format!("Invalid created_at: {e}")))?,
            updated_at: row
                .try_get("updated_at")
                .map_err(|e| StorageError::database(format!("Invalid updated_at: {e}")))?,
            branch_ids: self.branch_ids_for(id).await?,
        })
    }

    fn decode_branch(row: &SqliteRow) -> Result<Branch, StorageError> {
        let id: String = row
            .try_get("id")
            .map_err(|e| StorageError::database(format!("Invalid branch id: {e}")))?;
        let session_id: String = row
            .try_get("session_id")
            .map_err(|e| StorageError::database(format!("Invalid session id: {e}")))?;
        let status: String = row
            .try_get("status")
            .map_err(|e| StorageError::database(format!("Invalid status: {e}")))?;

        Ok(Branch {
            id: id
                .parse()
                .map_err(|e| StorageError::serialization(format!("Invalid branch id: {e}")))?,
            session_id: session_id
                .parse()
                .map_err(|e| StorageError::serialization(format!("Invalid session id: {e}")))?,
            name: row
                .try_get("name")
                .map_err(|e| StorageError::database(format!("Invalid branch name: {e}")))?,
            created_at: row
                .try_get("created_at")
                .map_err(|e| StorageError::database(format!("Invalid created_at: {e}")))?,
            status: serde_json::from_str(&status)
                .map_err(|e| StorageError::serialization(format!("Invalid status: {e}")))?,
        })
    }
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn append(
        &self,
        branch_id: BranchId,
        kind: &EventKind,
    ) -> Result<Event, EventStoreError> {
        let branch_id_str = branch_id.to_string();
        let event_data = serde_json::to_string(kind).map_err(|e| {
            EventStoreError::serialization(format!("Failed to serialize event: {e}"))
        })?;
        let timestamp = Utc::now();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EventStoreError::io_failure(format!("Failed to begin append: {e}")))?;

        let next_seq: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM events WHERE branch_id = ?1",
        )
        .bind(&branch_id_str)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| EventStoreError::io_failure(format!("Failed to get next sequence: {e}")))?;

        sqlx::query(
            r"
            INSERT INTO events (branch_id, sequence, event_type, event_data, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
        )
        .bind(&branch_id_str)
        .bind(next_seq)
        .bind(kind.name())
        .bind(&event_data)
        .bind(timestamp)
        .execute(&mut *tx)
        .await
        .map_err(|e| EventStoreError::io_failure(format!("Failed to append event: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| EventStoreError::io_failure(format!("Failed to commit append: {e}")))?;

        Ok(Event {
            branch_id,
            sequence: next_seq as u64,
            timestamp,
            kind: kind.clone(),
        })
    }

    async fn load_events(
        &self,
        branch_id: BranchId,
        after: u64,
        upto: Option<u64>,
    ) -> Result<Vec<Event>, EventStoreError> {
        let rows = sqlx::query(
            r"
            SELECT sequence, event_data, created_at
            FROM events
            WHERE branch_id = ?1 AND sequence > ?2 AND (?3 IS NULL OR sequence <= ?3)
            ORDER BY sequence ASC
            ",
        )
        .bind(branch_id.to_string())
        .bind(after as i64)
        .bind(upto.map(|u| u as i64))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EventStoreError::database(format!("Failed to load events: {e}")))?;

        rows.iter()
            .map(|row| Self::decode_event(row, branch_id))
            .collect()
    }

    async fn latest_sequence(&self, branch_id: BranchId) -> Result<u64, EventStoreError> {
        let result: Option<i64> =
            sqlx::query_scalar("SELECT MAX(sequence) FROM events WHERE branch_id = ?1")
                .bind(branch_id.to_string())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    EventStoreError::database(format!("Failed to get latest sequence: {e}"))
                })?;

        Ok(result.map_or(0, |s| s as u64))
    }

    async fn delete_branch(&self, branch_id: BranchId) -> Result<(), EventStoreError> {
        sqlx::query("DELETE FROM events WHERE branch_id = ?1")
            .bind(branch_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| EventStoreError::database(format!("Failed to delete events: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        sqlx::query(
            r"
            INSERT OR REPLACE INTO checkpoints (branch_id, sequence, state, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ",
        )
        .bind(checkpoint.branch_id.to_string())
        .bind(checkpoint.sequence as i64)
        .bind(&checkpoint.state)
        .bind(checkpoint.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| CheckpointError::database(format!("Failed to save checkpoint: {e}")))?;
        Ok(())
    }

    async fn list(&self, branch_id: BranchId) -> Result<Vec<Checkpoint>, CheckpointError> {
        let rows = sqlx::query(
            r"
            SELECT sequence, state, created_at
            FROM checkpoints
            WHERE branch_id = ?1
            ORDER BY sequence DESC
            ",
        )
        .bind(branch_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CheckpointError::database(format!("Failed to load checkpoints: {e}")))?;

        rows.iter()
            .map(|row| {
                let sequence: i64 = row
                    .try_get("sequence")
                    .map_err(|e| CheckpointError::database(format!("Invalid sequence: {e}")))?;
                Ok(Checkpoint {
                    branch_id,
                    sequence: sequence as u64,
                    state: row
                        .try_get("state")
                        .map_err(|e| CheckpointError::database(format!("Invalid state: {e}")))?,
                    created_at: row.try_get("created_at").map_err(|e| {
                        CheckpointError::database(format!("Invalid created_at: {e}"))
                    })?,
                })
            })
            .collect()
    }

    async fn prune(&self, branch_id: BranchId, keep: usize) -> Result<usize, CheckpointError> {
        let result = sqlx::query(
            r"
            DELETE FROM checkpoints
            WHERE branch_id = ?1 AND sequence NOT IN (
                SELECT sequence FROM checkpoints
                WHERE branch_id = ?1
                ORDER BY sequence DESC
                LIMIT ?2
            )
            ",
        )
        .bind(branch_id.to_string())
        .bind(keep as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| CheckpointError::database(format!("Failed to prune checkpoints: {e}")))?;
        Ok(result.rows_affected() as usize)
    }

    async fn delete_branch(&self, branch_id: BranchId) -> Result<(), CheckpointError> {
        sqlx::query("DELETE FROM checkpoints WHERE branch_id = ?1")
            .bind(branch_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| CheckpointError::database(format!("Failed to delete checkpoints: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl SessionStorage for SqliteStore {
    async fn create_session(&self, session: &Session) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO sessions (id, name, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ",
        )
        .bind(session.id.to_string())
        .bind(&session.name)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::database(format!("Failed to create session: {e}")))?;
        Ok(())
    }

    async fn get_session(&self, session_id: SessionId) -> Result<Session, StorageError> {
        let row = sqlx::query("SELECT id, name, created_at, updated_at FROM sessions WHERE id = ?1")
            .bind(session_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::database(format!("Failed to load session: {e}")))?
            .ok_or_else(|| StorageError::session_not_found(session_id))?;
        self.decode_session(&row).await
    }

    async fn list_sessions(&self, filter: SessionFilter) -> Result<Vec<Session>, StorageError> {
        let rows = sqlx::query(
            r"
            SELECT id, name, created_at, updated_at
            FROM sessions
            ORDER BY updated_at DESC
            LIMIT ?1 OFFSET ?2
            ",
        )
        .bind(filter.limit.map_or(-1, |l| l as i64))
        .bind(filter.offset.unwrap_or(0) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::database(format!("Failed to list sessions: {e}")))?;

        let mut sessions = Vec::with_capacity(rows.len());
        for row in &rows {
            sessions.push(self.decode_session(row).await?);
        }
        Ok(sessions)
    }

    async fn touch_session(
        &self,
        session_id: SessionId,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE sessions SET updated_at = ?2 WHERE id = ?1")
            .bind(session_id.to_string())
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::database(format!("Failed to touch session: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::session_not_found(session_id));
        }
        Ok(())
    }

    async fn delete_session(&self, session_id: SessionId) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::database(format!("Failed to delete session: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::session_not_found(session_id));
        }
        Ok(())
    }

    async fn create_branch(&self, branch: &Branch) -> Result<(), StorageError> {
        let status = serde_json::to_string(&branch.status)
            .map_err(|e| StorageError::serialization(format!("Invalid status: {e}")))?;

        let touched = sqlx::query(
            "UPDATE sessions SET updated_at = MAX(updated_at, ?2) WHERE id = ?1",
        )
        .bind(branch.session_id.to_string())
        .bind(branch.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::database(format!("Failed to touch session: {e}")))?;
        if touched.rows_affected() == 0 {
            return Err(StorageError::session_not_found(branch.session_id));
        }

        sqlx::query(
            r"
            INSERT INTO branches (id, session_id, name, created_at, status)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
        )
        .bind(branch.id.to_string())
        .bind(branch.session_id.to_string())
        .bind(&branch.name)
        .bind(branch.created_at)
        .bind(status)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::database(format!("Failed to create branch: {e}")))?;
        Ok(())
    }

    async fn get_branch(&self, branch_id: BranchId) -> Result<Branch, StorageError> {
        let row = sqlx::query(
            "SELECT id, session_id, name, created_at, status FROM branches WHERE id = ?1",
        )
        .bind(branch_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::database(format!("Failed to load branch: {e}")))?
        .ok_or_else(|| StorageError::branch_not_found(branch_id))?;
        Self::decode_branch(&row)
    }

    async fn set_branch_status(
        &self,
        branch_id: BranchId,
        status: BranchStatus,
    ) -> Result<(), StorageError> {
        let status = serde_json::to_string(&status)
            .map_err(|e| StorageError::serialization(format!("Invalid status: {e}")))?;
        let result = sqlx::query("UPDATE branches SET status = ?2 WHERE id = ?1")
            .bind(branch_id.to_string())
            .bind(status)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::database(format!("Failed to update branch: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::branch_not_found(branch_id));
        }
        Ok(())
    }
}
