use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

use livecheck_core::{Protocol, SessionId, SessionStatus};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("session {0} has not ended (status: {1})")]
    NotTerminal(SessionId, SessionStatus),
}

/// One finished challenge session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRecord {
    pub id: String,
    pub session: i64,
    pub protocol: String,
    pub outcome: String,
    pub steps_satisfied: u32,
    pub steps_total: u32,
    pub started_at: String,
    pub ended_at: String,
}

/// Summary of a session at the moment it ended.
pub struct SessionSummary {
    pub session: SessionId,
    pub protocol: Protocol,
    pub outcome: SessionStatus,
    pub steps_satisfied: usize,
    pub steps_total: usize,
    pub started_at: DateTime<Utc>,
}

/// SQLite-backed log of finished challenge sessions.
///
/// Only outcomes are recorded; observations and captured frames are never
/// written to disk.
#[derive(Clone)]
pub struct SessionLog {
    conn: Connection,
}

impl SessionLog {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS sessions (
                     id TEXT PRIMARY KEY,
                     session INTEGER NOT NULL,
                     protocol TEXT NOT NULL,
                     outcome TEXT NOT NULL,
                     steps_satisfied INTEGER NOT NULL,
                     steps_total INTEGER NOT NULL,
                     started_at TEXT NOT NULL,
                     ended_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_sessions_ended ON sessions(ended_at);",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    /// Record a finished session. Returns the generated row UUID.
    pub async fn record(&self, summary: &SessionSummary) -> Result<String, StoreError> {
        if !summary.outcome.is_terminal() {
            return Err(StoreError::NotTerminal(summary.session, summary.outcome));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let id_clone = id.clone();
        let session = summary.session.0 as i64;
        let protocol = summary.protocol.as_str().to_string();
        let outcome = summary.outcome.as_str().to_string();
        let steps_satisfied = summary.steps_satisfied as u32;
        let steps_total = summary.steps_total as u32;
        let started_at = summary.started_at.to_rfc3339();
        let ended_at = Utc::now().to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO sessions (id, session, protocol, outcome, steps_satisfied, steps_total, started_at, ended_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![id_clone, session, protocol, outcome, steps_satisfied, steps_total, started_at, ended_at],
                )?;
                Ok(())
            })
            .await?;

        Ok(id)
    }

    /// Most recent sessions first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<SessionRecord>, StoreError> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, session, protocol, outcome, steps_satisfied, steps_total, started_at, ended_at
                     FROM sessions ORDER BY ended_at DESC, rowid DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map([limit], |row| {
                        Ok(SessionRecord {
                            id: row.get(0)?,
                            session: row.get(1)?,
                            protocol: row.get(2)?,
                            outcome: row.get(3)?,
                            steps_satisfied: row.get(4)?,
                            steps_total: row.get(5)?,
                            started_at: row.get(6)?,
                            ended_at: row.get(7)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    /// Count recorded sessions with the given outcome.
    pub async fn count_by_outcome(&self, outcome: SessionStatus) -> Result<u64, StoreError> {
        let outcome = outcome.as_str().to_string();
        let count: i64 = self
            .conn
            .call(move |conn| {
                let n = conn.query_row(
                    "SELECT COUNT(*) FROM sessions WHERE outcome = ?1",
                    [outcome],
                    |row| row.get(0),
                )?;
                Ok(n)
            })
            .await?;
        Ok(count as u64)
    }

    /// Count all recorded sessions.
    pub async fn count_all(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .conn
            .call(|conn| {
                let n = conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
                Ok(n)
            })
            .await?;
        Ok(count as u64)
    }
}
