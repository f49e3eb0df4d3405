use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use machinist_core::error::{MachinistError, Result};
use machinist_core::traits::SessionStore;
use machinist_core::types::{ChatMessage, Role, SessionId};

/// SQLite-backed session store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_session
    ON messages(session_id, id);";

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                MachinistError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| MachinistError::Database(e.to_string()))?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| MachinistError::Database(e.to_string()))?;

        conn.execute_batch(SCHEMA)
            .map_err(|e| MachinistError::Database(e.to_string()))?;

        debug!(path = %path.display(), "SQLite session store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| MachinistError::Database(e.to_string()))?;

        conn.execute_batch(SCHEMA)
            .map_err(|e| MachinistError::Database(e.to_string()))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn parse_role(role: &str) -> Role {
    match role {
        "system" => Role::System,
        "assistant" => Role::Assistant,
        _ => Role::User,
    }
}

impl SessionStore for SqliteStore {
    fn history(
        &self,
        sid: &SessionId,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<ChatMessage>>> {
        let sid = sid.0.clone();

        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| MachinistError::Database(e.to_string()))?;

            // Newest `limit` rows, re-ordered oldest first.
            let mut stmt = conn
                .prepare(
                    "SELECT role, content, timestamp FROM (
                         SELECT id, role, content, timestamp FROM messages
                         WHERE session_id = ?1
                         ORDER BY id DESC
                         LIMIT ?2
                     ) ORDER BY id ASC",
                )
                .map_err(|e| MachinistError::Database(e.to_string()))?;

            let rows = stmt
                .query_map(params![sid, limit as i64], |row| {
                    let role: String = row.get(0)?;
                    let content: String = row.get(1)?;
                    let ts_str: String = row.get(2)?;
                    Ok((role, content, ts_str))
                })
                .map_err(|e| MachinistError::Database(e.to_string()))?;

            let mut messages = Vec::new();
            for row in rows {
                let (role, content, ts_str) =
                    row.map_err(|e| MachinistError::Database(e.to_string()))?;

                let timestamp = DateTime::parse_from_rfc3339(&ts_str)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc));

                messages.push(ChatMessage {
                    role: parse_role(&role),
                    content,
                    timestamp,
                });
            }

            Ok(messages)
        })
    }

    fn append(&self, sid: &SessionId, msgs: &[ChatMessage]) -> BoxFuture<'_, Result<()>> {
        let sid = sid.0.clone();
        let msgs: Vec<_> = msgs
            .iter()
            .map(|m| {
                let timestamp = m.timestamp.unwrap_or_else(Utc::now).to_rfc3339();
                (m.role.as_str().to_string(), m.content.clone(), timestamp)
            })
            .collect();

        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| MachinistError::Database(e.to_string()))?;

            for (role, content, timestamp) in &msgs {
                conn.execute(
                    "INSERT INTO messages (session_id, role, content, timestamp) VALUES (?1, ?2, ?3, ?4)",
                    params![sid, role, content, timestamp],
                )
                .map_err(|e| MachinistError::Database(e.to_string()))?;
            }

            Ok(())
        })
    }

    fn clear(&self, sid: &SessionId) -> BoxFuture<'_, Result<()>> {
        let sid = sid.0.clone();

        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| MachinistError::Database(e.to_string()))?;

            let deleted = conn
                .execute("DELETE FROM messages WHERE session_id = ?1", params![sid])
                .map_err(|e| MachinistError::Database(e.to_string()))?;

            debug!(session_id = %sid, deleted, "Session history cleared");
            Ok(())
        })
    }
}
