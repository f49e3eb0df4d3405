use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};
use tracing::{debug, info};

use machinist_core::error::{MachinistError, Result};
use machinist_core::types::RetrievedChunk;

use crate::ingest::{load_documents, split_text};

/// FTS5-backed index over machine-manual chunks.
///
/// Rebuilding is an out-of-band operation triggered by the caller; lookups
/// never mutate the index.
pub struct ManualIndex {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT NOT NULL,
    ord INTEGER NOT NULL,
    content TEXT NOT NULL
);

CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
    content,
    source UNINDEXED,
    content='chunks',
    content_rowid='id',
    tokenize='porter unicode61'
);

CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
    INSERT INTO chunks_fts(rowid, content, source)
    VALUES (new.id, new.content, new.source);
END;

CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
    INSERT INTO chunks_fts(chunks_fts, rowid, content, source)
    VALUES ('delete', old.id, old.content, old.source);
END;";

impl ManualIndex {
    /// Open or create the index database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                MachinistError::Database(format!("Failed to create index directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| MachinistError::Database(e.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| MachinistError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| MachinistError::Database(e.to_string()))?;

        debug!(path = %path.display(), "Manual index opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory index (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| MachinistError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| MachinistError::Database(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Rebuild the index from the manuals directory. Returns the number of
    /// chunks indexed.
    pub fn rebuild(&self, manuals_dir: &Path, chunk_size: usize, overlap: usize) -> Result<usize> {
        let documents = load_documents(manuals_dir)?;

        let mut conn = self
            .conn
            .lock()
            .map_err(|e| MachinistError::Database(e.to_string()))?;

        let tx = conn
            .transaction()
            .map_err(|e| MachinistError::Database(e.to_string()))?;

        tx.execute("DELETE FROM chunks", [])
            .map_err(|e| MachinistError::Database(e.to_string()))?;

        let mut total = 0usize;
        for doc in &documents {
            for (ord, chunk) in split_text(&doc.text, chunk_size, overlap).iter().enumerate() {
                tx.execute(
                    "INSERT INTO chunks (source, ord, content) VALUES (?1, ?2, ?3)",
                    params![doc.source, ord as i64, chunk],
                )
                .map_err(|e| MachinistError::Database(e.to_string()))?;
                total += 1;
            }
        }

        tx.commit()
            .map_err(|e| MachinistError::Database(e.to_string()))?;

        info!(
            documents = documents.len(),
            chunks = total,
            "Manual index rebuilt"
        );
        Ok(total)
    }

    /// Insert a single chunk directly (used by tests and incremental setups).
    pub fn insert_chunk(&self, source: &str, ord: usize, content: &str) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| MachinistError::Database(e.to_string()))?;
        conn.execute(
            "INSERT INTO chunks (source, ord, content) VALUES (?1, ?2, ?3)",
            params![source, ord as i64, content],
        )
        .map_err(|e| MachinistError::Database(e.to_string()))?;
        Ok(())
    }

    /// Search the index, returning up to `k` chunks ordered by relevance.
    pub fn search(&self, query: &str, k: usize) -> Result<Vec<RetrievedChunk>> {
        let match_query = sanitize_query(query);
        if match_query.is_empty() {
            return Ok(vec![]);
        }

        let conn = self
            .conn
            .lock()
            .map_err(|e| MachinistError::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT content, source, rank
                 FROM chunks_fts
                 WHERE chunks_fts MATCH ?1
                 ORDER BY rank
                 LIMIT ?2",
            )
            .map_err(|e| MachinistError::Database(e.to_string()))?;

        let rows = stmt
            .query_map(params![match_query, k as i64], |row| {
                let content: String = row.get(0)?;
                let source: String = row.get(1)?;
                let rank: f64 = row.get(2)?;
                Ok((content, source, rank))
            })
            .map_err(|e| MachinistError::Database(e.to_string()))?;

        let mut results = Vec::new();
        for row in rows {
            let (content, source, rank) =
                row.map_err(|e| MachinistError::Database(e.to_string()))?;
            // bm25 rank is negative; flip it so higher means more relevant.
            results.push(RetrievedChunk {
                content,
                source,
                score: -rank,
            });
        }

        Ok(results)
    }

    /// Number of chunks currently indexed.
    pub fn len(&self) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| MachinistError::Database(e.to_string()))?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))
            .map_err(|e| MachinistError::Database(e.to_string()))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Turn free text into a safe FTS5 match expression: terms are quoted and
/// OR-joined so punctuation in the user's query cannot break the parser.
fn sanitize_query(query: &str) -> String {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect::<Vec<_>>()
        .join(" OR ")
}
