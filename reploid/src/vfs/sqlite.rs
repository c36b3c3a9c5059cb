//! SQLite-backed VFS backend. Persistent across process restarts.
//!
//! One table, path-keyed; `put` runs inside a transaction so a write is
//! old-or-new to any reader, never torn.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use super::path::has_prefix;
use super::{Artifact, ArtifactType, VfsBackend, VfsError};

fn storage(e: rusqlite::Error) -> VfsError {
    VfsError::Storage(e.to_string())
}

fn type_to_str(t: ArtifactType) -> &'static str {
    match t {
        ArtifactType::Code => "code",
        ArtifactType::Document => "document",
        ArtifactType::Config => "config",
    }
}

fn type_from_str(s: &str) -> ArtifactType {
    match s {
        "code" => ArtifactType::Code,
        "config" => ArtifactType::Config,
        _ => ArtifactType::Document,
    }
}

/// Durable artifact store over a single SQLite file.
pub struct SqliteVfs {
    conn: Mutex<Connection>,
}

impl SqliteVfs {
    /// Opens (or creates) the database and ensures the schema.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, VfsError> {
        let conn = Connection::open(path.as_ref()).map_err(storage)?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS artifacts (
                path TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                artifact_type TEXT NOT NULL,
                size INTEGER NOT NULL,
                updated INTEGER NOT NULL
            )
            "#,
            [],
        )
        .map_err(storage)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory SQLite database; used by tests that want the SQL path
    /// without a file on disk.
    pub fn open_in_memory() -> Result<Self, VfsError> {
        let conn = Connection::open_in_memory().map_err(storage)?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS artifacts (
                path TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                artifact_type TEXT NOT NULL,
                size INTEGER NOT NULL,
                updated INTEGER NOT NULL
            )
            "#,
            [],
        )
        .map_err(storage)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl VfsBackend for SqliteVfs {
    fn get(&self, path: &str) -> Result<Option<Artifact>, VfsError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT path, content, artifact_type, size, updated FROM artifacts WHERE path = ?1",
            params![path],
            |row| {
                Ok(Artifact {
                    path: row.get(0)?,
                    content: row.get(1)?,
                    artifact_type: type_from_str(&row.get::<_, String>(2)?),
                    size: row.get::<_, i64>(3)? as usize,
                    updated: row.get::<_, i64>(4)? as u64,
                })
            },
        )
        .optional()
        .map_err(storage)
    }

    fn put(&self, artifact: Artifact) -> Result<(), VfsError> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction().map_err(storage)?;
        tx.execute(
            r#"
            INSERT INTO artifacts (path, content, artifact_type, size, updated)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(path) DO UPDATE SET
                content = excluded.content,
                artifact_type = excluded.artifact_type,
                size = excluded.size,
                updated = excluded.updated
            "#,
            params![
                artifact.path,
                artifact.content,
                type_to_str(artifact.artifact_type),
                artifact.size as i64,
                artifact.updated as i64
            ],
        )
        .map_err(storage)?;
        tx.commit().map_err(storage)
    }

    fn remove(&self, path: &str) -> Result<bool, VfsError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn
            .execute("DELETE FROM artifacts WHERE path = ?1", params![path])
            .map_err(storage)?;
        Ok(n > 0)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, VfsError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare("SELECT path FROM artifacts ORDER BY path")
            .map_err(storage)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(storage)?;
        let mut out = Vec::new();
        for row in rows {
            let path = row.map_err(storage)?;
            if has_prefix(&path, prefix) {
                out.push(path);
            }
        }
        Ok(out)
    }

    fn clear(&self) -> Result<(), VfsError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("DELETE FROM artifacts", []).map_err(storage)?;
        Ok(())
    }
}
