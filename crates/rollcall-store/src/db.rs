use rollcall_core::StorageError;
use std::path::Path;
use std::time::Duration;
use tokio_rusqlite::Connection;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS students (
    id           TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    index_number TEXT,
    created_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE IF NOT EXISTS student_face_embeddings (
    id         TEXT PRIMARY KEY,
    student_id TEXT NOT NULL,
    embedding  TEXT NOT NULL,
    image_url  TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_face_embeddings_student
    ON student_face_embeddings (student_id);

CREATE TABLE IF NOT EXISTS attendance (
    id         TEXT PRIMARY KEY,
    student_id TEXT NOT NULL,
    date       TEXT NOT NULL,
    status     TEXT NOT NULL CHECK (status IN ('present', 'absent', 'late', 'excused')),
    remarks    TEXT,
    marked_by  TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT,
    UNIQUE (student_id, date)
);
"#;

/// Handle to the SQLite database. Cheap to clone; all clones share one
/// background connection thread.
#[derive(Clone)]
pub struct Store {
    pub(crate) conn: Connection,
    /// Whether a recognition upsert may replace a manually entered row.
    pub(crate) overwrite_manual: bool,
}

impl Store {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Unavailable(format!("create {}: {e}", parent.display()))
            })?;
        }

        let conn = Connection::open(&path).await.map_err(storage_error)?;
        let store = Self::from_connection(conn).await?;
        tracing::info!(path = %path.display(), "opened attendance database");
        Ok(store)
    }

    /// In-memory database, used by tests.
    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().await.map_err(storage_error)?;
        Self::from_connection(conn).await
    }

    async fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.call(|conn| {
            conn.busy_timeout(Duration::from_secs(5))?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(storage_error)?;

        Ok(Self {
            conn,
            overwrite_manual: true,
        })
    }

    /// Choose whether face recognition may overwrite manual entries
    /// (default: it may).
    pub fn with_overwrite_manual(mut self, overwrite: bool) -> Self {
        self.overwrite_manual = overwrite;
        self
    }
}

pub(crate) fn storage_error(err: tokio_rusqlite::Error) -> StorageError {
    match err {
        tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(code, msg))
            if code.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StorageError::Constraint(msg.unwrap_or_else(|| code.to_string()))
        }
        other => StorageError::Unavailable(other.to_string()),
    }
}
