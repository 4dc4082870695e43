//! Enrolled students and their stored face embeddings.

use crate::db::{storage_error, Store};
use async_trait::async_trait;
use rollcall_core::{Embedding, GalleryEntry, GalleryStore, StorageError};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

/// Name used when an embedding has no roster entry.
const UNKNOWN_NAME: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Student {
    pub id: String,
    pub display_name: String,
    pub index_number: Option<String>,
}

impl Store {
    /// Insert or rename a student.
    pub async fn upsert_student(&self, student: &Student) -> Result<(), StorageError> {
        let student = student.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO students (id, display_name, index_number) VALUES (?1, ?2, ?3)
                     ON CONFLICT (id) DO UPDATE SET
                         display_name = excluded.display_name,
                         index_number = COALESCE(excluded.index_number, students.index_number)",
                    params![student.id, student.display_name, student.index_number],
                )?;
                Ok(())
            })
            .await
            .map_err(storage_error)
    }

    pub async fn student(&self, id: &str) -> Result<Option<Student>, StorageError> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let student = conn
                    .query_row(
                        "SELECT id, display_name, index_number FROM students WHERE id = ?1",
                        [&id],
                        |row| {
                            Ok(Student {
                                id: row.get(0)?,
                                display_name: row.get(1)?,
                                index_number: row.get(2)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(student)
            })
            .await
            .map_err(storage_error)
    }

    /// Store one more embedding for `student_id`. Returns the new row id.
    pub async fn add_embedding(
        &self,
        student_id: &str,
        embedding: &Embedding,
        image_url: Option<&str>,
    ) -> Result<String, StorageError> {
        if embedding.values.is_empty() {
            return Err(StorageError::Corrupt("refusing to store an empty embedding".into()));
        }
        let encoded = serde_json::to_string(embedding)
            .map_err(|e| StorageError::Corrupt(format!("encode embedding: {e}")))?;
        let id = uuid::Uuid::new_v4().to_string();
        let row_id = id.clone();
        let student_id = student_id.to_string();
        let image_url = image_url.map(str::to_string);
        let dim = embedding.dim();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO student_face_embeddings (id, student_id, embedding, image_url)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![row_id, student_id, encoded, image_url],
                )?;
                Ok(())
            })
            .await
            .map_err(storage_error)?;

        tracing::info!(id = %id, dim, "embedding enrolled");
        Ok(id)
    }

    /// All stored embeddings with display names, in enrollment order.
    ///
    /// Rows whose embedding cannot be decoded are skipped with a warning so
    /// one bad row never blocks recognizing everyone else.
    pub async fn gallery(&self) -> Result<Vec<GalleryEntry>, StorageError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT e.id, e.student_id, e.embedding, COALESCE(s.display_name, ?1)
                     FROM student_face_embeddings e
                     LEFT JOIN students s ON s.id = e.student_id
                     ORDER BY e.created_at, e.rowid",
                )?;
                let rows = stmt
                    .query_map([UNKNOWN_NAME], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(storage_error)?;

        let total = rows.len();
        let gallery: Vec<GalleryEntry> = rows
            .into_iter()
            .filter_map(|(id, student_id, raw, display_name)| {
                match serde_json::from_str::<Embedding>(&raw) {
                    Ok(embedding) => Some(GalleryEntry {
                        student_id,
                        display_name,
                        embedding,
                    }),
                    Err(e) => {
                        tracing::warn!(id = %id, student_id = %student_id, error = %e, "unreadable stored embedding; skipping");
                        None
                    }
                }
            })
            .collect();

        tracing::debug!(rows = total, usable = gallery.len(), "gallery loaded");
        Ok(gallery)
    }

    /// Number of stored embeddings.
    pub async fn gallery_size(&self) -> Result<usize, StorageError> {
        self.conn
            .call(|conn| {
                let n: i64 =
                    conn.query_row("SELECT COUNT(*) FROM student_face_embeddings", [], |row| {
                        row.get(0)
                    })?;
                Ok(n as usize)
            })
            .await
            .map_err(storage_error)
    }
}

#[async_trait]
impl GalleryStore for Store {
    async fn load_gallery(&self) -> Result<Vec<GalleryEntry>, StorageError> {
        self.gallery().await
    }
}
