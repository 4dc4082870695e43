//! Storage seams used by the pipeline: the gallery read and the attendance sink.

use crate::types::GalleryEntry;
use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("invalid stored data: {0}")]
    Corrupt(String),
}

/// Source of the enrolled gallery. Read fresh on every recognition attempt.
#[async_trait]
pub trait GalleryStore: Send + Sync {
    async fn load_gallery(&self) -> Result<Vec<GalleryEntry>, StorageError>;
}

/// What a presence write did to the attendance row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceWrite {
    /// The row was inserted or overwritten.
    Written,
    /// A manually entered row exists and was left unchanged.
    KeptManual,
}

/// Sink for recognized presence.
#[async_trait]
pub trait AttendanceRecorder: Send + Sync {
    /// Upsert a `present` record for (`student_id`, `date`) whose remarks carry
    /// `confidence` as a percentage. A later call for the same key overwrites
    /// the earlier one, unless the store is configured to keep manual rows.
    async fn record_presence(
        &self,
        student_id: &str,
        date: NaiveDate,
        confidence: f32,
    ) -> Result<PresenceWrite, StorageError>;
}
