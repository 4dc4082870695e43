//! Attendance log: one row per (student, date), written by upsert.

use crate::db::{storage_error, Store};
use async_trait::async_trait;
use chrono::NaiveDate;
use rollcall_core::{
    AttendanceRecord, AttendanceRecorder, AttendanceStatus, MarkSource, PresenceWrite,
    StorageError,
};
use rusqlite::params;
use serde::Serialize;

const DATE_FORMAT: &str = "%Y-%m-%d";

const UPSERT: &str = "INSERT INTO attendance (id, student_id, date, status, remarks, marked_by)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
     ON CONFLICT (student_id, date) DO UPDATE SET
         status = excluded.status,
         remarks = excluded.remarks,
         marked_by = excluded.marked_by,
         updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";

/// Same upsert, but an existing manual row is left alone.
const UPSERT_KEEP_MANUAL: &str = "INSERT INTO attendance (id, student_id, date, status, remarks, marked_by)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
     ON CONFLICT (student_id, date) DO UPDATE SET
         status = excluded.status,
         remarks = excluded.remarks,
         marked_by = excluded.marked_by,
         updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
     WHERE attendance.marked_by <> 'manual'";

/// An attendance row joined with the student's display name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceEntry {
    #[serde(flatten)]
    pub record: AttendanceRecord,
    pub display_name: String,
    pub created_at: String,
}

impl Store {
    /// Insert or overwrite the record for (`student_id`, `date`).
    ///
    /// Returns `false` when an existing manual entry was kept because this
    /// store does not let recognition overwrite manual rows.
    pub async fn upsert_attendance(&self, record: &AttendanceRecord) -> Result<bool, StorageError> {
        let sql = if record.source == MarkSource::Recognition && !self.overwrite_manual {
            UPSERT_KEEP_MANUAL
        } else {
            UPSERT
        };
        let id = uuid::Uuid::new_v4().to_string();
        let student_id = record.student_id.clone();
        let date = record.date.format(DATE_FORMAT).to_string();
        let status = record.status.as_str();
        let remarks = record.remarks.clone();
        let marked_by = record.source.as_str();

        let changed = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    sql,
                    params![id, student_id, date, status, remarks, marked_by],
                )?;
                Ok(changed)
            })
            .await
            .map_err(storage_error)?;

        if changed == 0 {
            tracing::info!(
                student_id = %record.student_id,
                date = %record.date,
                "manual attendance entry kept; recognition result not applied"
            );
        }
        Ok(changed > 0)
    }

    /// The record for (`student_id`, `date`), if any.
    pub async fn attendance_record(
        &self,
        student_id: &str,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StorageError> {
        let student_id = student_id.to_string();
        let date_str = date.format(DATE_FORMAT).to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT student_id, date, status, COALESCE(remarks, ''), marked_by
                     FROM attendance WHERE student_id = ?1 AND date = ?2",
                )?;
                let rows = stmt
                    .query_map([&student_id, &date_str], raw_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(storage_error)?;

        rows.into_iter().next().map(parse_row).transpose()
    }

    /// All records for `date` with display names, newest first.
    pub async fn attendance_on(&self, date: NaiveDate) -> Result<Vec<AttendanceEntry>, StorageError> {
        let date_str = date.format(DATE_FORMAT).to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT a.student_id, a.date, a.status, COALESCE(a.remarks, ''), a.marked_by,
                            COALESCE(s.display_name, 'Unknown'), a.created_at
                     FROM attendance a
                     LEFT JOIN students s ON s.id = a.student_id
                     WHERE a.date = ?1
                     ORDER BY a.created_at DESC, a.rowid DESC",
                )?;
                let rows = stmt
                    .query_map([&date_str], |row| {
                        Ok((raw_row(row)?, row.get::<_, String>(5)?, row.get::<_, String>(6)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(storage_error)?;

        rows.into_iter()
            .map(|(raw, display_name, created_at)| {
                Ok(AttendanceEntry {
                    record: parse_row(raw)?,
                    display_name,
                    created_at,
                })
            })
            .collect()
    }
}

type RawRow = (String, String, String, String, String);

fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn parse_row((student_id, date, status, remarks, marked_by): RawRow) -> Result<AttendanceRecord, StorageError> {
    let date = NaiveDate::parse_from_str(&date, DATE_FORMAT)
        .map_err(|e| StorageError::Corrupt(format!("attendance date {date:?}: {e}")))?;
    let status = status
        .parse::<AttendanceStatus>()
        .map_err(|e| StorageError::Corrupt(e.to_string()))?;
    Ok(AttendanceRecord {
        student_id,
        date,
        status,
        remarks,
        source: MarkSource::from_column(&marked_by),
    })
}

#[async_trait]
impl AttendanceRecorder for Store {
    async fn record_presence(
        &self,
        student_id: &str,
        date: NaiveDate,
        confidence: f32,
    ) -> Result<PresenceWrite, StorageError> {
        let record = AttendanceRecord::presence(student_id, date, confidence);
        if self.upsert_attendance(&record).await? {
            Ok(PresenceWrite::Written)
        } else {
            Ok(PresenceWrite::KeptManual)
        }
    }
}
