use rollcall_core::{AttendanceRecord, AttendanceStatus, MarkSource, PipelineError};
use rollcall_store::Student;
use std::path::PathBuf;
use std::sync::Arc;
use zbus::{fdo, interface};

use crate::engine::{parse_date, Engine, EngineError};

pub const BUS_NAME: &str = "org.rollcall.Rollcall1";
pub const OBJECT_PATH: &str = "/org/rollcall/Rollcall1";

/// D-Bus interface for the rollcall attendance daemon.
///
/// Bus name: org.rollcall.Rollcall1
/// Object path: /org/rollcall/Rollcall1
pub struct RollcallService {
    engine: Arc<Engine>,
}

impl RollcallService {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[interface(name = "org.rollcall.Rollcall1")]
impl RollcallService {
    /// Open the camera and start a capture session.
    async fn start_camera(&self) -> fdo::Result<bool> {
        tracing::info!("start_camera requested");
        self.engine.start_camera().await.map_err(to_fdo)
    }

    /// Stop the capture session and release the camera.
    async fn stop_camera(&self) -> fdo::Result<bool> {
        tracing::info!("stop_camera requested");
        Ok(self.engine.stop_camera().await)
    }

    /// Capture one frame, recognize the student and mark them present.
    /// Returns the outcome as JSON.
    async fn capture_and_mark(&self) -> fdo::Result<String> {
        tracing::info!("capture_and_mark requested");
        let outcome = self.engine.capture_and_mark().await.map_err(to_fdo)?;
        to_json(&outcome)
    }

    /// Names marked during the current camera session, oldest first (JSON array).
    async fn recent_marks(&self) -> fdo::Result<String> {
        to_json(&self.engine.recent_marks().await)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        to_json(&self.engine.status().await)
    }

    /// Enroll a face for a student from an image file readable by the daemon.
    /// Returns the new embedding id.
    async fn enroll(
        &self,
        student_id: &str,
        display_name: &str,
        index_number: &str,
        image_path: &str,
        image_url: &str,
    ) -> fdo::Result<String> {
        tracing::info!(student_id, image_path, "enroll requested");
        let student = Student {
            id: student_id.to_string(),
            display_name: if display_name.is_empty() {
                student_id.to_string()
            } else {
                display_name.to_string()
            },
            index_number: non_empty(index_number),
        };
        self.engine
            .enroll(student, PathBuf::from(image_path), non_empty(image_url))
            .await
            .map_err(to_fdo)
    }

    /// Manually set attendance. An empty date means today (UTC).
    async fn set_attendance(
        &self,
        student_id: &str,
        date: &str,
        status: &str,
        remarks: &str,
    ) -> fdo::Result<bool> {
        tracing::info!(student_id, date, status, "set_attendance requested");
        let date = parse_date(date).map_err(to_fdo)?;
        let status: AttendanceStatus = status
            .parse()
            .map_err(|e: rollcall_core::UnknownStatus| fdo::Error::InvalidArgs(e.to_string()))?;
        let record = AttendanceRecord {
            student_id: student_id.to_string(),
            date,
            status,
            remarks: remarks.to_string(),
            source: MarkSource::Manual,
        };
        self.engine.set_attendance(record).await.map_err(to_fdo)
    }

    /// Attendance for a date (empty means today), newest first, as JSON.
    async fn attendance(&self, date: &str) -> fdo::Result<String> {
        let date = parse_date(date).map_err(to_fdo)?;
        let entries = self.engine.attendance_on(date).await.map_err(to_fdo)?;
        to_json(&entries)
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("encode reply: {e}")))
}

/// Map engine failures onto D-Bus errors, keeping the stage-specific message.
fn to_fdo(err: EngineError) -> fdo::Error {
    let msg = err.to_string();
    match err {
        EngineError::InvalidArgument(_) => fdo::Error::InvalidArgs(msg),
        EngineError::Pipeline(PipelineError::Busy) => fdo::Error::LimitsExceeded(msg),
        EngineError::Camera(_) | EngineError::Pipeline(PipelineError::Camera(_)) => {
            fdo::Error::IOError(msg)
        }
        EngineError::Image(_) => fdo::Error::FileNotFound(msg),
        _ => fdo::Error::Failed(msg),
    }
}
