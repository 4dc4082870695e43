use chrono::{DateTime, NaiveDate, Utc};
use image::RgbImage;
use rollcall_core::{
    AttendancePipeline, AttendanceRecord, CaptureError, CaptureOutcome, EmbeddingExtractor,
    ExtractionError, FrameSource, PipelineError, PipelineState, StorageError,
};
use rollcall_hw::{Camera, CameraError};
use rollcall_store::{AttendanceEntry, Store, Student};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

type SessionPipeline = AttendancePipeline<dyn FrameSource, dyn EmbeddingExtractor, Store, Store>;

/// Opens the frame source for a new camera session. Blocking.
pub type SourceOpener =
    Arc<dyn Fn() -> Result<Arc<dyn FrameSource>, CameraError> + Send + Sync>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no camera session; start the camera first")]
    NoSession,
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("embedding extraction failed: {0}")]
    Extraction(#[from] ExtractionError),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("engine task failed: {0}")]
    Task(String),
}

/// Adapts an open camera to the pipeline's frame source.
pub struct CameraSource {
    camera: Mutex<Option<Camera>>,
    attempts: usize,
}

impl CameraSource {
    pub fn new(camera: Camera, attempts: usize) -> Self {
        Self {
            camera: Mutex::new(Some(camera)),
            attempts,
        }
    }
}

impl FrameSource for CameraSource {
    fn capture(&self) -> Result<RgbImage, CaptureError> {
        let camera = lock(&self.camera);
        let camera = camera
            .as_ref()
            .ok_or_else(|| CaptureError::Unavailable("camera closed".into()))?;
        camera
            .capture_still(self.attempts)
            .map(|frame| frame.image)
            .map_err(capture_error)
    }

    fn close(&self) {
        lock(&self.camera).take();
    }
}

/// Opens the configured V4L2 device and discards warmup frames.
fn camera_opener(config: &Config) -> SourceOpener {
    let device = config.camera_device.clone();
    let (width, height) = (config.frame_width, config.frame_height);
    let warmup = config.warmup_frames;
    let attempts = config.capture_attempts;
    Arc::new(move || -> Result<Arc<dyn FrameSource>, CameraError> {
        let camera = Camera::open(&device, width, height)?;
        if let Err(e) = camera.warm_up(warmup) {
            tracing::warn!(error = %e, "warmup capture failed; continuing");
        }
        Ok(Arc::new(CameraSource::new(camera, attempts)))
    })
}

fn capture_error(err: CameraError) -> CaptureError {
    match err {
        CameraError::DeviceNotFound(_)
        | CameraError::PermissionDenied(_)
        | CameraError::DeviceBusy
        | CameraError::StreamingNotSupported
        | CameraError::FormatNegotiationFailed(_) => CaptureError::Unavailable(err.to_string()),
        CameraError::CaptureFailed(_) | CameraError::NoUsableFrame(_) => {
            CaptureError::Failed(err.to_string())
        }
    }
}

/// Names of the most recently marked students, oldest first.
#[derive(Debug)]
struct RecentMarks {
    names: VecDeque<String>,
    capacity: usize,
    total: usize,
}

impl RecentMarks {
    fn new(capacity: usize) -> Self {
        Self {
            names: VecDeque::with_capacity(capacity),
            capacity,
            total: 0,
        }
    }

    fn push(&mut self, name: String) {
        self.total += 1;
        if self.capacity == 0 {
            return;
        }
        if self.names.len() == self.capacity {
            self.names.pop_front();
        }
        self.names.push_back(name);
    }

    fn names(&self) -> Vec<String> {
        self.names.iter().cloned().collect()
    }
}

/// One open camera and the pipeline that owns it.
struct Session {
    pipeline: Arc<SessionPipeline>,
    source: Arc<dyn FrameSource>,
    cancel: CancellationToken,
    device: String,
    started_at: DateTime<Utc>,
    recent: Arc<Mutex<RecentMarks>>,
}

#[derive(Debug, Serialize)]
pub struct SessionStatus {
    pub device: String,
    pub started_at: DateTime<Utc>,
    pub state: PipelineState,
    pub last_error: Option<String>,
    pub marked: usize,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub version: &'static str,
    pub camera: Option<SessionStatus>,
    pub model_loaded: bool,
    pub gallery_size: Option<usize>,
    pub threshold: f32,
}

/// Owns the process-wide model and store, and at most one camera session.
pub struct Engine {
    config: Config,
    extractor: Arc<dyn EmbeddingExtractor>,
    store: Arc<Store>,
    open_source: SourceOpener,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl Engine {
    /// Engine whose sessions capture from the configured V4L2 camera.
    pub fn new(config: Config, extractor: Arc<dyn EmbeddingExtractor>, store: Arc<Store>) -> Self {
        let open_source = camera_opener(&config);
        Self::with_source_opener(config, extractor, store, open_source)
    }

    pub fn with_source_opener(
        config: Config,
        extractor: Arc<dyn EmbeddingExtractor>,
        store: Arc<Store>,
        open_source: SourceOpener,
    ) -> Self {
        Self {
            config,
            extractor,
            store,
            open_source,
            session: tokio::sync::Mutex::new(None),
        }
    }

    /// Open the camera and start a capture session.
    ///
    /// Returns `false` if a session is already running.
    pub async fn start_camera(&self) -> Result<bool, EngineError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            tracing::info!("camera session already running");
            return Ok(false);
        }

        let open = Arc::clone(&self.open_source);
        let source = tokio::task::spawn_blocking(move || open())
            .await
            .map_err(|e| EngineError::Task(e.to_string()))??;

        let pipeline: SessionPipeline = AttendancePipeline::new(
            Arc::clone(&source),
            Arc::clone(&self.extractor),
            Arc::clone(&self.store),
            Arc::clone(&self.store),
            self.config.similarity_threshold,
        );

        *session = Some(Session {
            pipeline: Arc::new(pipeline),
            source,
            cancel: CancellationToken::new(),
            device: self.config.camera_device.clone(),
            started_at: Utc::now(),
            recent: Arc::new(Mutex::new(RecentMarks::new(self.config.recent_marks))),
        });
        tracing::info!(device = %self.config.camera_device, "camera session started");
        Ok(true)
    }

    /// End the capture session. An in-flight attempt is cancelled unless it
    /// has already begun recording. Returns once the camera is released, or
    /// `false` if no session was running.
    pub async fn stop_camera(&self) -> bool {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.take() else {
            return false;
        };
        let device = session.device.clone();
        release(session).await;
        tracing::info!(device = %device, "camera session stopped");
        true
    }

    /// Run one capture → recognize → mark attempt on the active session.
    pub async fn capture_and_mark(&self) -> Result<CaptureOutcome, EngineError> {
        let (pipeline, cancel, recent) = {
            let guard = self.session.lock().await;
            let session = guard.as_ref().ok_or(EngineError::NoSession)?;
            (
                Arc::clone(&session.pipeline),
                session.cancel.clone(),
                Arc::clone(&session.recent),
            )
        };

        match pipeline.capture_and_mark(&cancel).await {
            Ok(outcome) => {
                // A kept manual entry is not a new mark.
                if let CaptureOutcome::Marked { display_name, .. } = &outcome {
                    lock(&recent).push(display_name.clone());
                }
                Ok(outcome)
            }
            Err(e) => {
                if e.is_fatal() {
                    self.end_session_for(&pipeline).await;
                }
                Err(e.into())
            }
        }
    }

    /// Tear down the session owning `pipeline`, if it is still the current one.
    async fn end_session_for(&self, pipeline: &Arc<SessionPipeline>) {
        let mut guard = self.session.lock().await;
        let is_current = guard
            .as_ref()
            .is_some_and(|s| Arc::ptr_eq(&s.pipeline, pipeline));
        if is_current {
            if let Some(session) = guard.take() {
                tracing::warn!(device = %session.device, "camera session ended after camera failure");
                release(session).await;
            }
        }
    }

    pub async fn recent_marks(&self) -> Vec<String> {
        match self.session.lock().await.as_ref() {
            Some(session) => lock(&session.recent).names(),
            None => Vec::new(),
        }
    }

    pub async fn status(&self) -> StatusReport {
        let camera = self.session.lock().await.as_ref().map(|s| SessionStatus {
            device: s.device.clone(),
            started_at: s.started_at,
            state: s.pipeline.state(),
            last_error: s.pipeline.last_error(),
            marked: lock(&s.recent).total,
        });

        let gallery_size = match self.store.gallery_size().await {
            Ok(n) => Some(n),
            Err(e) => {
                tracing::warn!(error = %e, "gallery size unavailable");
                None
            }
        };

        StatusReport {
            version: env!("CARGO_PKG_VERSION"),
            camera,
            model_loaded: self.extractor.is_loaded(),
            gallery_size,
            threshold: self.config.similarity_threshold,
        }
    }

    /// Register `student` and enroll one embedding extracted from the image at `image_path`.
    pub async fn enroll(
        &self,
        student: Student,
        image_path: PathBuf,
        image_url: Option<String>,
    ) -> Result<String, EngineError> {
        if student.id.trim().is_empty() {
            return Err(EngineError::InvalidArgument("student id must not be empty".into()));
        }

        let extractor = Arc::clone(&self.extractor);
        let path = image_path.clone();
        let embedding = tokio::task::spawn_blocking(move || {
            let image = image::open(&path)?.to_rgb8();
            Ok::<_, EngineError>(extractor.extract(&image)?)
        })
        .await
        .map_err(|e| EngineError::Task(e.to_string()))??;

        if embedding.is_zero() {
            return Err(EngineError::Extraction(ExtractionError::InferenceFailed(
                "model produced a zero embedding".into(),
            )));
        }

        self.store.upsert_student(&student).await?;
        let id = self
            .store
            .add_embedding(&student.id, &embedding, image_url.as_deref())
            .await?;

        tracing::info!(
            student_id = %student.id,
            image = %image_path.display(),
            embedding_id = %id,
            "student enrolled"
        );
        Ok(id)
    }

    /// Manually set a student's attendance for a day.
    pub async fn set_attendance(&self, record: AttendanceRecord) -> Result<bool, EngineError> {
        if record.student_id.trim().is_empty() {
            return Err(EngineError::InvalidArgument("student id must not be empty".into()));
        }
        let written = self.store.upsert_attendance(&record).await?;
        tracing::info!(
            student_id = %record.student_id,
            date = %record.date,
            status = %record.status,
            "attendance set manually"
        );
        Ok(written)
    }

    pub async fn attendance_on(&self, date: NaiveDate) -> Result<Vec<AttendanceEntry>, EngineError> {
        Ok(self.store.attendance_on(date).await?)
    }

    /// Release the camera on daemon shutdown.
    pub async fn shutdown(&self) {
        if self.stop_camera().await {
            tracing::info!("camera released on shutdown");
        }
    }
}

/// Cancel the session, wait out any in-flight attempt, then close the source.
async fn release(session: Session) {
    session.cancel.cancel();
    session.pipeline.wait_idle().await;
    session.source.close();
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Parse a `YYYY-MM-DD` argument; empty means today (UTC).
pub fn parse_date(value: &str) -> Result<NaiveDate, EngineError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(Utc::now().date_naive());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| EngineError::InvalidArgument(format!("date {value:?}: {e}")))
}
