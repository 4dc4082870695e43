//! Capture → extract → match → record, one attempt at a time.
//!
//! Each attempt walks `Idle → Capturing → Extracting → Matching → Recording`
//! and back to `Idle`. Any stage failure moves the attempt to `Failed`, skips
//! the remaining stages and returns the pipeline to `Idle`. A second attempt
//! started while one is in flight is rejected with [`PipelineError::Busy`].
//!
//! Cancellation is honoured up to the moment the recorder starts. Once the
//! attendance write has begun it always runs to completion. A blocking stage
//! (capture or extraction) cannot be interrupted: a cancelled attempt keeps
//! the pipeline busy until that stage has returned.

use crate::extractor::{EmbeddingExtractor, ExtractionError};
use crate::matcher::{CosineMatcher, MatchResult, Matcher};
use crate::store::{AttendanceRecorder, GalleryStore, PresenceWrite, StorageError};
use chrono::{NaiveDate, Utc};
use image::RgbImage;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone)]
pub enum CaptureError {
    #[error("camera unavailable: {0}")]
    Unavailable(String),
    #[error("capture failed: {0}")]
    Failed(String),
}

/// Produces one still RGB frame on demand. Blocking.
pub trait FrameSource: Send + Sync {
    fn capture(&self) -> Result<RgbImage, CaptureError>;

    /// Release the underlying device. Later captures fail with
    /// [`CaptureError::Unavailable`].
    fn close(&self) {}
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("a capture is already being processed")]
    Busy,
    #[error("capture cancelled")]
    Cancelled,
    #[error("camera error: {0}")]
    Camera(#[source] CaptureError),
    #[error("embedding extraction failed: {0}")]
    Extraction(#[source] ExtractionError),
    #[error("gallery read failed: {0}")]
    Match(#[source] StorageError),
    #[error("attendance write failed: {0}")]
    Record(#[source] StorageError),
    #[error("pipeline task failed: {0}")]
    Task(String),
}

impl PipelineError {
    /// An unavailable or denied camera ends the capture session; everything
    /// else is retryable with a new capture.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::Camera(CaptureError::Unavailable(_)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Idle,
    Capturing,
    Extracting,
    Matching,
    Recording,
    Failed,
}

/// What a successful attempt did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CaptureOutcome {
    Marked {
        student_id: String,
        display_name: String,
        similarity: f32,
        date: NaiveDate,
    },
    /// Matched, but a manually entered row for the day was left unchanged.
    KeptManual {
        student_id: String,
        display_name: String,
        similarity: f32,
        date: NaiveDate,
    },
    NoMatch,
}

type Clock = Box<dyn Fn() -> NaiveDate + Send + Sync>;

/// One recognition pipeline, owned by one capture session.
pub struct AttendancePipeline<C: ?Sized, E: ?Sized, G, R> {
    source: Arc<C>,
    extractor: Arc<E>,
    gallery: Arc<G>,
    recorder: Arc<R>,
    matcher: CosineMatcher,
    threshold: f32,
    today: Clock,
    /// Held for the whole of an attempt.
    running: tokio::sync::Mutex<()>,
    state: Mutex<PipelineState>,
    last_error: Mutex<Option<String>>,
}

impl<C, E, G, R> AttendancePipeline<C, E, G, R>
where
    C: FrameSource + ?Sized + 'static,
    E: EmbeddingExtractor + ?Sized + 'static,
    G: GalleryStore,
    R: AttendanceRecorder,
{
    pub fn new(
        source: Arc<C>,
        extractor: Arc<E>,
        gallery: Arc<G>,
        recorder: Arc<R>,
        threshold: f32,
    ) -> Self {
        Self {
            source,
            extractor,
            gallery,
            recorder,
            matcher: CosineMatcher,
            threshold,
            today: Box::new(|| Utc::now().date_naive()),
            running: tokio::sync::Mutex::new(()),
            state: Mutex::new(PipelineState::Idle),
            last_error: Mutex::new(None),
        }
    }

    /// Replace the date source (UTC today by default).
    pub fn with_clock<F>(mut self, today: F) -> Self
    where
        F: Fn() -> NaiveDate + Send + Sync + 'static,
    {
        self.today = Box::new(today);
        self
    }

    pub fn state(&self) -> PipelineState {
        *lock(&self.state)
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Message of the most recent failed attempt, if any.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    /// Wait until no attempt is in flight, including the blocking tail of a
    /// cancelled one.
    pub async fn wait_idle(&self) {
        let _running = self.running.lock().await;
    }

    /// Run one full attempt.
    pub async fn capture_and_mark(
        &self,
        cancel: &CancellationToken,
    ) -> Result<CaptureOutcome, PipelineError> {
        let attempt = self.begin()?;
        let result = self.run_stages(&attempt, cancel).await;

        match &result {
            Ok(_) => *lock(&self.last_error) = None,
            Err(e) => {
                attempt.enter(PipelineState::Failed);
                tracing::warn!(error = %e, fatal = e.is_fatal(), "capture attempt failed");
                *lock(&self.last_error) = Some(e.to_string());
            }
        }
        result
    }

    fn begin(&self) -> Result<Attempt<'_>, PipelineError> {
        let running = self.running.try_lock().map_err(|_| {
            tracing::debug!(state = ?self.state(), "capture rejected: attempt in flight");
            PipelineError::Busy
        })?;
        *lock(&self.state) = PipelineState::Capturing;
        Ok(Attempt {
            state: &self.state,
            _running: running,
        })
    }

    async fn run_stages(
        &self,
        attempt: &Attempt<'_>,
        cancel: &CancellationToken,
    ) -> Result<CaptureOutcome, PipelineError> {
        let source = Arc::clone(&self.source);
        let frame = blocking_stage(cancel, move || source.capture())
            .await?
            .map_err(PipelineError::Camera)?;
        tracing::debug!(width = frame.width(), height = frame.height(), "frame captured");

        attempt.enter(PipelineState::Extracting);
        let extractor = Arc::clone(&self.extractor);
        let query = blocking_stage(cancel, move || extractor.extract(&frame))
            .await?
            .map_err(PipelineError::Extraction)?;

        attempt.enter(PipelineState::Matching);
        let gallery = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            loaded = self.gallery.load_gallery() => loaded.map_err(PipelineError::Match)?,
        };
        let result = self.matcher.compare(&query, &gallery, self.threshold);

        let MatchResult::Matched {
            student_id,
            display_name,
            similarity,
        } = result
        else {
            tracing::info!(gallery = gallery.len(), threshold = self.threshold, "no matching student");
            return Ok(CaptureOutcome::NoMatch);
        };

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        // Not cancellable past this point.
        attempt.enter(PipelineState::Recording);
        let date = (self.today)();
        let write = self
            .recorder
            .record_presence(&student_id, date, similarity)
            .await
            .map_err(PipelineError::Record)?;

        match write {
            PresenceWrite::Written => {
                tracing::info!(
                    student_id = %student_id,
                    name = %display_name,
                    similarity,
                    %date,
                    "attendance marked"
                );
                Ok(CaptureOutcome::Marked {
                    student_id,
                    display_name,
                    similarity,
                    date,
                })
            }
            PresenceWrite::KeptManual => {
                tracing::info!(
                    student_id = %student_id,
                    name = %display_name,
                    similarity,
                    %date,
                    "recognized, manual attendance entry kept"
                );
                Ok(CaptureOutcome::KeptManual {
                    student_id,
                    display_name,
                    similarity,
                    date,
                })
            }
        }
    }
}

/// An in-flight attempt. Dropping it returns the pipeline to `Idle` and lets
/// the next attempt in.
struct Attempt<'a> {
    state: &'a Mutex<PipelineState>,
    _running: tokio::sync::MutexGuard<'a, ()>,
}

impl Attempt<'_> {
    fn enter(&self, next: PipelineState) {
        let mut state = lock(self.state);
        tracing::debug!(from = ?*state, to = ?next, "pipeline transition");
        *state = next;
    }
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        *lock(self.state) = PipelineState::Idle;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run `f` on the blocking pool. On cancellation the result is discarded,
/// but only after `f` has returned, so the attempt never outlives its stage.
async fn blocking_stage<T, F>(cancel: &CancellationToken, f: F) -> Result<T, PipelineError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }
    let mut task = tokio::task::spawn_blocking(f);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {}
        joined = &mut task => return joined.map_err(|e| PipelineError::Task(e.to_string())),
    }
    tracing::debug!("cancelled; waiting for the blocking stage to return");
    let _ = task.await;
    Err(PipelineError::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Embedding, GalleryEntry};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 16).unwrap()
    }

    struct StillSource;

    impl FrameSource for StillSource {
        fn capture(&self) -> Result<RgbImage, CaptureError> {
            Ok(RgbImage::from_pixel(4, 4, image::Rgb([90, 90, 90])))
        }
    }

    struct BrokenSource;

    impl FrameSource for BrokenSource {
        fn capture(&self) -> Result<RgbImage, CaptureError> {
            Err(CaptureError::Unavailable("permission denied".into()))
        }
    }

    /// Blocks each capture until the test sends a release, and records how
    /// many captures ever ran at once.
    struct GatedSource {
        gate: Mutex<mpsc::Receiver<()>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl GatedSource {
        fn new(gate: mpsc::Receiver<()>) -> Self {
            Self {
                gate: Mutex::new(gate),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            }
        }
    }

    impl FrameSource for GatedSource {
        fn capture(&self) -> Result<RgbImage, CaptureError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            let released = self.gate.lock().map(|gate| gate.recv()).ok();
            self.active.fetch_sub(1, Ordering::SeqCst);
            match released {
                Some(Ok(())) => Ok(RgbImage::new(1, 1)),
                _ => Err(CaptureError::Failed("gate closed".into())),
            }
        }
    }

    struct FixedExtractor {
        values: Vec<f32>,
        fail: AtomicBool,
    }

    impl FixedExtractor {
        fn new(values: &[f32]) -> Self {
            Self {
                values: values.to_vec(),
                fail: AtomicBool::new(false),
            }
        }
    }

    impl EmbeddingExtractor for FixedExtractor {
        fn extract(&self, _image: &RgbImage) -> Result<Embedding, ExtractionError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ExtractionError::InferenceFailed("synthetic failure".into()));
            }
            Ok(Embedding::new(self.values.clone()))
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        gallery: Vec<GalleryEntry>,
        rows: Mutex<HashMap<(String, NaiveDate), f32>>,
        manual: Vec<String>,
        gallery_reads: AtomicUsize,
        fail_reads: AtomicBool,
        fail_writes: AtomicBool,
    }

    impl MemoryStore {
        fn with_gallery(entries: &[(&str, &[f32])]) -> Self {
            Self {
                gallery: entries
                    .iter()
                    .map(|(id, v)| GalleryEntry {
                        student_id: id.to_string(),
                        display_name: format!("Student {id}"),
                        embedding: Embedding::new(v.to_vec()),
                    })
                    .collect(),
                ..Default::default()
            }
        }

        fn row_count(&self) -> usize {
            lock(&self.rows).len()
        }
    }

    #[async_trait]
    impl GalleryStore for MemoryStore {
        async fn load_gallery(&self) -> Result<Vec<GalleryEntry>, StorageError> {
            self.gallery_reads.fetch_add(1, Ordering::SeqCst);
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(StorageError::Unavailable("connection refused".into()));
            }
            Ok(self.gallery.clone())
        }
    }

    #[async_trait]
    impl AttendanceRecorder for MemoryStore {
        async fn record_presence(
            &self,
            student_id: &str,
            date: NaiveDate,
            confidence: f32,
        ) -> Result<PresenceWrite, StorageError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StorageError::Unavailable("write timeout".into()));
            }
            if self.manual.iter().any(|id| id == student_id) {
                return Ok(PresenceWrite::KeptManual);
            }
            lock(&self.rows).insert((student_id.to_string(), date), confidence);
            Ok(PresenceWrite::Written)
        }
    }

    type TestPipeline<C> = AttendancePipeline<C, FixedExtractor, MemoryStore, MemoryStore>;

    fn pipeline<C: FrameSource + 'static>(
        source: C,
        query: &[f32],
        store: Arc<MemoryStore>,
    ) -> TestPipeline<C> {
        AttendancePipeline::new(
            Arc::new(source),
            Arc::new(FixedExtractor::new(query)),
            Arc::clone(&store),
            store,
            0.7,
        )
        .with_clock(day)
    }

    async fn wait_for_state<C: FrameSource + 'static>(p: &TestPipeline<C>, want: PipelineState) {
        for _ in 0..500 {
            if p.state() == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("pipeline never reached {want:?}, stuck at {:?}", p.state());
    }

    #[tokio::test]
    async fn test_match_records_presence() {
        let store = Arc::new(MemoryStore::with_gallery(&[
            ("A", &[1.0, 0.0, 0.0]),
            ("B", &[0.0, 1.0, 0.0]),
        ]));
        let p = pipeline(StillSource, &[1.0, 0.0, 0.0], Arc::clone(&store));

        let outcome = p.capture_and_mark(&CancellationToken::new()).await.unwrap();
        match outcome {
            CaptureOutcome::Marked { student_id, display_name, similarity, date } => {
                assert_eq!(student_id, "A");
                assert_eq!(display_name, "Student A");
                assert!((similarity - 1.0).abs() < 1e-6);
                assert_eq!(date, day());
            }
            other => panic!("expected a mark, got {other:?}"),
        }
        assert_eq!(store.row_count(), 1);
        assert_eq!(p.state(), PipelineState::Idle);
        assert!(p.last_error().is_none());
    }

    #[tokio::test]
    async fn test_no_match_records_nothing() {
        let store = Arc::new(MemoryStore::with_gallery(&[("A", &[0.0, 1.0, 0.0])]));
        let p = pipeline(StillSource, &[1.0, 0.0, 0.0], Arc::clone(&store));

        let outcome = p.capture_and_mark(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, CaptureOutcome::NoMatch);
        assert_eq!(store.row_count(), 0);
        assert_eq!(p.state(), PipelineState::Idle);
    }

    #[tokio::test]
    async fn test_kept_manual_entry_is_not_reported_as_marked() {
        let store = Arc::new(MemoryStore {
            manual: vec!["A".to_string()],
            ..MemoryStore::with_gallery(&[("A", &[1.0, 0.0])])
        });
        let p = pipeline(StillSource, &[1.0, 0.0], Arc::clone(&store));

        let outcome = p.capture_and_mark(&CancellationToken::new()).await.unwrap();
        assert!(matches!(
            outcome,
            CaptureOutcome::KeptManual { ref student_id, .. } if student_id == "A"
        ));
        assert_eq!(store.row_count(), 0);
        assert_eq!(p.state(), PipelineState::Idle);
    }

    #[tokio::test]
    async fn test_gallery_read_every_attempt() {
        let store = Arc::new(MemoryStore::with_gallery(&[("A", &[1.0, 0.0])]));
        let p = pipeline(StillSource, &[1.0, 0.0], Arc::clone(&store));
        let cancel = CancellationToken::new();

        p.capture_and_mark(&cancel).await.unwrap();
        p.capture_and_mark(&cancel).await.unwrap();
        assert_eq!(store.gallery_reads.load(Ordering::SeqCst), 2);
        // Same student, same day: still one row.
        assert_eq!(store.row_count(), 1);
    }

    #[tokio::test]
    async fn test_camera_error_is_fatal() {
        let store = Arc::new(MemoryStore::with_gallery(&[("A", &[1.0, 0.0])]));
        let p = pipeline(BrokenSource, &[1.0, 0.0], Arc::clone(&store));

        let err = p.capture_and_mark(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Camera(_)));
        assert!(err.is_fatal());
        assert_eq!(store.gallery_reads.load(Ordering::SeqCst), 0);
        assert_eq!(p.state(), PipelineState::Idle);
        assert!(p.last_error().unwrap().contains("permission denied"));
    }

    #[test]
    fn test_only_unavailable_camera_is_fatal() {
        assert!(PipelineError::Camera(CaptureError::Unavailable("gone".into())).is_fatal());
        assert!(!PipelineError::Camera(CaptureError::Failed("dark".into())).is_fatal());
        assert!(!PipelineError::Busy.is_fatal());
        assert!(!PipelineError::Record(StorageError::Unavailable("down".into())).is_fatal());
    }

    #[tokio::test]
    async fn test_extraction_error_is_retryable() {
        let store = Arc::new(MemoryStore::with_gallery(&[("A", &[1.0, 0.0])]));
        let extractor = Arc::new(FixedExtractor::new(&[1.0, 0.0]));
        extractor.fail.store(true, Ordering::SeqCst);
        let p = AttendancePipeline::new(
            Arc::new(StillSource),
            Arc::clone(&extractor),
            Arc::clone(&store),
            Arc::clone(&store),
            0.7,
        )
        .with_clock(day);

        let err = p.capture_and_mark(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Extraction(_)));
        assert!(!err.is_fatal());
        assert_eq!(store.gallery_reads.load(Ordering::SeqCst), 0);
        assert_eq!(store.row_count(), 0);

        extractor.fail.store(false, Ordering::SeqCst);
        let outcome = p.capture_and_mark(&CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, CaptureOutcome::Marked { .. }));
    }

    #[tokio::test]
    async fn test_gallery_failure_is_match_error() {
        let store = Arc::new(MemoryStore::with_gallery(&[("A", &[1.0, 0.0])]));
        store.fail_reads.store(true, Ordering::SeqCst);
        let p = pipeline(StillSource, &[1.0, 0.0], Arc::clone(&store));

        let err = p.capture_and_mark(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Match(_)));
        assert_eq!(store.row_count(), 0);
        assert_eq!(p.state(), PipelineState::Idle);
    }

    #[tokio::test]
    async fn test_record_failure_surfaces_and_retry_succeeds() {
        let store = Arc::new(MemoryStore::with_gallery(&[("A", &[1.0, 0.0])]));
        store.fail_writes.store(true, Ordering::SeqCst);
        let p = pipeline(StillSource, &[1.0, 0.0], Arc::clone(&store));

        let err = p.capture_and_mark(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Record(_)));
        assert_eq!(store.row_count(), 0);
        assert_eq!(p.state(), PipelineState::Idle);

        store.fail_writes.store(false, Ordering::SeqCst);
        p.capture_and_mark(&CancellationToken::new()).await.unwrap();
        assert_eq!(store.row_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_capture_rejected() {
        let (release, gate) = mpsc::channel();
        let store = Arc::new(MemoryStore::with_gallery(&[("A", &[1.0, 0.0])]));
        let p = Arc::new(pipeline(
            GatedSource::new(gate),
            &[1.0, 0.0],
            Arc::clone(&store),
        ));

        let first = {
            let p = Arc::clone(&p);
            tokio::spawn(async move { p.capture_and_mark(&CancellationToken::new()).await })
        };
        wait_for_state(&p, PipelineState::Capturing).await;

        let second = p.capture_and_mark(&CancellationToken::new()).await;
        assert!(matches!(second, Err(PipelineError::Busy)));

        release.send(()).unwrap();
        let outcome = first.await.unwrap().unwrap();
        assert!(matches!(outcome, CaptureOutcome::Marked { .. }));
        assert_eq!(store.row_count(), 1);
        assert_eq!(p.state(), PipelineState::Idle);
    }

    #[tokio::test]
    async fn test_cancel_during_capture_writes_nothing() {
        let (release, gate) = mpsc::channel();
        let store = Arc::new(MemoryStore::with_gallery(&[("A", &[1.0, 0.0])]));
        let p = Arc::new(pipeline(
            GatedSource::new(gate),
            &[1.0, 0.0],
            Arc::clone(&store),
        ));
        let cancel = CancellationToken::new();

        let run = {
            let p = Arc::clone(&p);
            let cancel = cancel.clone();
            tokio::spawn(async move { p.capture_and_mark(&cancel).await })
        };
        wait_for_state(&p, PipelineState::Capturing).await;
        cancel.cancel();
        release.send(()).unwrap();

        let result = run.await.unwrap();
        assert!(matches!(result, Err(PipelineError::Cancelled)));
        assert_eq!(store.row_count(), 0);
        assert_eq!(store.gallery_reads.load(Ordering::SeqCst), 0);
        assert_eq!(p.state(), PipelineState::Idle);
    }

    #[tokio::test]
    async fn test_cancelled_attempt_stays_busy_until_capture_returns() {
        let (release, gate) = mpsc::channel();
        let store = Arc::new(MemoryStore::with_gallery(&[("A", &[1.0, 0.0])]));
        let source = Arc::new(GatedSource::new(gate));
        let p = Arc::new(
            AttendancePipeline::new(
                Arc::clone(&source),
                Arc::new(FixedExtractor::new(&[1.0, 0.0])),
                Arc::clone(&store),
                Arc::clone(&store),
                0.7,
            )
            .with_clock(day),
        );
        let cancel = CancellationToken::new();

        let run = {
            let p = Arc::clone(&p);
            let cancel = cancel.clone();
            tokio::spawn(async move { p.capture_and_mark(&cancel).await })
        };
        wait_for_state(&p, PipelineState::Capturing).await;
        cancel.cancel();

        // The capture thread is still blocked: the attempt must not end yet,
        // and a fresh attempt must not start a second capture.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!run.is_finished());
        assert_ne!(p.state(), PipelineState::Idle);
        let retry = p.capture_and_mark(&CancellationToken::new()).await;
        assert!(matches!(retry, Err(PipelineError::Busy)));

        release.send(()).unwrap();
        assert!(matches!(run.await.unwrap(), Err(PipelineError::Cancelled)));
        p.wait_idle().await;
        assert_eq!(p.state(), PipelineState::Idle);

        release.send(()).unwrap();
        let outcome = p.capture_and_mark(&CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, CaptureOutcome::Marked { .. }));
        assert_eq!(source.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(store.row_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_before_capture() {
        let store = Arc::new(MemoryStore::with_gallery(&[("A", &[1.0, 0.0])]));
        let p = pipeline(StillSource, &[1.0, 0.0], Arc::clone(&store));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = p.capture_and_mark(&cancel).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(store.row_count(), 0);
    }

    #[test]
    fn test_outcome_json() {
        let marked = CaptureOutcome::Marked {
            student_id: "s-1".into(),
            display_name: "Ada".into(),
            similarity: 0.5,
            date: day(),
        };
        let json = serde_json::to_value(&marked).unwrap();
        assert_eq!(json["outcome"], "marked");
        assert_eq!(json["date"], "2026-10-16");
        assert_eq!(
            serde_json::to_value(CaptureOutcome::NoMatch).unwrap()["outcome"],
            "no_match"
        );
        let kept = CaptureOutcome::KeptManual {
            student_id: "s-1".into(),
            display_name: "Ada".into(),
            similarity: 0.9,
            date: day(),
        };
        assert_eq!(serde_json::to_value(&kept).unwrap()["outcome"], "kept_manual");
    }
}
