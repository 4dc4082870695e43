//! rollcall-core — Face matching attendance engine.
//!
//! Turns a captured frame into an embedding through an opaque feature
//! extraction model, matches it against the enrolled gallery by cosine
//! similarity and records presence for the best match.

pub mod extractor;
pub mod matcher;
pub mod pipeline;
pub mod recognizer;
pub mod store;
pub mod types;

pub use extractor::{EmbeddingExtractor, ExtractionError, LazyExtractor};
pub use matcher::{CosineMatcher, MatchResult, Matcher, DEFAULT_THRESHOLD};
pub use pipeline::{
    AttendancePipeline, CaptureError, CaptureOutcome, FrameSource, PipelineError, PipelineState,
};
pub use recognizer::{OnnxExtractor, OnnxExtractorConfig};
pub use store::{AttendanceRecorder, GalleryStore, PresenceWrite, StorageError};
pub use types::{
    AttendanceRecord, AttendanceStatus, DimensionMismatch, Embedding, GalleryEntry, MarkSource,
    UnknownStatus,
};
