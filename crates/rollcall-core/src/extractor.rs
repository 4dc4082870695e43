//! Embedding extraction seam and lazy, single-flight model initialization.

use crate::types::Embedding;
use image::RgbImage;
use once_cell::sync::OnceCell;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("unsupported image: {0}")]
    UnsupportedImage(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps one RGB image to one fixed-length embedding.
///
/// Implementations are CPU bound and blocking; async callers should run them
/// on a blocking thread.
pub trait EmbeddingExtractor: Send + Sync {
    fn extract(&self, image: &RgbImage) -> Result<Embedding, ExtractionError>;

    /// Whether the backing model is in memory.
    fn is_loaded(&self) -> bool {
        true
    }
}

type Loader<E> = Box<dyn Fn() -> Result<E, ExtractionError> + Send + Sync>;

/// Extractor whose backing model is loaded on first use.
///
/// Concurrent first calls block on a single load. A failed load leaves the
/// extractor unloaded so the next call retries.
pub struct LazyExtractor<E> {
    cell: OnceCell<E>,
    loader: Loader<E>,
}

impl<E> LazyExtractor<E> {
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn() -> Result<E, ExtractionError> + Send + Sync + 'static,
    {
        Self {
            cell: OnceCell::new(),
            loader: Box::new(loader),
        }
    }

    /// Return the loaded model, loading it if this is the first call.
    pub fn get(&self) -> Result<&E, ExtractionError> {
        self.cell.get_or_try_init(|| {
            let started = Instant::now();
            tracing::info!("loading feature extraction model");
            let model = (self.loader)().map_err(|e| {
                tracing::error!(error = %e, "feature extraction model failed to load");
                e
            })?;
            tracing::info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "feature extraction model loaded"
            );
            Ok(model)
        })
    }
}

impl<E: EmbeddingExtractor> EmbeddingExtractor for LazyExtractor<E> {
    fn extract(&self, image: &RgbImage) -> Result<Embedding, ExtractionError> {
        self.get()?.extract(image)
    }

    fn is_loaded(&self) -> bool {
        self.cell.get().is_some()
    }
}
