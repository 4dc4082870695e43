//! Feature-extraction model via ONNX Runtime.
//!
//! Runs a ViT-style image feature extractor on a whole RGB frame and keeps
//! the leading `embedding_dim` output values: the pooled embedding for models
//! that emit one, or the CLS token of a `[1, tokens, dim]` hidden state.

use crate::extractor::{EmbeddingExtractor, ExtractionError};
use crate::types::Embedding;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::PathBuf;
use std::sync::Mutex;

// --- Named constants ---
const DEFAULT_INPUT_SIZE: u32 = 224;
const DEFAULT_EMBEDDING_DIM: usize = 768;
/// Pixels are scaled to [0, 1] then normalized with mean 0.5 / std 0.5.
const PIXEL_MEAN: f32 = 0.5;
const PIXEL_STD: f32 = 0.5;

#[derive(Debug, Clone)]
pub struct OnnxExtractorConfig {
    pub model_path: PathBuf,
    /// Square input edge in pixels.
    pub input_size: u32,
    pub embedding_dim: usize,
    pub intra_threads: usize,
}

impl OnnxExtractorConfig {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            input_size: DEFAULT_INPUT_SIZE,
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            intra_threads: 2,
        }
    }
}

/// ONNX-backed embedding extractor.
pub struct OnnxExtractor {
    session: Mutex<Session>,
    input_size: u32,
    embedding_dim: usize,
}

impl OnnxExtractor {
    /// Load the ONNX model described by `config`.
    pub fn load(config: &OnnxExtractorConfig) -> Result<Self, ExtractionError> {
        if !config.model_path.exists() {
            return Err(ExtractionError::ModelUnavailable(format!(
                "model file not found: {}",
                config.model_path.display()
            )));
        }
        if config.input_size == 0 || config.embedding_dim == 0 {
            return Err(ExtractionError::ModelUnavailable(
                "input size and embedding dimension must be non-zero".into(),
            ));
        }

        let session = Session::builder()?
            .with_intra_threads(config.intra_threads)
            .map_err(ort::Error::from)?
            .commit_from_file(&config.model_path)?;

        tracing::info!(
            path = %config.model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            input_size = config.input_size,
            embedding_dim = config.embedding_dim,
            "loaded feature extraction model"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_size: config.input_size,
            embedding_dim: config.embedding_dim,
        })
    }

    /// Resize to the model's square input and build an NCHW float tensor.
    fn preprocess(image: &RgbImage, size: u32) -> Array4<f32> {
        let resized = if image.width() == size && image.height() == size {
            image.clone()
        } else {
            imageops::resize(image, size, size, FilterType::Triangle)
        };

        let side = size as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
        for (x, y, px) in resized.enumerate_pixels() {
            for c in 0..3 {
                let scaled = px.0[c] as f32 / 255.0;
                tensor[[0, c, y as usize, x as usize]] = (scaled - PIXEL_MEAN) / PIXEL_STD;
            }
        }
        tensor
    }

    /// Take the leading embedding values from the raw output and L2-normalize.
    fn finish(raw: &[f32], dim: usize) -> Result<Embedding, ExtractionError> {
        if raw.len() < dim {
            return Err(ExtractionError::InferenceFailed(format!(
                "expected at least {dim} output values, got {}",
                raw.len()
            )));
        }
        let embedding = Embedding::new(raw[..dim].to_vec());
        if embedding.values.iter().any(|v| !v.is_finite()) {
            return Err(ExtractionError::InferenceFailed(
                "model produced non-finite values".into(),
            ));
        }
        Ok(embedding.normalized())
    }
}

impl EmbeddingExtractor for OnnxExtractor {
    fn extract(&self, image: &RgbImage) -> Result<Embedding, ExtractionError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(ExtractionError::UnsupportedImage(format!(
                "empty frame ({}x{})",
                image.width(),
                image.height()
            )));
        }

        let input = Self::preprocess(image, self.input_size);

        let mut session = self
            .session
            .lock()
            .map_err(|_| ExtractionError::InferenceFailed("model session poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractionError::InferenceFailed(format!("embedding extraction: {e}")))?;

        Self::finish(raw_data, self.embedding_dim)
    }
}
