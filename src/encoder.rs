//! Query and document encoders.
//!
//! The retrieval core only sees the [`Encoder`] trait; the production
//! implementation wraps fastembed's paired CLIP text and vision towers so
//! text and images land in the same embedding space. fastembed's models
//! require `&mut self`, so each tower sits behind a Mutex — encoding is the
//! only serialized section, search stays lock-free.

use std::path::PathBuf;
use std::sync::Mutex;

use fastembed::{
    ImageEmbedding, ImageEmbeddingModel, ImageInitOptions, InitOptions, TextEmbedding,
};

/// Accepted deviation of an embedding's L2 norm from 1.0 before it is
/// re-normalized.
const NORM_TOLERANCE: f32 = 1e-3;

/// Error type for encoding operations
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),

    #[error("Unreadable query image: {0}")]
    UnreadableImage(String),

    #[error("Cannot use a zero-norm embedding")]
    ZeroNormVector,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Turns raw text and images into fixed-length unit vectors.
///
/// Implementations must produce vectors of the same `dimensions()` for both
/// modalities.
pub trait Encoder: Send + Sync {
    /// Embedding dimension shared by both modalities.
    fn dimensions(&self) -> usize;

    fn encode_text(&self, text: &str) -> Result<Vec<f32>, EncodeError>;

    fn encode_image(&self, bytes: &[u8]) -> Result<Vec<f32>, EncodeError>;

    fn encode_text_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EncodeError> {
        texts.iter().map(|text| self.encode_text(text)).collect()
    }

    fn encode_image_files(&self, paths: &[PathBuf]) -> Result<Vec<Vec<f32>>, EncodeError> {
        paths
            .iter()
            .map(|path| self.encode_image(&std::fs::read(path)?))
            .collect()
    }
}

/// Re-normalize a vector whose norm drifted past [`NORM_TOLERANCE`].
///
/// Encoders are expected to return unit vectors already; this is the
/// defensive boundary that keeps inner-product scores equal to cosine
/// similarity. Zero-norm vectors cannot be normalized and are rejected.
pub fn unit_normalized(mut vector: Vec<f32>) -> Result<Vec<f32>, EncodeError> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm < f32::EPSILON {
        return Err(EncodeError::ZeroNormVector);
    }
    if (norm - 1.0).abs() > NORM_TOLERANCE {
        for value in &mut vector {
            *value /= norm;
        }
    }
    Ok(vector)
}

/// Compute the SHA256 hash of a model name for storage identification.
pub fn model_id_hash(model_name: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(model_name.as_bytes());
    hasher.finalize().into()
}

/// fastembed-backed CLIP encoder.
pub struct ClipEncoder {
    text_model: Mutex<TextEmbedding>,
    image_model: Mutex<ImageEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl ClipEncoder {
    /// Load (downloading on first use) the paired text and vision towers of
    /// a CLIP model family.
    ///
    /// Models are cached in the `models/` subdirectory of `cache_dir`.
    pub fn new(model_name: &str, cache_dir: PathBuf) -> Result<Self, EncodeError> {
        let (text_enum, image_enum) = parse_model_name(model_name)?;

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EncodeError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        let text_options = InitOptions::new(text_enum)
            .with_cache_dir(models_dir.clone())
            .with_show_download_progress(true);
        let mut text_model = TextEmbedding::try_new(text_options)
            .map_err(|e| EncodeError::InitFailed(e.to_string()))?;

        let image_options = ImageInitOptions::new(image_enum)
            .with_cache_dir(models_dir)
            .with_show_download_progress(true);
        let image_model = ImageEmbedding::try_new(image_options)
            .map_err(|e| EncodeError::InitFailed(e.to_string()))?;

        let dimensions = probe_dimensions(&mut text_model)?;

        Ok(Self {
            text_model: Mutex::new(text_model),
            image_model: Mutex::new(image_model),
            model_name: model_name.to_string(),
            dimensions,
        })
    }

    pub fn name(&self) -> &str {
        &self.model_name
    }

    pub fn model_id_hash(&self) -> [u8; 32] {
        model_id_hash(&self.model_name)
    }

    /// Write an already-decoded query image to a temp file fastembed can
    /// read. PNG keeps the round-trip lossless.
    fn spool_image(image: &image::DynamicImage) -> Result<tempfile::NamedTempFile, EncodeError> {
        let file = tempfile::Builder::new().suffix(".png").tempfile()?;
        image
            .save_with_format(file.path(), image::ImageFormat::Png)
            .map_err(|e| EncodeError::EmbeddingFailed(e.to_string()))?;
        Ok(file)
    }

    fn embed_image_paths(&self, paths: Vec<PathBuf>) -> Result<Vec<Vec<f32>>, EncodeError> {
        let mut model = self.image_model.lock().map_err(|e| {
            EncodeError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        let embeddings = model
            .embed(paths, None)
            .map_err(|e| EncodeError::EmbeddingFailed(e.to_string()))?;

        embeddings.into_iter().map(unit_normalized).collect()
    }
}

impl Encoder for ClipEncoder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn encode_text(&self, text: &str) -> Result<Vec<f32>, EncodeError> {
        let mut model = self.text_model.lock().map_err(|e| {
            EncodeError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        let embeddings = model
            .embed(vec![text], None)
            .map_err(|e| EncodeError::EmbeddingFailed(e.to_string()))?;

        let embedding = embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EncodeError::EmbeddingFailed("No embedding returned".to_string()))?;
        unit_normalized(embedding)
    }

    fn encode_text_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EncodeError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut model = self.text_model.lock().map_err(|e| {
            EncodeError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        let embeddings = model
            .embed(texts.to_vec(), None)
            .map_err(|e| EncodeError::EmbeddingFailed(e.to_string()))?;

        embeddings.into_iter().map(unit_normalized).collect()
    }

    fn encode_image(&self, bytes: &[u8]) -> Result<Vec<f32>, EncodeError> {
        let decoded = image::load_from_memory(bytes)
            .map_err(|e| EncodeError::UnreadableImage(e.to_string()))?;
        let spooled = Self::spool_image(&decoded)?;

        let mut embeddings = self.embed_image_paths(vec![spooled.path().to_path_buf()])?;
        embeddings
            .pop()
            .ok_or_else(|| EncodeError::EmbeddingFailed("No embedding returned".to_string()))
    }

    fn encode_image_files(&self, paths: &[PathBuf]) -> Result<Vec<Vec<f32>>, EncodeError> {
        if paths.is_empty() {
            return Ok(vec![]);
        }
        self.embed_image_paths(paths.to_vec())
    }
}

/// Parse a model name into the paired fastembed text/vision enums.
fn parse_model_name(
    name: &str,
) -> Result<(fastembed::EmbeddingModel, ImageEmbeddingModel), EncodeError> {
    match name.to_lowercase().as_str() {
        "clip-vit-b-32" | "clipvitb32" => Ok((
            fastembed::EmbeddingModel::ClipVitB32,
            ImageEmbeddingModel::ClipVitB32,
        )),
        _ => Err(EncodeError::InvalidModel(format!(
            "Unknown model: {}. Supported models: clip-vit-b-32",
            name
        ))),
    }
}

/// Probe the text tower to determine embedding dimensions.
fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EncodeError> {
    let test_embeddings = model
        .embed(vec!["test"], None)
        .map_err(|e| EncodeError::InitFailed(format!("Failed to probe dimensions: {}", e)))?;

    test_embeddings
        .first()
        .map(|v| v.len())
        .ok_or_else(|| EncodeError::InitFailed("Model returned no embedding".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_normalized_passes_through_unit_vectors() {
        let vector = vec![0.6, 0.8];
        let normalized = unit_normalized(vector.clone()).unwrap();
        assert_eq!(normalized, vector);
    }

    #[test]
    fn test_unit_normalized_rescales_drifted_vectors() {
        let normalized = unit_normalized(vec![3.0, 4.0]).unwrap();
        let norm: f32 = normalized.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!((normalized[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_unit_normalized_rejects_zero_norm() {
        let result = unit_normalized(vec![0.0, 0.0, 0.0]);
        assert!(matches!(result, Err(EncodeError::ZeroNormVector)));
    }

    #[test]
    fn test_invalid_model_name() {
        let result = parse_model_name("nonexistent-model");
        assert!(matches!(result, Err(EncodeError::InvalidModel(_))));
    }

    #[test]
    fn test_model_id_hash_is_deterministic() {
        assert_eq!(model_id_hash("clip-vit-b-32"), model_id_hash("clip-vit-b-32"));
        assert_ne!(model_id_hash("clip-vit-b-32"), model_id_hash("other"));
    }

    // Integration tests require model download - run with --ignored
    #[test]
    #[ignore = "requires model download"]
    fn test_clip_text_and_image_dimensions_agree() {
        let temp_dir = std::env::temp_dir().join("mmkb-clip-test");
        let encoder = ClipEncoder::new("clip-vit-b-32", temp_dir.clone()).unwrap();

        let text = encoder.encode_text("a red chair").unwrap();
        assert_eq!(text.len(), encoder.dimensions());

        let norm: f32 = text.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.01);

        let _ = std::fs::remove_dir_all(&temp_dir);
    }
}
