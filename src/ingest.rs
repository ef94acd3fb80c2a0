//! Offline construction of the vector database.
//!
//! Reads a structured knowledge export — `content.json` with chapter text,
//! `image.json` with image metadata and an image directory — chunks the text
//! into passages, encodes both modalities and writes the persisted layout
//! that [`crate::retrieval::KnowledgeEngine::load`] consumes.

use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;

use crate::encoder::{model_id_hash, unit_normalized, EncodeError, Encoder};
use crate::retrieval::storage::{
    self, DatabaseManifest, StorageError, VectorFile, IMAGE_RECORDS_FILE, IMAGE_VECTORS_FILE,
    TEXT_RECORDS_FILE, TEXT_VECTORS_FILE,
};
use crate::retrieval::{
    ImageRecord, IndexError, KnowledgeRecord, MetadataStore, TextRecord, VectorIndex,
};

/// Soft cap on passage length, in characters
const TARGET_CHUNK_CHARS: usize = 500;

const TEXT_BATCH_SIZE: usize = 32;
const IMAGE_BATCH_SIZE: usize = 16;

/// Edge length of the placeholder substituted for undecodable images
const PLACEHOLDER_EDGE: u32 = 224;

/// Errors that can occur while building the database.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed knowledge export: {0}")]
    Export(#[from] serde_json::Error),

    #[error("Encoder error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// One chapter of the knowledge export.
#[derive(Debug, Deserialize)]
struct ChapterInput {
    chapter_number: u32,
    chapter_name: String,
    chapter_text: String,
}

/// One image entry of the knowledge export.
#[derive(Debug, Deserialize)]
struct ImageInput {
    chapter_number: u32,
    chapter_name: String,
    image_id: String,
    image_url: String,
    image_description: String,
}

/// Accumulates index/store pairs for both modalities, then persists them.
pub struct DatabaseBuilder<'a> {
    encoder: &'a dyn Encoder,
    model_name: String,
    text_index: VectorIndex,
    text_store: MetadataStore,
    image_index: VectorIndex,
    image_store: MetadataStore,
}

impl<'a> DatabaseBuilder<'a> {
    pub fn new(encoder: &'a dyn Encoder, model_name: &str) -> Self {
        let dimensions = encoder.dimensions();
        Self {
            encoder,
            model_name: model_name.to_string(),
            text_index: VectorIndex::new(dimensions),
            text_store: MetadataStore::new(),
            image_index: VectorIndex::new(dimensions),
            image_store: MetadataStore::new(),
        }
    }

    pub fn text_count(&self) -> usize {
        self.text_store.len()
    }

    pub fn image_count(&self) -> usize {
        self.image_store.len()
    }

    /// Chunk and encode all chapter text from `content_file`.
    ///
    /// Returns the number of passages added.
    pub fn ingest_text(&mut self, content_file: &Path) -> Result<usize, IngestError> {
        let chapters: Vec<ChapterInput> =
            serde_json::from_str(&std::fs::read_to_string(content_file)?)?;

        let mut records = Vec::new();
        let mut texts = Vec::new();
        for chapter in &chapters {
            for (chunk_id, chunk) in chunk_chapter_text(&chapter.chapter_text)
                .into_iter()
                .enumerate()
            {
                records.push(KnowledgeRecord::Text(TextRecord {
                    chapter_number: chapter.chapter_number,
                    chapter_name: chapter.chapter_name.clone(),
                    chunk_id: chunk_id as u32,
                    text: chunk.clone(),
                }));
                texts.push(chunk);
            }
        }

        let bar = progress_bar(texts.len(), "encoding text");
        for (batch, batch_records) in texts
            .chunks(TEXT_BATCH_SIZE)
            .zip(records.chunks(TEXT_BATCH_SIZE))
        {
            let embeddings = self.encoder.encode_text_batch(batch)?;
            for (embedding, record) in embeddings.into_iter().zip(batch_records) {
                let embedding = unit_normalized(embedding)?;
                // Index row and metadata record are appended together so the
                // positional pairing never drifts.
                self.text_index.push(&embedding)?;
                self.text_store.push(record.clone());
            }
            bar.inc(batch.len() as u64);
        }
        bar.finish();

        log::info!("added {} text passages", texts.len());
        Ok(texts.len())
    }

    /// Encode all images listed in `image_file`, resolving paths against
    /// `image_dir`.
    ///
    /// Missing files are skipped with a warning; undecodable files are
    /// replaced by a blank placeholder so the rest of the batch survives.
    /// Returns the number of images added.
    pub fn ingest_images(
        &mut self,
        image_file: &Path,
        image_dir: &Path,
    ) -> Result<usize, IngestError> {
        let entries: Vec<ImageInput> =
            serde_json::from_str(&std::fs::read_to_string(image_file)?)?;

        // Placeholder temp files must outlive the encoding pass.
        let mut spooled = Vec::new();
        let mut paths: Vec<PathBuf> = Vec::new();
        let mut records = Vec::new();

        for entry in entries {
            let path = image_dir.join(&entry.image_url);
            if !path.exists() {
                log::warn!("image file missing, skipping: {}", path.display());
                continue;
            }

            let path = match image::open(&path) {
                Ok(_) => path,
                Err(err) => {
                    log::warn!("undecodable image {}, using placeholder: {err}", path.display());
                    let file = placeholder_image()?;
                    let path = file.path().to_path_buf();
                    spooled.push(file);
                    path
                }
            };

            paths.push(path);
            records.push(KnowledgeRecord::Image(ImageRecord {
                chapter_number: entry.chapter_number,
                chapter_name: entry.chapter_name,
                image_id: entry.image_id,
                image_url: entry.image_url,
                image_description: entry.image_description,
            }));
        }

        let bar = progress_bar(paths.len(), "encoding images");
        for (batch, batch_records) in paths
            .chunks(IMAGE_BATCH_SIZE)
            .zip(records.chunks(IMAGE_BATCH_SIZE))
        {
            let embeddings = self.encoder.encode_image_files(batch)?;
            for (embedding, record) in embeddings.into_iter().zip(batch_records) {
                let embedding = unit_normalized(embedding)?;
                self.image_index.push(&embedding)?;
                self.image_store.push(record.clone());
            }
            bar.inc(batch.len() as u64);
        }
        bar.finish();

        log::info!("added {} images", paths.len());
        Ok(paths.len())
    }

    /// Persist both modalities and the manifest to `output_dir`.
    pub fn save(&self, output_dir: &Path) -> Result<(), IngestError> {
        std::fs::create_dir_all(output_dir)?;

        let model_id = model_id_hash(&self.model_name);

        VectorFile::new(output_dir.join(TEXT_VECTORS_FILE)).save(&self.text_index, &model_id)?;
        VectorFile::new(output_dir.join(IMAGE_VECTORS_FILE)).save(&self.image_index, &model_id)?;
        storage::save_records(&output_dir.join(TEXT_RECORDS_FILE), &self.text_store)?;
        storage::save_records(&output_dir.join(IMAGE_RECORDS_FILE), &self.image_store)?;
        storage::save_manifest(
            output_dir,
            &DatabaseManifest {
                embedding_dim: self.encoder.dimensions(),
                text_count: self.text_store.len(),
                image_count: self.image_store.len(),
                model: self.model_name.clone(),
            },
        )?;

        log::info!(
            "database saved to {}: {} text passages, {} images",
            output_dir.display(),
            self.text_store.len(),
            self.image_store.len()
        );
        Ok(())
    }
}

/// Split chapter text into passages of roughly [`TARGET_CHUNK_CHARS`]
/// characters, breaking on sentence boundaries.
pub fn chunk_chapter_text(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for sentence in text.split(". ") {
        if current.chars().count() + sentence.chars().count() < TARGET_CHUNK_CHARS {
            current.push_str(sentence);
            current.push_str(". ");
        } else {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                chunks.push(trimmed.to_string());
            }
            current = format!("{}. ", sentence);
        }
    }

    let trimmed = current.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }

    chunks
}

fn placeholder_image() -> Result<tempfile::NamedTempFile, IngestError> {
    let blank = image::RgbImage::from_pixel(
        PLACEHOLDER_EDGE,
        PLACEHOLDER_EDGE,
        image::Rgb([255, 255, 255]),
    );
    let file = tempfile::Builder::new().suffix(".png").tempfile()?;
    image::DynamicImage::ImageRgb8(blank)
        .save_with_format(file.path(), image::ImageFormat::Png)
        .map_err(|e| EncodeError::EmbeddingFailed(e.to_string()))
        .map_err(IngestError::from)?;
    Ok(file)
}

fn progress_bar(total: usize, message: &'static str) -> ProgressBar {
    let bar = ProgressBar::new(total as u64);
    bar.set_style(
        ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len}")
            .unwrap()
            .progress_chars("=> "),
    );
    bar.set_message(message);
    bar
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_empty_text() {
        assert!(chunk_chapter_text("").is_empty());
        assert!(chunk_chapter_text("   ").is_empty());
    }

    #[test]
    fn test_chunk_short_text_is_single_chunk() {
        let chunks = chunk_chapter_text("One sentence. Another sentence.");
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].contains("One sentence"));
        assert!(chunks[0].contains("Another sentence"));
    }

    #[test]
    fn test_chunk_long_text_splits_on_sentences() {
        let sentence = "a".repeat(200);
        let text = format!("{s}. {s}. {s}. {s}", s = sentence);

        let chunks = chunk_chapter_text(&text);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            // Each chunk holds whole sentences under the target length plus
            // the joining punctuation.
            assert!(chunk.chars().count() <= TARGET_CHUNK_CHARS + 2);
        }
    }

    #[test]
    fn test_chunk_preserves_all_sentences() {
        let text = "First. Second. Third.";
        let joined = chunk_chapter_text(text).join(" ");
        assert!(joined.contains("First"));
        assert!(joined.contains("Second"));
        assert!(joined.contains("Third"));
    }

    #[test]
    fn test_placeholder_image_is_decodable() {
        let file = placeholder_image().unwrap();
        let decoded = image::open(file.path()).unwrap();
        assert_eq!(decoded.width(), PLACEHOLDER_EDGE);
        assert_eq!(decoded.height(), PLACEHOLDER_EDGE);
    }
}
