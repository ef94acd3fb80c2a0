//! High-level multimodal retrieval engine.
//!
//! Owns one searcher per modality plus the query encoder, and exposes the
//! operations the CLI and HTTP layers consume. The engine is constructed
//! once at startup and is read-only afterwards; queries may run concurrently
//! from any number of tasks.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::encoder::{model_id_hash, unit_normalized, EncodeError, Encoder};
use crate::retrieval::context::{self, RagContext};
use crate::retrieval::fusion::{self, FusedResults};
use crate::retrieval::index::IndexError;
use crate::retrieval::metadata::{ImageRecord, KnowledgeRecord, TextRecord};
use crate::retrieval::searcher::{Modality, ModalitySearcher, SearchHit};
use crate::retrieval::storage::{
    self, StorageError, IMAGE_RECORDS_FILE, IMAGE_VECTORS_FILE, TEXT_RECORDS_FILE,
    TEXT_VECTORS_FILE,
};

/// Number of fused candidates considered during context assembly.
const RAG_CANDIDATE_POOL: usize = 10;

/// Errors that can occur inside the retrieval engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("encoder error: {0}")]
    Encode(#[from] EncodeError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("embedding dimension mismatch: database declares {declared}, encoder produces {encoder}")]
    DimensionMismatch { declared: usize, encoder: usize },

    #[error("{modality} count mismatch: manifest declares {declared}, loaded {loaded}")]
    CountMismatch {
        modality: &'static str,
        declared: usize,
        loaded: usize,
    },

    #[error("chapter {0} not found")]
    ChapterNotFound(u32),
}

/// Tuning knobs for the engine, usually sourced from the config file.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Similarity floor for same-modality text search
    pub text_min_score: f32,
    /// Similarity floor for cross-modal image search. Cross-modal scores run
    /// systematically lower than same-modality ones, hence the lower default.
    pub image_min_score: f32,
    pub text_weight: f32,
    pub image_weight: f32,
    pub max_context_length: usize,
    pub max_context_images: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            text_min_score: 0.3,
            image_min_score: 0.2,
            text_weight: 0.6,
            image_weight: 0.4,
            max_context_length: 2000,
            max_context_images: 5,
        }
    }
}

/// Counts reported by the health endpoint and CLI.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EngineStats {
    pub text_count: usize,
    pub image_count: usize,
    pub embedding_dim: usize,
}

/// Per-chapter aggregate over both metadata stores.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChapterSummary {
    pub chapter_number: u32,
    pub chapter_name: String,
    pub text_chunks: usize,
    pub images: usize,
}

/// Full content of a single chapter.
#[derive(Debug, Clone, Serialize)]
pub struct ChapterDetail {
    pub chapter_number: u32,
    pub chapter_name: String,
    pub texts: Vec<TextRecord>,
    pub images: Vec<ImageRecord>,
}

/// The multimodal retrieval engine.
pub struct KnowledgeEngine {
    encoder: Box<dyn Encoder>,
    text: ModalitySearcher,
    image: ModalitySearcher,
    options: EngineOptions,
}

impl KnowledgeEngine {
    /// Assemble an engine from already-loaded parts.
    pub fn from_parts(
        encoder: Box<dyn Encoder>,
        text: ModalitySearcher,
        image: ModalitySearcher,
        options: EngineOptions,
    ) -> Self {
        Self {
            encoder,
            text,
            image,
            options,
        }
    }

    /// Load a persisted database and validate it against the encoder.
    ///
    /// Any mismatch (dimension, cardinality, declared counts, model id) is
    /// fatal: the engine refuses to serve queries over inconsistent state.
    pub fn load(
        database_dir: &Path,
        encoder: Box<dyn Encoder>,
        options: EngineOptions,
    ) -> Result<Self, EngineError> {
        let manifest = storage::load_manifest(database_dir)?;
        if manifest.embedding_dim != encoder.dimensions() {
            return Err(EngineError::DimensionMismatch {
                declared: manifest.embedding_dim,
                encoder: encoder.dimensions(),
            });
        }

        let model_id = model_id_hash(&manifest.model);

        let (text_index, text_store) = storage::load_pair(
            &database_dir.join(TEXT_VECTORS_FILE),
            &database_dir.join(TEXT_RECORDS_FILE),
            &model_id,
            manifest.embedding_dim,
        )?;
        if text_store.len() != manifest.text_count {
            return Err(EngineError::CountMismatch {
                modality: "text",
                declared: manifest.text_count,
                loaded: text_store.len(),
            });
        }

        let (image_index, image_store) = storage::load_pair(
            &database_dir.join(IMAGE_VECTORS_FILE),
            &database_dir.join(IMAGE_RECORDS_FILE),
            &model_id,
            manifest.embedding_dim,
        )?;
        if image_store.len() != manifest.image_count {
            return Err(EngineError::CountMismatch {
                modality: "image",
                declared: manifest.image_count,
                loaded: image_store.len(),
            });
        }

        log::info!(
            "knowledge base loaded: {} text chunks, {} images, dim {}",
            text_store.len(),
            image_store.len(),
            manifest.embedding_dim
        );

        Ok(Self::from_parts(
            encoder,
            ModalitySearcher::new(Modality::Text, text_index, text_store),
            ModalitySearcher::new(Modality::Image, image_index, image_store),
            options,
        ))
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            text_count: self.text.len(),
            image_count: self.image.len(),
            embedding_dim: self.encoder.dimensions(),
        }
    }

    /// Search text passages with a text query.
    pub fn search_text(
        &self,
        query: &str,
        top_k: usize,
        min_score: Option<f32>,
    ) -> Result<Vec<SearchHit>, EngineError> {
        let Some(vector) = self.encode_text_query(query)? else {
            return Ok(Vec::new());
        };
        let min_score = min_score.unwrap_or(self.options.text_min_score);
        let hits = self.text.search(&vector, top_k, min_score)?;
        log::debug!("text search: {} hits above {min_score}", hits.len());
        Ok(hits)
    }

    /// Search images with a text query (cross-modal).
    pub fn search_images(
        &self,
        query: &str,
        top_k: usize,
        min_score: Option<f32>,
    ) -> Result<Vec<SearchHit>, EngineError> {
        let Some(vector) = self.encode_text_query(query)? else {
            return Ok(Vec::new());
        };
        let min_score = min_score.unwrap_or(self.options.image_min_score);
        let hits = self.image.search(&vector, top_k, min_score)?;
        log::debug!("image search: {} hits above {min_score}", hits.len());
        Ok(hits)
    }

    /// Search both modalities with a query image.
    ///
    /// Returns `(image hits, text hits)`. An unreadable image fails only
    /// this request; the loaded indices are untouched.
    pub fn search_by_image(
        &self,
        image: &[u8],
        top_k: usize,
        min_score: Option<f32>,
    ) -> Result<(Vec<SearchHit>, Vec<SearchHit>), EngineError> {
        let vector = unit_normalized(self.encoder.encode_image(image)?)?;
        let min_score = min_score.unwrap_or(self.options.text_min_score);

        let image_hits = self.image.search(&vector, top_k, min_score)?;
        let text_hits = self.text.search(&vector, top_k, min_score)?;
        Ok((image_hits, text_hits))
    }

    /// Search both modalities with a text query and fuse the results.
    pub fn multimodal_search(
        &self,
        query: &str,
        top_k: usize,
        text_weight: Option<f32>,
        image_weight: Option<f32>,
    ) -> Result<FusedResults, EngineError> {
        let Some(vector) = self.encode_text_query(query)? else {
            return Ok(FusedResults::empty());
        };

        let text_hits = self
            .text
            .search(&vector, top_k, self.options.text_min_score)?;
        let image_hits = self
            .image
            .search(&vector, top_k, self.options.image_min_score)?;

        Ok(fusion::fuse(
            text_hits,
            image_hits,
            text_weight.unwrap_or(self.options.text_weight),
            image_weight.unwrap_or(self.options.image_weight),
            top_k,
        ))
    }

    /// Build a length-budgeted context bundle for answer generation.
    pub fn generate_rag_context(
        &self,
        query: &str,
        max_context_length: Option<usize>,
    ) -> Result<RagContext, EngineError> {
        let fused = self.multimodal_search(query, RAG_CANDIDATE_POOL, None, None)?;
        let max_context_length = max_context_length.unwrap_or(self.options.max_context_length);
        Ok(context::assemble(
            &fused,
            max_context_length,
            self.options.max_context_images,
        ))
    }

    /// Per-chapter passage and image counts, ordered by chapter number.
    pub fn chapters(&self) -> Vec<ChapterSummary> {
        let mut chapters: BTreeMap<u32, ChapterSummary> = BTreeMap::new();

        for record in self
            .text
            .store()
            .records()
            .iter()
            .chain(self.image.store().records())
        {
            let summary = chapters
                .entry(record.chapter_number())
                .or_insert_with(|| ChapterSummary {
                    chapter_number: record.chapter_number(),
                    chapter_name: record.chapter_name().to_string(),
                    text_chunks: 0,
                    images: 0,
                });
            match record {
                KnowledgeRecord::Text(_) => summary.text_chunks += 1,
                KnowledgeRecord::Image(_) => summary.images += 1,
            }
        }

        chapters.into_values().collect()
    }

    /// All passages and images of one chapter.
    pub fn chapter(&self, chapter_number: u32) -> Result<ChapterDetail, EngineError> {
        let texts: Vec<TextRecord> = self
            .text
            .store()
            .records()
            .iter()
            .filter_map(|record| match record {
                KnowledgeRecord::Text(r) if r.chapter_number == chapter_number => Some(r.clone()),
                _ => None,
            })
            .collect();

        let images: Vec<ImageRecord> = self
            .image
            .store()
            .records()
            .iter()
            .filter_map(|record| match record {
                KnowledgeRecord::Image(r) if r.chapter_number == chapter_number => Some(r.clone()),
                _ => None,
            })
            .collect();

        let chapter_name = texts
            .first()
            .map(|r| r.chapter_name.clone())
            .or_else(|| images.first().map(|r| r.chapter_name.clone()))
            .ok_or(EngineError::ChapterNotFound(chapter_number))?;

        Ok(ChapterDetail {
            chapter_number,
            chapter_name,
            texts,
            images,
        })
    }

    /// Encode a text query, re-normalizing defensively.
    ///
    /// An empty or whitespace-only query is not an error; it yields `None`
    /// and callers return empty results.
    fn encode_text_query(&self, query: &str) -> Result<Option<Vec<f32>>, EngineError> {
        if query.trim().is_empty() {
            return Ok(None);
        }
        let vector = unit_normalized(self.encoder.encode_text(query)?)?;
        Ok(Some(vector))
    }
}
