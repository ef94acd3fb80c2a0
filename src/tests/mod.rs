//! Engine-level tests backed by a deterministic stub encoder.
//!
//! The stub avoids model downloads: known queries map to fixed vectors,
//! everything else gets a deterministic pseudo-embedding derived from the
//! input, so ingestion flows work end to end without a real model.


use std::collections::HashMap;

use crate::encoder::{EncodeError, Encoder};
use crate::retrieval::{
    EngineOptions, ImageRecord, KnowledgeEngine, KnowledgeRecord, MetadataStore, Modality,
    ModalitySearcher, TextRecord, VectorIndex,
};

/// Unit vector along `axis`.
pub fn basis(dimensions: usize, axis: usize) -> Vec<f32> {
    let mut vector = vec![0.0; dimensions];
    vector[axis % dimensions] = 1.0;
    vector
}

/// Deterministic encoder for tests.
pub struct StubEncoder {
    dimensions: usize,
    text: HashMap<String, Vec<f32>>,
}

impl StubEncoder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            text: HashMap::new(),
        }
    }

    /// Pin the embedding returned for an exact query string.
    pub fn with_text(mut self, query: &str, vector: Vec<f32>) -> Self {
        assert_eq!(vector.len(), self.dimensions);
        self.text.insert(query.to_string(), vector);
        self
    }

    fn pseudo_embedding(&self, seed: u64) -> Vec<f32> {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        seed.hash(&mut hasher);
        basis(self.dimensions, hasher.finish() as usize)
    }
}

impl Encoder for StubEncoder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn encode_text(&self, text: &str) -> Result<Vec<f32>, EncodeError> {
        if let Some(vector) = self.text.get(text) {
            return Ok(vector.clone());
        }
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        text.hash(&mut hasher);
        Ok(self.pseudo_embedding(hasher.finish()))
    }

    fn encode_image(&self, bytes: &[u8]) -> Result<Vec<f32>, EncodeError> {
        let Some(first) = bytes.first() else {
            return Err(EncodeError::UnreadableImage("empty image data".to_string()));
        };
        Ok(basis(self.dimensions, *first as usize))
    }
}

pub fn text_record(chapter: u32, chunk: u32, text: &str) -> KnowledgeRecord {
    KnowledgeRecord::Text(TextRecord {
        chapter_number: chapter,
        chapter_name: format!("Chapter {chapter}"),
        chunk_id: chunk,
        text: text.to_string(),
    })
}

pub fn image_record(chapter: u32, id: &str) -> KnowledgeRecord {
    KnowledgeRecord::Image(ImageRecord {
        chapter_number: chapter,
        chapter_name: format!("Chapter {chapter}"),
        image_id: id.to_string(),
        image_url: format!("images/{id}.jpg"),
        image_description: format!("illustration {id}"),
    })
}

/// Build an engine from in-memory vector/record pairs.
pub fn engine_with(
    encoder: StubEncoder,
    text_entries: Vec<(Vec<f32>, KnowledgeRecord)>,
    image_entries: Vec<(Vec<f32>, KnowledgeRecord)>,
    options: EngineOptions,
) -> KnowledgeEngine {
    let dimensions = encoder.dimensions();

    let mut text_index = VectorIndex::new(dimensions);
    let mut text_store = MetadataStore::new();
    for (vector, record) in text_entries {
        text_index.push(&vector).unwrap();
        text_store.push(record);
    }

    let mut image_index = VectorIndex::new(dimensions);
    let mut image_store = MetadataStore::new();
    for (vector, record) in image_entries {
        image_index.push(&vector).unwrap();
        image_store.push(record);
    }

    KnowledgeEngine::from_parts(
        Box::new(encoder),
        ModalitySearcher::new(Modality::Text, text_index, text_store),
        ModalitySearcher::new(Modality::Image, image_index, image_store),
        options,
    )
}
