//! Positional metadata records paired with a vector index.
//!
//! The record at position `i` always describes the vector at row `i` of the
//! paired index; both are appended together at build time and never mutated
//! afterwards.

use serde::{Deserialize, Serialize};

/// One embedded text passage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRecord {
    pub chapter_number: u32,
    pub chapter_name: String,
    /// Sequence number of this chunk within its chapter
    pub chunk_id: u32,
    pub text: String,
}

/// One embedded illustration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub chapter_number: u32,
    pub chapter_name: String,
    pub image_id: String,
    /// Path of the image relative to the knowledge export's image directory
    pub image_url: String,
    pub image_description: String,
}

/// The record stored at one index position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum KnowledgeRecord {
    Text(TextRecord),
    Image(ImageRecord),
}

impl KnowledgeRecord {
    pub fn chapter_number(&self) -> u32 {
        match self {
            KnowledgeRecord::Text(r) => r.chapter_number,
            KnowledgeRecord::Image(r) => r.chapter_number,
        }
    }

    pub fn chapter_name(&self) -> &str {
        match self {
            KnowledgeRecord::Text(r) => &r.chapter_name,
            KnowledgeRecord::Image(r) => &r.chapter_name,
        }
    }

    /// Source attribution label used in assembled contexts.
    pub fn source_label(&self) -> String {
        format!("Chapter {}: {}", self.chapter_number(), self.chapter_name())
    }
}

/// Errors that can occur during metadata lookups.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("record position {position} out of range (store holds {len})")]
    OutOfRange { position: usize, len: usize },
}

/// Append-only ordered sequence of records, keyed by insertion position.
#[derive(Debug, Default)]
pub struct MetadataStore {
    records: Vec<KnowledgeRecord>,
}

impl MetadataStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store from already-ordered records.
    pub fn from_records(records: Vec<KnowledgeRecord>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append a record, assigning it the next position.
    pub fn push(&mut self, record: KnowledgeRecord) {
        self.records.push(record);
    }

    /// Get the record at `position`.
    pub fn get(&self, position: usize) -> Result<&KnowledgeRecord, MetadataError> {
        self.records.get(position).ok_or(MetadataError::OutOfRange {
            position,
            len: self.records.len(),
        })
    }

    /// All records in insertion order.
    pub fn records(&self) -> &[KnowledgeRecord] {
        &self.records
    }
}
