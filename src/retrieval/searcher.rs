//! Score-and-threshold-filtered search over a single modality.

use serde::Serialize;

use crate::retrieval::index::{IndexError, VectorIndex};
use crate::retrieval::metadata::{KnowledgeRecord, MetadataStore};

/// Content modality of an index/store pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Image,
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Modality::Text => write!(f, "text"),
            Modality::Image => write!(f, "image"),
        }
    }
}

/// A search result carrying its raw similarity score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub record: KnowledgeRecord,
    pub similarity_score: f32,
}

/// A vector index paired with its positional metadata store.
pub struct ModalitySearcher {
    modality: Modality,
    index: VectorIndex,
    store: MetadataStore,
}

impl ModalitySearcher {
    pub fn new(modality: Modality, index: VectorIndex, store: MetadataStore) -> Self {
        Self {
            modality,
            index,
            store,
        }
    }

    pub fn modality(&self) -> Modality {
        self.modality
    }

    /// Number of indexed vectors.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn dimensions(&self) -> usize {
        self.index.dimensions()
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    /// Search this modality and keep candidates scoring at least `min_score`.
    ///
    /// A candidate position past the metadata bounds means the index and
    /// store desynchronized; the candidate is skipped rather than failing the
    /// whole query.
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<SearchHit>, IndexError> {
        let candidates = self.index.search(query, top_k)?;

        let mut hits = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if candidate.score < min_score {
                continue;
            }
            let record = match self.store.get(candidate.position) {
                Ok(record) => record,
                Err(err) => {
                    log::warn!("{} index desynchronized: {err}", self.modality);
                    continue;
                }
            };
            hits.push(SearchHit {
                record: record.clone(),
                similarity_score: candidate.score,
            });
        }

        Ok(hits)
    }
}
