//! Flat in-memory vector index with exact inner-product search.
//!
//! Vectors are stored row-major in insertion order; the row position is the
//! key that pairs a vector with its metadata record. Search scores every
//! stored row against the query, which for unit vectors is cosine similarity.

use rayon::prelude::*;

/// A scored row returned by [`VectorIndex::search`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredPosition {
    /// Inner product between the query and the stored vector
    pub score: f32,
    /// Insertion position of the stored vector
    pub position: usize,
}

/// Append-only flat index over fixed-dimension vectors.
pub struct VectorIndex {
    /// Row-major vector data, `len() * dimensions` values
    data: Vec<f32>,
    /// Expected embedding dimensions
    dimensions: usize,
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

impl VectorIndex {
    /// Create a new empty index with the specified dimensions.
    pub fn new(dimensions: usize) -> Self {
        Self {
            data: Vec::new(),
            dimensions,
        }
    }

    /// Create an index with pre-allocated capacity for `capacity` rows.
    pub fn with_capacity(dimensions: usize, capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(dimensions * capacity),
            dimensions,
        }
    }

    /// Get the expected embedding dimensions.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Get the number of stored vectors.
    pub fn len(&self) -> usize {
        if self.dimensions == 0 {
            return 0;
        }
        self.data.len() / self.dimensions
    }

    /// Check if the index is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append a single vector, assigning it the next position.
    pub fn push(&mut self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }
        self.data.extend_from_slice(vector);
        Ok(())
    }

    /// Append a batch of vectors.
    ///
    /// Every vector is validated before any is appended, so a failed add
    /// leaves the index unchanged.
    pub fn add(&mut self, vectors: &[Vec<f32>]) -> Result<(), IndexError> {
        for vector in vectors {
            if vector.len() != self.dimensions {
                return Err(IndexError::DimensionMismatch {
                    expected: self.dimensions,
                    got: vector.len(),
                });
            }
        }
        for vector in vectors {
            self.data.extend_from_slice(vector);
        }
        Ok(())
    }

    /// Get the vector stored at `position`, if any.
    pub fn row(&self, position: usize) -> Option<&[f32]> {
        let start = position.checked_mul(self.dimensions)?;
        self.data.get(start..start + self.dimensions)
    }

    /// Iterate over stored rows in insertion order.
    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dimensions)
    }

    /// Exact top-k search by inner product.
    ///
    /// Returns at most `k` results ordered by descending score; equal scores
    /// keep insertion order. Searching an empty index returns an empty list.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredPosition>, IndexError> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }

        if self.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<ScoredPosition> = self
            .data
            .par_chunks_exact(self.dimensions)
            .enumerate()
            .map(|(position, row)| ScoredPosition {
                score: dot(query, row),
                position,
            })
            .collect();

        // Undefined scores sort below every real score so the ordering is
        // total and the sort cannot fail.
        scored.sort_unstable_by(|a, b| {
            ranked(b.score)
                .total_cmp(&ranked(a.score))
                .then(a.position.cmp(&b.position))
        });
        scored.truncate(k);

        Ok(scored)
    }
}

/// Inner product of two equal-length vectors.
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn ranked(score: f32) -> f32 {
    if score.is_nan() {
        f32::NEG_INFINITY
    } else {
        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_index() {
        let index = VectorIndex::new(512);
        assert_eq!(index.dimensions(), 512);
        assert!(index.is_empty());
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_push_and_row() {
        let mut index = VectorIndex::new(3);
        index.push(&[1.0, 0.0, 0.0]).unwrap();
        index.push(&[0.0, 1.0, 0.0]).unwrap();

        assert_eq!(index.len(), 2);
        assert_eq!(index.row(0), Some(&[1.0, 0.0, 0.0][..]));
        assert_eq!(index.row(1), Some(&[0.0, 1.0, 0.0][..]));
        assert_eq!(index.row(2), None);
    }

    #[test]
    fn test_push_dimension_mismatch() {
        let mut index = VectorIndex::new(3);
        let result = index.push(&[1.0, 0.0, 0.0, 0.0]);
        assert!(matches!(result, Err(IndexError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_add_is_all_or_nothing() {
        let mut index = VectorIndex::new(3);
        let vectors = vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0]];

        let result = index.add(&vectors);
        assert!(matches!(result, Err(IndexError::DimensionMismatch { .. })));
        assert!(index.is_empty());
    }

    #[test]
    fn test_search_empty_index() {
        let index = VectorIndex::new(3);
        let results = index.search(&[1.0, 0.0, 0.0], 5).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_search_query_dimension_mismatch() {
        let index = VectorIndex::new(3);
        let result = index.search(&[1.0, 0.0], 5);
        assert!(matches!(result, Err(IndexError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_search_self_match() {
        let mut index = VectorIndex::new(3);
        index.push(&[0.0, 1.0, 0.0]).unwrap();
        index.push(&[1.0, 0.0, 0.0]).unwrap();
        index.push(&[0.0, 0.0, 1.0]).unwrap();

        let results = index.search(&[1.0, 0.0, 0.0], 1).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].position, 1);
        assert!((results[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_search_descending_order_and_limit() {
        let mut index = VectorIndex::new(2);
        index.push(&[0.6, 0.8]).unwrap();
        index.push(&[1.0, 0.0]).unwrap();
        index.push(&[0.8, 0.6]).unwrap();

        let results = index.search(&[1.0, 0.0], 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].position, 1);
        assert_eq!(results[1].position, 2);
        assert!(results[0].score >= results[1].score);
    }

    #[test]
    fn test_search_ties_keep_insertion_order() {
        let mut index = VectorIndex::new(2);
        index.push(&[1.0, 0.0]).unwrap();
        index.push(&[1.0, 0.0]).unwrap();
        index.push(&[1.0, 0.0]).unwrap();

        let results = index.search(&[1.0, 0.0], 3).unwrap();
        let positions: Vec<usize> = results.iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
    }

    #[test]
    fn test_search_nan_scores_rank_last() {
        let mut index = VectorIndex::new(2);
        index.push(&[f32::NAN, 0.0]).unwrap();
        index.push(&[1.0, 0.0]).unwrap();

        let results = index.search(&[1.0, 0.0], 2).unwrap();
        assert_eq!(results[0].position, 1);
        assert_eq!(results[1].position, 0);
    }

    #[test]
    fn test_search_k_larger_than_index() {
        let mut index = VectorIndex::new(2);
        index.push(&[1.0, 0.0]).unwrap();

        let results = index.search(&[1.0, 0.0], 10).unwrap();
        assert_eq!(results.len(), 1);
    }
}
