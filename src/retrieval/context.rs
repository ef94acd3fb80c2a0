//! Context assembly for answer generation.
//!
//! Walks an already-ranked fused list and packages a budgeted subset:
//! passages up to a cumulative character budget, images up to a count cap.
//! The two selections are independent passes over the same ranked list, so
//! exhausting the text budget never blocks image admission.

use serde::Serialize;

use crate::retrieval::fusion::FusedResults;
use crate::retrieval::metadata::KnowledgeRecord;

/// An admitted text passage with its source attribution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextPassage {
    pub content: String,
    pub source: String,
    pub similarity: f32,
}

/// An admitted image reference with its source attribution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImagePassage {
    pub image_url: String,
    pub description: String,
    pub source: String,
    pub similarity: f32,
}

/// Aggregate statistics over the admitted sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContextStats {
    pub text_chunks: usize,
    pub total_text_length: usize,
    pub related_images: usize,
}

/// A length-bounded, source-attributed context bundle.
#[derive(Debug, Clone, Serialize)]
pub struct RagContext {
    pub text_context: Vec<TextPassage>,
    pub image_context: Vec<ImagePassage>,
    pub context_stats: ContextStats,
}

impl RagContext {
    pub fn empty() -> Self {
        Self {
            text_context: Vec::new(),
            image_context: Vec::new(),
            context_stats: ContextStats {
                text_chunks: 0,
                total_text_length: 0,
                related_images: 0,
            },
        }
    }
}

/// Assemble a context bundle from a fused, already-ranked result set.
///
/// Text admission is a greedy prefix: the first passage that would push the
/// cumulative character count past `max_text_length` stops text admission
/// entirely, with no look-ahead for a smaller later chunk. Images are
/// admitted in rank order up to `max_images` with no length budget.
pub fn assemble(fused: &FusedResults, max_text_length: usize, max_images: usize) -> RagContext {
    let mut text_context = Vec::new();
    let mut total_text_length = 0usize;

    for hit in &fused.combined_results {
        if let KnowledgeRecord::Text(record) = &hit.record {
            let content_length = record.text.chars().count();
            if total_text_length + content_length > max_text_length {
                break;
            }
            text_context.push(TextPassage {
                content: record.text.clone(),
                source: hit.record.source_label(),
                similarity: hit.weighted_score,
            });
            total_text_length += content_length;
        }
    }

    let mut image_context = Vec::new();
    for hit in &fused.combined_results {
        if image_context.len() >= max_images {
            break;
        }
        if let KnowledgeRecord::Image(record) = &hit.record {
            image_context.push(ImagePassage {
                image_url: record.image_url.clone(),
                description: record.image_description.clone(),
                source: hit.record.source_label(),
                similarity: hit.weighted_score,
            });
        }
    }

    let context_stats = ContextStats {
        text_chunks: text_context.len(),
        total_text_length,
        related_images: image_context.len(),
    };

    RagContext {
        text_context,
        image_context,
        context_stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::fusion::FusedHit;
    use crate::retrieval::metadata::{ImageRecord, TextRecord};

    fn text_fused(chunk: u32, text: &str, weighted: f32) -> FusedHit {
        FusedHit {
            record: KnowledgeRecord::Text(TextRecord {
                chapter_number: 1,
                chapter_name: "Origins".to_string(),
                chunk_id: chunk,
                text: text.to_string(),
            }),
            similarity_score: weighted,
            weighted_score: weighted,
        }
    }

    fn image_fused(id: &str, weighted: f32) -> FusedHit {
        FusedHit {
            record: KnowledgeRecord::Image(ImageRecord {
                chapter_number: 2,
                chapter_name: "Modernism".to_string(),
                image_id: id.to_string(),
                image_url: format!("images/{id}.jpg"),
                image_description: format!("illustration {id}"),
            }),
            similarity_score: weighted,
            weighted_score: weighted,
        }
    }

    fn fused_with(combined: Vec<FusedHit>) -> FusedResults {
        FusedResults {
            text_results: Vec::new(),
            image_results: Vec::new(),
            total_results: combined.len(),
            combined_results: combined,
        }
    }

    #[test]
    fn test_text_budget_never_exceeded() {
        let fused = fused_with(vec![
            text_fused(0, "aaaaa", 0.9),
            text_fused(1, "bbbbb", 0.8),
            text_fused(2, "ccccc", 0.7),
        ]);

        let context = assemble(&fused, 10, 5);
        assert_eq!(context.text_context.len(), 2);
        assert_eq!(context.context_stats.total_text_length, 10);
    }

    #[test]
    fn test_first_overflow_stops_text_admission() {
        // The second passage overflows; the third would fit but greedy
        // prefix selection must not admit it.
        let fused = fused_with(vec![
            text_fused(0, "aaaa", 0.9),
            text_fused(1, "bbbbbbbbbb", 0.8),
            text_fused(2, "cc", 0.7),
        ]);

        let context = assemble(&fused, 8, 5);
        assert_eq!(context.text_context.len(), 1);
        assert_eq!(context.text_context[0].content, "aaaa");
    }

    #[test]
    fn test_image_cap_and_rank_order() {
        let fused = fused_with(vec![
            image_fused("2-1", 0.9),
            image_fused("2-2", 0.8),
            image_fused("2-3", 0.7),
        ]);

        let context = assemble(&fused, 100, 2);
        assert_eq!(context.image_context.len(), 2);
        assert_eq!(context.image_context[0].image_url, "images/2-1.jpg");
        assert_eq!(context.image_context[1].image_url, "images/2-2.jpg");
        assert_eq!(context.context_stats.related_images, 2);
    }

    #[test]
    fn test_text_cutoff_does_not_block_images() {
        let fused = fused_with(vec![
            text_fused(0, "aaaaaaaaaaaaaaaaaaaa", 0.9),
            image_fused("2-1", 0.8),
            text_fused(1, "b", 0.7),
            image_fused("2-2", 0.6),
        ]);

        let context = assemble(&fused, 5, 5);
        assert!(context.text_context.is_empty());
        assert_eq!(context.image_context.len(), 2);
    }

    #[test]
    fn test_source_labels() {
        let fused = fused_with(vec![text_fused(0, "aa", 0.9), image_fused("2-1", 0.8)]);

        let context = assemble(&fused, 100, 5);
        assert_eq!(context.text_context[0].source, "Chapter 1: Origins");
        assert_eq!(context.image_context[0].source, "Chapter 2: Modernism");
    }

    #[test]
    fn test_character_budget_counts_chars_not_bytes() {
        // Four CJK characters are 12 bytes but must count as 4.
        let fused = fused_with(vec![text_fused(0, "设计历史", 0.9)]);

        let context = assemble(&fused, 4, 5);
        assert_eq!(context.text_context.len(), 1);
        assert_eq!(context.context_stats.total_text_length, 4);
    }

    #[test]
    fn test_empty_fused_list() {
        let context = assemble(&fused_with(vec![]), 100, 5);
        assert!(context.text_context.is_empty());
        assert!(context.image_context.is_empty());
        assert_eq!(context.context_stats.text_chunks, 0);
    }
}
