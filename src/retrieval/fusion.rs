//! Cross-modal score fusion.
//!
//! Text and image hits are rescored with per-modality weights and merged into
//! one ranked list. Weights are caller-supplied and need not sum to 1; the
//! defaults favor text because same-modality similarity scores run higher and
//! are more numerous than cross-modal ones.

use serde::Serialize;

use crate::retrieval::searcher::SearchHit;

/// A search hit with its fusion-weighted score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedHit {
    #[serde(flatten)]
    pub record: crate::retrieval::metadata::KnowledgeRecord,
    pub similarity_score: f32,
    pub weighted_score: f32,
}

/// Outcome of fusing two per-modality result lists.
///
/// `combined_results` is truncated to the requested `top_k`; the per-modality
/// lists are kept complete for diagnostic consumption.
#[derive(Debug, Clone, Serialize)]
pub struct FusedResults {
    pub text_results: Vec<FusedHit>,
    pub image_results: Vec<FusedHit>,
    pub combined_results: Vec<FusedHit>,
    pub total_results: usize,
}

impl FusedResults {
    /// An empty result set, as produced by an empty query.
    pub fn empty() -> Self {
        Self {
            text_results: Vec::new(),
            image_results: Vec::new(),
            combined_results: Vec::new(),
            total_results: 0,
        }
    }
}

/// Merge text and image hits into one list ranked by weighted score.
///
/// The sort is stable and text hits precede image hits in the input, so an
/// exact score tie ranks the text hit first.
pub fn fuse(
    text_hits: Vec<SearchHit>,
    image_hits: Vec<SearchHit>,
    text_weight: f32,
    image_weight: f32,
    top_k: usize,
) -> FusedResults {
    let text_results: Vec<FusedHit> = text_hits
        .into_iter()
        .map(|hit| weigh(hit, text_weight))
        .collect();
    let image_results: Vec<FusedHit> = image_hits
        .into_iter()
        .map(|hit| weigh(hit, image_weight))
        .collect();

    let total_results = text_results.len() + image_results.len();

    let mut combined_results: Vec<FusedHit> = text_results
        .iter()
        .chain(image_results.iter())
        .cloned()
        .collect();
    // NaN ranks below every real score, keeping the ordering total.
    combined_results.sort_by(|a, b| ranked(b.weighted_score).total_cmp(&ranked(a.weighted_score)));
    combined_results.truncate(top_k);

    FusedResults {
        text_results,
        image_results,
        combined_results,
        total_results,
    }
}

fn weigh(hit: SearchHit, weight: f32) -> FusedHit {
    FusedHit {
        weighted_score: hit.similarity_score * weight,
        similarity_score: hit.similarity_score,
        record: hit.record,
    }
}

fn ranked(score: f32) -> f32 {
    if score.is_nan() {
        f32::NEG_INFINITY
    } else {
        score
    }
}
