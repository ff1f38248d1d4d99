//! Rerankers: reorder fused retrieval results with a richer relevance
//! signal. Three interchangeable variants behind one contract, sharing a
//! template that validates, deduplicates, ranks, and attaches the score
//! breakdown around each variant's scoring hook.

mod cross_encoder;
mod llm;
mod mmr;
mod position;

pub use cross_encoder::CrossEncoderReranker;
pub use llm::{LlmRerankMode, LlmReranker};
pub use mmr::MmrReranker;
pub use position::{apply_position_bias, PositionBias};

use async_trait::async_trait;

use crate::error::RagError;
use crate::types::{RerankerResult, RetrievalResult, ScoreBreakdown};

#[derive(Debug, Clone)]
pub struct RerankOptions {
    pub top_k: Option<usize>,
    pub min_score: Option<f32>,
    /// Pure post-step permutation. `new_rank` is assigned after it runs, so
    /// ranks always match final output positions.
    pub position_bias: PositionBias,
    /// Head-block size for the sandwich orderings.
    pub start_count: usize,
}

impl Default for RerankOptions {
    fn default() -> Self {
        Self {
            top_k: None,
            min_score: None,
            position_bias: PositionBias::Relevance,
            start_count: 3,
        }
    }
}

#[async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;

    async fn rerank(
        &self,
        query: &str,
        results: Vec<RetrievalResult>,
        options: &RerankOptions,
    ) -> Result<Vec<RerankerResult>, RagError>;

    /// Pre-load any heavy model this reranker depends on. Default: nothing.
    async fn warm_up(&self) -> Result<(), RagError> {
        Ok(())
    }
}

/// One scored item produced by a reranker hook. `original_index` is the
/// 0-based position in the reranker input.
pub(crate) struct ScoredItem {
    pub original_index: usize,
    pub result: RetrievalResult,
    pub score: f32,
    pub relevance_score: Option<f32>,
    pub diversity_penalty: Option<f32>,
}

/// Common finalization around the scoring hooks: dedup by id (keeping the
/// higher-ranked occurrence), order, cut, attach the breakdown, apply the
/// position-bias post-step, and assign 1-indexed ranks over the final list.
///
/// `presorted` keeps the hook's own order (MMR selection order); otherwise
/// items are sorted by score descending.
pub(crate) fn finalize(
    mut items: Vec<ScoredItem>,
    options: &RerankOptions,
    presorted: bool,
) -> Vec<RerankerResult> {
    // Dedup by id, keeping the occurrence ranked higher in the input,
    // without disturbing the list order (presorted hooks rely on it).
    let mut winner: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    for item in &items {
        winner
            .entry(item.result.id.clone())
            .and_modify(|w| *w = (*w).min(item.original_index))
            .or_insert(item.original_index);
    }
    items.retain(|item| winner.get(&item.result.id) == Some(&item.original_index));

    if !presorted {
        items.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.original_index.cmp(&b.original_index))
        });
    }

    if let Some(min_score) = options.min_score {
        items.retain(|item| item.score >= min_score);
    }
    if let Some(top_k) = options.top_k {
        items.truncate(top_k);
    }

    let ranked: Vec<RerankerResult> = items
        .into_iter()
        .map(|item| RerankerResult {
            id: item.result.id.clone(),
            breakdown: ScoreBreakdown {
                original_score: item.result.score,
                reranker_score: item.score,
                relevance_score: item.relevance_score,
                diversity_penalty: item.diversity_penalty,
            },
            chunk: item.result.chunk,
            score: item.score,
            original_rank: item.original_index + 1,
            new_rank: 0,
        })
        .collect();

    // Permute first, then number: `new_rank` must equal each result's
    // position in the returned list, whatever the ordering did.
    let mut out = apply_position_bias(ranked, options.position_bias, options.start_count);
    for (position, result) in out.iter_mut().enumerate() {
        result.new_rank = position + 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Chunk;

    fn item(id: &str, index: usize, score: f32) -> ScoredItem {
        ScoredItem {
            original_index: index,
            result: RetrievalResult::new(Chunk::new(id, format!("content {}", id)), 0.5),
            score,
            relevance_score: None,
            diversity_penalty: None,
        }
    }

    #[test]
    fn test_ranks_are_a_permutation() {
        let items = vec![item("a", 0, 0.2), item("b", 1, 0.9), item("c", 2, 0.5)];
        let out = finalize(items, &RerankOptions::default(), false);

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].id, "b");
        assert_eq!(out[0].original_rank, 2);
        assert_eq!(out[0].new_rank, 1);
        let mut new_ranks: Vec<usize> = out.iter().map(|r| r.new_rank).collect();
        new_ranks.sort();
        assert_eq!(new_ranks, vec![1, 2, 3]);
    }

    #[test]
    fn test_dedup_keeps_higher_ranked_occurrence() {
        let items = vec![item("a", 0, 0.3), item("a", 1, 0.9), item("b", 2, 0.5)];
        let out = finalize(items, &RerankOptions::default(), false);
        assert_eq!(out.len(), 2);
        let a = out.iter().find(|r| r.id == "a").expect("a");
        assert_eq!(a.original_rank, 1);
        assert!((a.score - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_top_k_and_min_score() {
        let items = vec![item("a", 0, 0.9), item("b", 1, 0.4), item("c", 2, 0.1)];
        let options = RerankOptions {
            top_k: Some(2),
            min_score: Some(0.2),
            ..RerankOptions::default()
        };
        let out = finalize(items, &options, false);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|r| r.score >= 0.2));
    }

    #[test]
    fn test_breakdown_preserves_original_score() {
        let items = vec![item("a", 0, 0.7)];
        let out = finalize(items, &RerankOptions::default(), false);
        assert!((out[0].breakdown.original_score - 0.5).abs() < 1e-6);
        assert!((out[0].breakdown.reranker_score - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_position_bias_applies_after_ranking() {
        let items: Vec<ScoredItem> = (0..7)
            .map(|i| item(&format!("r{}", i + 1), i, 1.0 - i as f32 * 0.1))
            .collect();
        let options = RerankOptions {
            position_bias: PositionBias::Sandwich,
            start_count: 3,
            ..RerankOptions::default()
        };
        let out = finalize(items, &options, false);
        let ids: Vec<&str> = out.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2", "r3", "r7", "r6", "r5", "r4"]);
        // new_rank follows the final output positions, not relevance order.
        for (position, result) in out.iter().enumerate() {
            assert_eq!(result.new_rank, position + 1);
        }
        // original_rank still points back into the reranker input.
        assert_eq!(out[3].id, "r7");
        assert_eq!(out[3].original_rank, 7);
    }
}
