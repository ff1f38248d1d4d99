//! Maximal Marginal Relevance reranker: greedy selection balancing query
//! relevance against similarity to already-selected chunks.
//!
//! At each step picks `argmax λ·sim(q, d) − (1 − λ)·max_{s∈S} sim(d, s)`.
//! Requires per-item embeddings; missing ones are computed on demand via the
//! embedding provider.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::RagError;
use crate::provider::EmbeddingProvider;
use crate::types::{RerankerResult, RetrievalResult};
use crate::util;

use super::{finalize, RerankOptions, Reranker, ScoredItem};

pub struct MmrReranker {
    embeddings: Arc<dyn EmbeddingProvider>,
    lambda: f32,
}

impl MmrReranker {
    pub fn new(embeddings: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            embeddings,
            lambda: 0.5,
        }
    }

    pub fn with_lambda(mut self, lambda: f32) -> Self {
        self.lambda = lambda.clamp(0.0, 1.0);
        self
    }

    /// Fill in embeddings for items that arrived without one.
    async fn resolve_embeddings(
        &self,
        results: &[RetrievalResult],
    ) -> Result<Vec<Vec<f32>>, RagError> {
        let mut missing: Vec<(usize, String)> = Vec::new();
        for (i, result) in results.iter().enumerate() {
            if result.chunk.embedding.is_none() {
                missing.push((i, result.chunk.content.clone()));
            }
        }

        let mut computed = std::collections::HashMap::new();
        if !missing.is_empty() {
            let texts: Vec<String> = missing.iter().map(|(_, t)| t.clone()).collect();
            let embedded = self.embeddings.embed_batch(&texts).await?;
            for ((index, _), embedding) in missing.into_iter().zip(embedded) {
                computed.insert(index, embedding.embedding);
            }
        }

        Ok(results
            .iter()
            .enumerate()
            .map(|(i, result)| {
                result
                    .chunk
                    .embedding
                    .clone()
                    .or_else(|| computed.remove(&i))
                    .unwrap_or_default()
            })
            .collect())
    }
}

#[async_trait]
impl Reranker for MmrReranker {
    fn name(&self) -> &str {
        "mmr"
    }

    async fn rerank(
        &self,
        query: &str,
        results: Vec<RetrievalResult>,
        options: &RerankOptions,
    ) -> Result<Vec<RerankerResult>, RagError> {
        if results.is_empty() {
            return Ok(Vec::new());
        }

        let query_embedding = self.embeddings.embed(query).await?.embedding;
        let embeddings = self.resolve_embeddings(&results).await?;

        let relevance: Vec<f32> = embeddings
            .iter()
            .map(|e| util::cosine_similarity(&query_embedding, e))
            .collect();

        // Greedy MMR selection over the full candidate set.
        let n = results.len();
        let mut remaining: Vec<usize> = (0..n).collect();
        let mut selected: Vec<(usize, f32, f32)> = Vec::with_capacity(n);

        while !remaining.is_empty() {
            let mut best: Option<(usize, usize, f32, f32)> = None;
            for (slot, &candidate) in remaining.iter().enumerate() {
                let max_selected_sim = selected
                    .iter()
                    .map(|&(s, _, _)| util::cosine_similarity(&embeddings[candidate], &embeddings[s]))
                    .fold(0.0f32, f32::max);
                let objective = self.lambda * relevance[candidate]
                    - (1.0 - self.lambda) * max_selected_sim;
                let better = best
                    .map(|(_, _, best_objective, _)| objective > best_objective)
                    .unwrap_or(true);
                if better {
                    best = Some((slot, candidate, objective, max_selected_sim));
                }
            }
            let Some((slot, candidate, objective, penalty)) = best else {
                break;
            };
            remaining.swap_remove(slot);
            selected.push((candidate, objective, penalty));
        }

        let mut by_index: Vec<Option<RetrievalResult>> = results.into_iter().map(Some).collect();
        let items: Vec<ScoredItem> = selected
            .into_iter()
            .filter_map(|(index, objective, penalty)| {
                by_index[index].take().map(|result| ScoredItem {
                    original_index: index,
                    result,
                    // Objective can dip below zero when diversity dominates;
                    // clamp so downstream min-score thresholds stay sane.
                    score: objective.clamp(0.0, 1.0),
                    relevance_score: Some(relevance[index]),
                    diversity_penalty: Some(penalty),
                })
            })
            .collect();

        // Selection order is the output order.
        Ok(finalize(items, options, true))
    }
}
