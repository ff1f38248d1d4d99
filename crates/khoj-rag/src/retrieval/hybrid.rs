//! Hybrid retriever: runs the enabled rankers concurrently, fuses their
//! rankings with Reciprocal Rank Fusion, and calibrates a per-result
//! confidence score from rank agreement, score consistency, and signal
//! presence.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

use crate::error::RagError;
use crate::types::{Chunk, ConfidenceScore, RankerContribution, RetrievalResult};

use super::{validate_query, RetrieveOptions, Retriever};

pub struct HybridRetriever {
    rankers: Vec<Arc<dyn Retriever>>,
    rrf_k: usize,
}

impl HybridRetriever {
    pub fn new(rankers: Vec<Arc<dyn Retriever>>) -> Self {
        Self { rankers, rrf_k: 60 }
    }

    pub fn with_rrf_k(mut self, rrf_k: usize) -> Self {
        self.rrf_k = rrf_k.max(1);
        self
    }

    pub fn ranker_count(&self) -> usize {
        self.rankers.len()
    }
}

#[async_trait]
impl Retriever for HybridRetriever {
    fn name(&self) -> &str {
        "hybrid"
    }

    async fn retrieve(
        &self,
        query: &str,
        options: &RetrieveOptions,
    ) -> Result<Vec<RetrievalResult>, RagError> {
        validate_query(query)?;
        if self.rankers.is_empty() {
            return Ok(Vec::new());
        }

        // Each ranker gets its own query copy and options slice; no shared
        // mutable state crosses the fan-out.
        let futures = self.rankers.iter().map(|ranker| {
            let ranker = ranker.clone();
            let query = query.to_string();
            let options = options.clone();
            async move {
                let name = ranker.name().to_string();
                (name, ranker.retrieve(&query, &options).await)
            }
        });

        let mut lists: Vec<(String, Vec<RetrievalResult>)> = Vec::with_capacity(self.rankers.len());
        let mut last_error: Option<RagError> = None;
        for (name, outcome) in join_all(futures).await {
            match outcome {
                Ok(results) => lists.push((name, results)),
                Err(e) => {
                    tracing::warn!(ranker = %name, error = %e, "ranker failed, fusing without it");
                    last_error = Some(e);
                }
            }
        }

        if lists.is_empty() {
            return Err(RagError::RetrievalFailed {
                source: Box::new(last_error.unwrap_or(RagError::InvalidQuery(
                    "no rankers produced results".into(),
                ))),
            });
        }

        let mut fused = fuse_rrf(&lists, self.rrf_k);
        for result in &mut fused {
            let confidence = confidence_for(result, self.rankers.len());
            result.confidence = Some(confidence);
        }

        fused.truncate(options.top_k);
        tracing::debug!(
            query = %query,
            rankers = lists.len(),
            fused = fused.len(),
            "hybrid fusion complete"
        );
        Ok(fused)
    }
}

struct FusedEntry {
    chunk: Chunk,
    best_source_score: f32,
    fused_score: f32,
    contributions: Vec<RankerContribution>,
}

/// Reciprocal Rank Fusion: `score(d) = Σ 1/(k + rank)` over the lists that
/// contain d. Every enabled ranker gets a contribution entry; rank and score
/// are absent when that ranker did not return the chunk.
fn fuse_rrf(lists: &[(String, Vec<RetrievalResult>)], rrf_k: usize) -> Vec<RetrievalResult> {
    let mut entries: HashMap<String, FusedEntry> = HashMap::new();

    for (list_index, (name, results)) in lists.iter().enumerate() {
        for (position, result) in results.iter().enumerate() {
            let rank = position + 1;
            let contribution = 1.0 / (rrf_k as f32 + rank as f32);

            let entry = entries.entry(result.id.clone()).or_insert_with(|| {
                let mut contributions = Vec::with_capacity(lists.len());
                for (other_name, _) in lists {
                    contributions.push(RankerContribution {
                        name: other_name.clone(),
                        rank: None,
                        score: None,
                        contribution: 0.0,
                    });
                }
                FusedEntry {
                    chunk: result.chunk.clone(),
                    best_source_score: result.score,
                    fused_score: 0.0,
                    contributions,
                }
            });

            entry.fused_score += contribution;
            if result.score > entry.best_source_score {
                entry.best_source_score = result.score;
                entry.chunk = result.chunk.clone();
            }
            let slot = &mut entry.contributions[list_index];
            slot.rank = Some(rank);
            slot.score = Some(result.score);
            slot.contribution = contribution;
        }
    }

    let mut fused: Vec<RetrievalResult> = entries
        .into_iter()
        .map(|(id, entry)| RetrievalResult {
            id,
            chunk: entry.chunk,
            score: entry.fused_score,
            contributions: Some(entry.contributions),
            confidence: None,
        })
        .collect();

    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    fused
}

/// Confidence calibration over the per-ranker contributions.
fn confidence_for(result: &RetrievalResult, total_rankers: usize) -> ConfidenceScore {
    let empty = Vec::new();
    let contributions = result.contributions.as_ref().unwrap_or(&empty);

    let present: Vec<&RankerContribution> =
        contributions.iter().filter(|c| c.rank.is_some()).collect();
    let present_count = present.len();

    // Rank agreement: average closeness-to-top, damped by the spread of
    // normalized rank positions across rankers.
    let rank_agreement = if present_count == 0 {
        0.0
    } else {
        let max_rank = present
            .iter()
            .filter_map(|c| c.rank)
            .max()
            .unwrap_or(1)
            .max(1) as f32;
        let positions: Vec<f32> = present
            .iter()
            .filter_map(|c| c.rank)
            .map(|r| (r as f32 - 1.0) / max_rank)
            .collect();
        let mean_agreement =
            positions.iter().map(|p| 1.0 - p).sum::<f32>() / present_count as f32;
        let mean_pos = positions.iter().sum::<f32>() / present_count as f32;
        let variance = positions
            .iter()
            .map(|p| (p - mean_pos) * (p - mean_pos))
            .sum::<f32>()
            / present_count as f32;
        mean_agreement * (1.0 - variance.sqrt().min(0.5))
    };

    // Score consistency: 1 − coefficient of variation, clamped. A single
    // signal is trivially consistent.
    let scores: Vec<f32> = present.iter().filter_map(|c| c.score).collect();
    let score_consistency = if scores.len() <= 1 {
        1.0
    } else {
        let mean = scores.iter().sum::<f32>() / scores.len() as f32;
        if mean <= f32::EPSILON {
            1.0
        } else {
            let variance = scores.iter().map(|s| (s - mean) * (s - mean)).sum::<f32>()
                / scores.len() as f32;
            let cv = variance.sqrt() / mean;
            1.0 - cv.clamp(0.0, 1.0)
        }
    };

    let multi_signal_presence = if total_rankers == 0 {
        0.0
    } else {
        present_count as f32 / total_rankers as f32
    };

    let overall = (0.4 * rank_agreement + 0.3 * score_consistency + 0.3 * multi_signal_presence)
        .clamp(0.0, 1.0);

    ConfidenceScore {
        rank_agreement,
        score_consistency,
        multi_signal_presence,
        overall,
    }
}
