//! Cross-encoder reranker: scores (query, chunk) pairs with an external
//! sequence-classification back-end and squashes raw logits through a
//! sigmoid. No min-max normalization — the squashed scores are already
//! meaningful across queries.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::RagError;
use crate::provider::CrossEncoderBackend;
use crate::types::{RerankerResult, RetrievalResult};
use crate::util;

use super::{finalize, RerankOptions, Reranker, ScoredItem};

pub struct CrossEncoderReranker {
    backend: Arc<dyn CrossEncoderBackend>,
}

impl CrossEncoderReranker {
    pub fn new(backend: Arc<dyn CrossEncoderBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Reranker for CrossEncoderReranker {
    fn name(&self) -> &str {
        "cross-encoder"
    }

    async fn warm_up(&self) -> Result<(), RagError> {
        self.backend.warm_up().await
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

        let pairs: Vec<(String, String)> = results
            .iter()
            .map(|r| (query.to_string(), r.chunk.content.clone()))
            .collect();

        let logits = self.backend.score_pairs(&pairs).await?;
        if logits.len() != results.len() {
            return Err(RagError::RerankingFailed {
                source: Box::new(RagError::provider(format!(
                    "cross-encoder returned {} scores for {} pairs",
                    logits.len(),
                    results.len()
                ))),
            });
        }

        let items: Vec<ScoredItem> = results
            .into_iter()
            .zip(logits)
            .enumerate()
            .map(|(index, (result, logit))| {
                let score = util::sigmoid(logit);
                ScoredItem {
                    original_index: index,
                    result,
                    score,
                    relevance_score: Some(score),
                    diversity_penalty: None,
                }
            })
            .collect();

        Ok(finalize(items, options, false))
    }
}
