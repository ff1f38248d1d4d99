//! Brute-force reference store: scores every stored vector and sorts.
//! Exact, and fast enough for small corpora and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::RagError;
use crate::index::DistanceMetric;
use crate::types::{Chunk, RetrievalResult};

use super::{check_write, present, SearchOptions, VectorStore};

pub struct InMemoryVectorStore {
    dimension: usize,
    metric: DistanceMetric,
    chunks: RwLock<HashMap<String, Chunk>>,
}

impl InMemoryVectorStore {
    pub fn new(dimension: usize) -> Self {
        Self::with_metric(dimension, DistanceMetric::Cosine)
    }

    pub fn with_metric(dimension: usize, metric: DistanceMetric) -> Self {
        Self {
            dimension,
            metric,
            chunks: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn insert(&self, chunks: Vec<Chunk>) -> Result<(), RagError> {
        // Validate the whole batch before mutating anything.
        for chunk in &chunks {
            check_write(chunk, self.dimension)?;
        }
        let mut store = self.chunks.write();
        for chunk in chunks {
            store.insert(chunk.id.clone(), chunk);
        }
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        options: &SearchOptions,
    ) -> Result<Vec<RetrievalResult>, RagError> {
        if query.len() != self.dimension {
            return Err(RagError::DimensionMismatch {
                expected: self.dimension,
                got: query.len(),
            });
        }

        let store = self.chunks.read();
        let mut scored: Vec<(f32, &Chunk)> = store
            .values()
            .filter(|chunk| {
                // Brute-force scan filters in-line, before scoring.
                options
                    .filter
                    .as_ref()
                    .map(|f| f.matches(&chunk.metadata))
                    .unwrap_or(true)
            })
            .filter_map(|chunk| {
                let embedding = chunk.embedding.as_deref()?;
                let score = self.metric.score(self.metric.distance(query, embedding));
                Some((score, chunk))
            })
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        Ok(scored
            .into_iter()
            .filter(|(score, _)| options.min_score.map(|m| *score >= m).unwrap_or(true))
            .take(options.top_k)
            .map(|(score, chunk)| RetrievalResult::new(present(chunk, options), score))
            .collect())
    }

    async fn delete(&self, ids: &[String]) -> Result<usize, RagError> {
        let mut store = self.chunks.write();
        Ok(ids.iter().filter(|id| store.remove(*id).is_some()).count())
    }

    async fn count(&self) -> usize {
        self.chunks.read().len()
    }

    async fn clear(&self) {
        self.chunks.write().clear();
    }
}
