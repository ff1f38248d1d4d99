//! HNSW-backed store: approximate search over the graph index with chunk
//! payloads kept alongside. Metadata filters apply post-index, so filtered
//! queries oversample the graph to keep `top_k` fillable.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::RagError;
use crate::index::{HnswIndex, HnswParams};
use crate::types::{Chunk, RetrievalResult};

use super::{check_write, present, SearchOptions, VectorStore};

/// Oversampling factor for filtered searches.
const FILTER_OVERSAMPLE: usize = 4;

pub struct HnswVectorStore {
    index: RwLock<HnswIndex>,
    chunks: RwLock<HashMap<String, Chunk>>,
}

impl HnswVectorStore {
    pub fn new(dimension: usize, params: HnswParams) -> Result<Self, RagError> {
        Ok(Self {
            index: RwLock::new(HnswIndex::new(dimension, params)?),
            chunks: RwLock::new(HashMap::new()),
        })
    }

    pub fn with_dimension(dimension: usize) -> Result<Self, RagError> {
        Self::new(dimension, HnswParams::default())
    }

    pub fn set_ef_search(&self, ef_search: usize) {
        self.index.write().set_ef_search(ef_search);
    }

    /// Rebuild the underlying graph, dropping tombstones.
    pub fn rebuild(&self) -> Result<(), RagError> {
        self.index.write().rebuild()
    }

    pub fn tombstone_count(&self) -> usize {
        self.index.read().tombstone_count()
    }
}

#[async_trait]
impl VectorStore for HnswVectorStore {
    fn dimension(&self) -> usize {
        self.index.read().dimension()
    }

    async fn insert(&self, chunks: Vec<Chunk>) -> Result<(), RagError> {
        let dimension = self.dimension();
        for chunk in &chunks {
            check_write(chunk, dimension)?;
        }

        let mut index = self.index.write();
        let mut store = self.chunks.write();
        for chunk in chunks {
            if let Some(embedding) = chunk.embedding.clone() {
                index.insert(chunk.id.clone(), embedding)?;
                store.insert(chunk.id.clone(), chunk);
            }
        }
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        options: &SearchOptions,
    ) -> Result<Vec<RetrievalResult>, RagError> {
        let fetch = if options.filter.is_some() {
            options.top_k.saturating_mul(FILTER_OVERSAMPLE)
        } else {
            options.top_k
        };

        let index = self.index.read();
        let metric = index.metric();
        let hits = index.search(query, fetch)?;
        drop(index);

        let store = self.chunks.read();
        let mut results = Vec::with_capacity(options.top_k);
        for (id, distance) in hits {
            let Some(chunk) = store.get(&id) else {
                continue;
            };
            if let Some(filter) = &options.filter {
                if !filter.matches(&chunk.metadata) {
                    continue;
                }
            }
            let score = metric.score(distance);
            if options.min_score.map(|m| score < m).unwrap_or(false) {
                continue;
            }
            results.push(RetrievalResult::new(present(chunk, options), score));
            if results.len() >= options.top_k {
                break;
            }
        }
        Ok(results)
    }

    async fn delete(&self, ids: &[String]) -> Result<usize, RagError> {
        let mut index = self.index.write();
        let mut store = self.chunks.write();
        let mut removed = 0;
        for id in ids {
            if index.delete(id) {
                removed += 1;
            }
            store.remove(id);
        }
        Ok(removed)
    }

    async fn count(&self) -> usize {
        self.index.read().len()
    }

    async fn clear(&self) {
        self.index.write().clear();
        self.chunks.write().clear();
    }
}
