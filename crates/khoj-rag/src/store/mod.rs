//! Vector store facade: dimension-checked CRUD over either a brute-force
//! scan or the HNSW index.

pub mod filter;
mod hnsw_store;
mod memory_store;

pub use filter::{FilterCondition, MetadataFilter};
pub use hnsw_store::HnswVectorStore;
pub use memory_store::InMemoryVectorStore;

use async_trait::async_trait;

use crate::error::RagError;
use crate::types::{Chunk, RetrievalResult};

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub top_k: usize,
    pub min_score: Option<f32>,
    pub filter: Option<MetadataFilter>,
    pub include_metadata: bool,
    pub include_vectors: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_k: 10,
            min_score: None,
            filter: None,
            include_metadata: true,
            include_vectors: false,
        }
    }
}

impl SearchOptions {
    pub fn top_k(top_k: usize) -> Self {
        Self {
            top_k,
            ..Self::default()
        }
    }
}

/// Capability interface over a chunk store with vector search.
///
/// Writes are id-keyed puts: `insert` replaces an existing id, `upsert` is
/// the explicit alias. Every write is dimension-checked against the store's
/// declared dimension.
#[async_trait]
pub trait VectorStore: Send + Sync {
    fn dimension(&self) -> usize;

    async fn insert(&self, chunks: Vec<Chunk>) -> Result<(), RagError>;

    async fn upsert(&self, chunks: Vec<Chunk>) -> Result<(), RagError> {
        self.insert(chunks).await
    }

    /// Vector similarity search. Results are score-descending; embeddings are
    /// stripped unless `include_vectors` is set.
    async fn search(
        &self,
        query: &[f32],
        options: &SearchOptions,
    ) -> Result<Vec<RetrievalResult>, RagError>;

    /// Remove chunks by id, returning how many were present.
    async fn delete(&self, ids: &[String]) -> Result<usize, RagError>;

    async fn count(&self) -> usize;

    async fn clear(&self);
}

pub(crate) fn check_write(chunk: &Chunk, dimension: usize) -> Result<&[f32], RagError> {
    let embedding = chunk
        .embedding
        .as_deref()
        .ok_or_else(|| RagError::InvalidQuery(format!("chunk '{}' has no embedding", chunk.id)))?;
    if embedding.len() != dimension {
        return Err(RagError::DimensionMismatch {
            expected: dimension,
            got: embedding.len(),
        });
    }
    Ok(embedding)
}

/// Shape a stored chunk for a result row per the search options.
pub(crate) fn present(chunk: &Chunk, options: &SearchOptions) -> Chunk {
    let mut out = if options.include_vectors {
        chunk.clone()
    } else {
        chunk.without_embedding()
    };
    if !options.include_metadata {
        out.metadata.clear();
    }
    out
}
