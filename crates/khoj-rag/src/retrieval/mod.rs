//! Retrievers: translate a query into ranked chunks from each index, and
//! fuse multiple signals into one ranking.

mod dense;
mod hybrid;
mod sparse;

pub use dense::DenseRetriever;
pub use hybrid::HybridRetriever;
pub use sparse::Bm25Retriever;

use async_trait::async_trait;

use crate::error::RagError;
use crate::store::MetadataFilter;
use crate::types::RetrievalResult;

#[derive(Debug, Clone)]
pub struct RetrieveOptions {
    pub top_k: usize,
    pub min_score: Option<f32>,
    pub filter: Option<MetadataFilter>,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            top_k: 10,
            min_score: None,
            filter: None,
        }
    }
}

impl RetrieveOptions {
    pub fn top_k(top_k: usize) -> Self {
        Self {
            top_k,
            ..Self::default()
        }
    }
}

/// Capability interface over one ranking signal.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Stable name, used in fused-result contributions.
    fn name(&self) -> &str;

    /// Ranked chunks with scores in [0, 1], descending.
    async fn retrieve(
        &self,
        query: &str,
        options: &RetrieveOptions,
    ) -> Result<Vec<RetrievalResult>, RagError>;
}

pub(crate) fn validate_query(query: &str) -> Result<(), RagError> {
    if query.trim().is_empty() {
        return Err(RagError::InvalidQuery("query is empty".into()));
    }
    Ok(())
}
