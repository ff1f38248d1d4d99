//! Sparse retriever: BM25 over chunk content.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::RagError;
use crate::index::{Bm25Index, Bm25Params, Tokenizer};
use crate::types::{Chunk, RetrievalResult};

use super::{validate_query, RetrieveOptions, Retriever};

/// Keyword retriever over an in-memory BM25 index. `build` replaces the
/// indexed batch; retrieval returns chunks with normalized scores.
pub struct Bm25Retriever {
    index: RwLock<Bm25Index>,
    chunks: RwLock<HashMap<String, Chunk>>,
}

impl Bm25Retriever {
    pub fn new(params: Bm25Params) -> Result<Self, RagError> {
        Ok(Self {
            index: RwLock::new(Bm25Index::new(params)?),
            chunks: RwLock::new(HashMap::new()),
        })
    }

    pub fn with_tokenizer(params: Bm25Params, tokenizer: Tokenizer) -> Result<Self, RagError> {
        Ok(Self {
            index: RwLock::new(Bm25Index::new(params)?.with_tokenizer(tokenizer)),
            chunks: RwLock::new(HashMap::new()),
        })
    }

    /// Index a document batch, replacing any previous index.
    pub fn build(&self, batch: Vec<Chunk>) {
        let mut index = self.index.write();
        let mut chunks = self.chunks.write();
        index.build(batch.iter().map(|c| (c.id.as_str(), c.content.as_str())));
        chunks.clear();
        for chunk in batch {
            chunks.insert(chunk.id.clone(), chunk);
        }
    }

    pub fn clear(&self) {
        self.index.write().clear();
        self.chunks.write().clear();
    }

    pub fn doc_count(&self) -> usize {
        self.index.read().doc_count()
    }
}

#[async_trait]
impl Retriever for Bm25Retriever {
    fn name(&self) -> &str {
        "sparse"
    }

    async fn retrieve(
        &self,
        query: &str,
        options: &RetrieveOptions,
    ) -> Result<Vec<RetrievalResult>, RagError> {
        validate_query(query)?;

        let scored = self.index.read().search(query, options.top_k)?;
        let chunks = self.chunks.read();

        Ok(scored
            .into_iter()
            .filter(|(_, score)| options.min_score.map(|m| *score >= m).unwrap_or(true))
            .filter_map(|(id, score)| {
                let chunk = chunks.get(&id)?;
                if let Some(filter) = &options.filter {
                    if !filter.matches(&chunk.metadata) {
                        return None;
                    }
                }
                Some(RetrievalResult::new(chunk.without_embedding(), score))
            })
            .collect())
    }
}
