//! Dense retriever: embed the query, search the vector store.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::RagError;
use crate::provider::EmbeddingProvider;
use crate::store::{SearchOptions, VectorStore};
use crate::types::RetrievalResult;

use super::{validate_query, RetrieveOptions, Retriever};

pub struct DenseRetriever {
    embeddings: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
}

impl DenseRetriever {
    pub fn new(embeddings: Arc<dyn EmbeddingProvider>, store: Arc<dyn VectorStore>) -> Self {
        Self { embeddings, store }
    }
}

#[async_trait]
impl Retriever for DenseRetriever {
    fn name(&self) -> &str {
        "dense"
    }

    async fn retrieve(
        &self,
        query: &str,
        options: &RetrieveOptions,
    ) -> Result<Vec<RetrievalResult>, RagError> {
        validate_query(query)?;

        let embedded = self.embeddings.embed(query).await?;
        let search_options = SearchOptions {
            top_k: options.top_k,
            min_score: options.min_score,
            filter: options.filter.clone(),
            ..SearchOptions::default()
        };
        self.store.search(&embedded.embedding, &search_options).await
    }
}
