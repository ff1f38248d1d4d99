//! RAG engine: coordinates enhance → retrieve → rerank → assemble with
//! cancellation checks at every stage, per-stage timings, and a TTL-bearing
//! result cache keyed by query plus the output-affecting options.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::time::Instant;

use crate::assembly::{AssemblyOptions, ContextAssembler, RankedChunk};
use crate::cache::CacheProvider;
use crate::cancel::CancelToken;
use crate::config::RagConfig;
use crate::error::RagError;
use crate::provider::QueryEnhancer;
use crate::rerank::{PositionBias, RerankOptions, Reranker};
use crate::retrieval::{RetrieveOptions, Retriever};
use crate::store::MetadataFilter;
use crate::types::{RagMetadata, RagResult, RetrievalResult, StageTimings};
use crate::util::{self, TokenCounter};

#[derive(Clone)]
pub struct RagQueryOptions {
    pub top_k: usize,
    pub min_score: Option<f32>,
    pub filter: Option<MetadataFilter>,
    pub enhance: bool,
    pub rerank: bool,
    pub ordering: PositionBias,
    pub max_tokens: Option<usize>,
    pub cancel: CancelToken,
}

impl Default for RagQueryOptions {
    fn default() -> Self {
        Self {
            top_k: 10,
            min_score: None,
            filter: None,
            enhance: true,
            rerank: true,
            ordering: PositionBias::Relevance,
            max_tokens: Some(4096),
            cancel: CancelToken::new(),
        }
    }
}

pub struct RagEngine {
    retriever: Arc<dyn Retriever>,
    reranker: Option<Arc<dyn Reranker>>,
    enhancer: Option<Arc<dyn QueryEnhancer>>,
    cache: Option<Arc<dyn CacheProvider<RagResult>>>,
    token_counter: Option<TokenCounter>,
    config: RagConfig,
}

impl RagEngine {
    pub fn new(retriever: Arc<dyn Retriever>, config: RagConfig) -> Result<Self, RagError> {
        config.validate()?;
        Ok(Self {
            retriever,
            reranker: None,
            enhancer: None,
            cache: None,
            token_counter: None,
            config,
        })
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn with_enhancer(mut self, enhancer: Arc<dyn QueryEnhancer>) -> Self {
        self.enhancer = Some(enhancer);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheProvider<RagResult>>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_token_counter(mut self, counter: TokenCounter) -> Self {
        self.token_counter = Some(counter);
        self
    }

    /// Pre-load warm-up-capable components (e.g. the cross-encoder model).
    pub async fn warm_up(&self) -> Result<(), RagError> {
        if let Some(reranker) = &self.reranker {
            reranker.warm_up().await?;
        }
        Ok(())
    }

    /// Cache key over the query and every option that affects the output.
    fn cache_key(&self, query: &str, options: &RagQueryOptions) -> String {
        let canonical = format!(
            "{}|k={}|ms={:?}|f={:?}|enh={}|rr={}|ord={:?}|mt={:?}|rrfk={}",
            query,
            options.top_k,
            options.min_score,
            options.filter.as_ref().map(|f| f.canonical()),
            options.enhance && self.enhancer.is_some(),
            options.rerank && self.reranker.is_some(),
            options.ordering,
            options.max_tokens,
            self.config.fusion.rrf_k,
        );
        format!("rag:{:016x}", util::djb2(&canonical))
    }

    /// Retrieve for every query variant concurrently, merging by id and
    /// keeping the highest score per chunk.
    async fn retrieve_multi(
        &self,
        queries: &[String],
        options: &RagQueryOptions,
    ) -> Result<Vec<RetrievalResult>, RagError> {
        let retrieve_options = RetrieveOptions {
            top_k: options.top_k,
            min_score: options.min_score,
            filter: options.filter.clone(),
        };

        let futures = queries.iter().map(|query| {
            let retriever = self.retriever.clone();
            let query = query.clone();
            let retrieve_options = retrieve_options.clone();
            async move { retriever.retrieve(&query, &retrieve_options).await }
        });

        let mut merged: HashMap<String, RetrievalResult> = HashMap::new();
        let mut last_error = None;
        let mut any_succeeded = false;
        for outcome in join_all(futures).await {
            match outcome {
                Ok(results) => {
                    any_succeeded = true;
                    for result in results {
                        match merged.get_mut(&result.id) {
                            Some(existing) if existing.score >= result.score => {}
                            _ => {
                                merged.insert(result.id.clone(), result);
                            }
                        }
                    }
                }
                Err(e) => last_error = Some(e),
            }
        }

        if !any_succeeded {
            return Err(match last_error {
                Some(RagError::RetrievalFailed { source }) => RagError::RetrievalFailed { source },
                Some(other) => RagError::RetrievalFailed {
                    source: Box::new(other),
                },
                None => RagError::InvalidQuery("no queries to retrieve".into()),
            });
        }

        let mut results: Vec<RetrievalResult> = merged.into_values().collect();
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        results.truncate(options.top_k);
        Ok(results)
    }

    pub async fn query(
        &self,
        query: &str,
        options: &RagQueryOptions,
    ) -> Result<RagResult, RagError> {
        if query.trim().is_empty() {
            return Err(RagError::InvalidQuery("query is empty".into()));
        }

        let key = self.cache_key(query, options);
        if let Some(cache) = &self.cache {
            match cache.get(&key).await {
                Ok(Some(mut hit)) => {
                    hit.metadata.from_cache = true;
                    tracing::debug!(key = %key, "rag cache hit");
                    return Ok(hit);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "rag cache read failed, continuing"),
            }
        }

        let total_start = Instant::now();
        let mut timings = StageTimings::default();

        // Enhancement.
        let (effective_query, all_queries) = match &self.enhancer {
            Some(enhancer) if options.enhance => {
                options.cancel.check()?;
                let stage = Instant::now();
                let enhanced = enhancer.enhance(query).await.map_err(|e| {
                    RagError::EnhancementFailed {
                        source: Box::new(e),
                    }
                })?;
                timings.enhance_ms = Some(stage.elapsed().as_millis() as u64);
                let mut queries = vec![enhanced.query.clone()];
                for alternate in enhanced.alternates {
                    if !queries.contains(&alternate) {
                        queries.push(alternate);
                    }
                }
                (enhanced.query, queries)
            }
            _ => (query.to_string(), vec![query.to_string()]),
        };

        // Retrieval, fanned out across query variants.
        options.cancel.check()?;
        let stage = Instant::now();
        let retrieval_results = self.retrieve_multi(&all_queries, options).await?;
        timings.retrieve_ms = stage.elapsed().as_millis() as u64;
        let retrieved_count = retrieval_results.len();

        // Reranking.
        let mut reranker_results = None;
        if options.rerank && !retrieval_results.is_empty() {
            if let Some(reranker) = &self.reranker {
                options.cancel.check()?;
                let stage = Instant::now();
                let rerank_options = RerankOptions {
                    top_k: Some(options.top_k),
                    min_score: self.config.rerank.min_score,
                    // Ordering is the assembler's concern; keep ranks here.
                    position_bias: PositionBias::Relevance,
                    start_count: 3,
                };
                let reranked = reranker
                    .rerank(&effective_query, retrieval_results.clone(), &rerank_options)
                    .await
                    .map_err(|e| match e {
                        already @ RagError::RerankingFailed { .. } => already,
                        other => RagError::RerankingFailed {
                            source: Box::new(other),
                        },
                    })?;
                timings.rerank_ms = Some(stage.elapsed().as_millis() as u64);
                reranker_results = Some(reranked);
            }
        }

        // Assembly.
        options.cancel.check()?;
        let stage = Instant::now();
        let ranked: Vec<RankedChunk> = match &reranker_results {
            Some(reranked) => reranked.iter().cloned().map(RankedChunk::from).collect(),
            None => retrieval_results.iter().cloned().map(RankedChunk::from).collect(),
        };
        let assembly_options = AssemblyOptions {
            max_tokens: options.max_tokens,
            ordering: options.ordering,
            start_count: 3,
            token_counter: self.token_counter.clone(),
        };
        let assembly = ContextAssembler::assemble(ranked, &assembly_options);
        timings.assemble_ms = stage.elapsed().as_millis() as u64;
        timings.total_ms = total_start.elapsed().as_millis() as u64;

        let result = RagResult {
            content: assembly.content.clone(),
            estimated_tokens: assembly.estimated_tokens,
            sources: assembly.sources.clone(),
            metadata: RagMetadata {
                effective_query: effective_query.clone(),
                all_queries: if all_queries.len() > 1 {
                    Some(all_queries)
                } else {
                    None
                },
                retrieved_count,
                reranked_count: reranker_results.as_ref().map(|r| r.len()),
                assembled_count: assembly.chunk_count,
                deduplicated_count: assembly.deduplicated_count,
                dropped_count: assembly.dropped_count,
                from_cache: false,
                timings,
            },
            assembly,
            retrieval_results,
            reranker_results,
        };

        if let Some(cache) = &self.cache {
            if let Err(e) = cache
                .set(key, result.clone(), Some(self.config.cache.ttl_ms))
                .await
            {
                tracing::warn!(error = %e, "rag cache write failed, continuing");
            }
        }

        tracing::info!(
            query = %effective_query,
            retrieved = retrieved_count,
            assembled = result.metadata.assembled_count,
            total_ms = result.metadata.timings.total_ms,
            "rag query complete"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LruCacheProvider;
    use crate::provider::EnhancedQuery;
    use crate::types::Chunk;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FixedRetriever {
        calls: AtomicU32,
    }

    impl FixedRetriever {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Retriever for FixedRetriever {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn retrieve(
            &self,
            query: &str,
            _options: &RetrieveOptions,
        ) -> Result<Vec<RetrievalResult>, RagError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![
                RetrievalResult::new(
                    Chunk::new(format!("{}-1", query), format!("first result for {}", query)),
                    0.9,
                ),
                RetrievalResult::new(
                    Chunk::new("shared", "shared chunk across queries"),
                    if query.contains("alt") { 0.8 } else { 0.4 },
                ),
            ])
        }
    }

    struct AppendEnhancer;

    #[async_trait]
    impl QueryEnhancer for AppendEnhancer {
        async fn enhance(&self, query: &str) -> Result<EnhancedQuery, RagError> {
            Ok(EnhancedQuery {
                query: format!("{} enhanced", query),
                alternates: vec![format!("{} alt", query)],
            })
        }
    }

    fn engine(retriever: Arc<FixedRetriever>) -> RagEngine {
        RagEngine::new(retriever, RagConfig::default()).expect("engine")
    }

    fn no_enhance() -> RagQueryOptions {
        RagQueryOptions {
            enhance: false,
            rerank: false,
            ..RagQueryOptions::default()
        }
    }

    #[tokio::test]
    async fn test_basic_query_assembles_context() {
        let engine = engine(Arc::new(FixedRetriever::new()));
        let result = engine.query("rust", &no_enhance()).await.expect("query");

        assert_eq!(result.metadata.retrieved_count, 2);
        assert_eq!(result.metadata.assembled_count, 2);
        assert!(!result.metadata.from_cache);
        assert!(result.content.contains("[1]"));
        assert_eq!(result.sources.len(), 2);
        assert!(result.metadata.reranked_count.is_none());
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let engine = engine(Arc::new(FixedRetriever::new()));
        let err = engine.query("  ", &no_enhance()).await.unwrap_err();
        assert!(matches!(err, RagError::InvalidQuery(_)));
    }

    #[tokio::test]
    async fn test_cache_hit_round_trip() {
        let retriever = Arc::new(FixedRetriever::new());
        let cache: Arc<dyn CacheProvider<RagResult>> = Arc::new(LruCacheProvider::new(16));
        let engine = engine(retriever.clone()).with_cache(cache);

        let first = engine.query("rust", &no_enhance()).await.expect("query");
        assert!(!first.metadata.from_cache);
        let second = engine.query("rust", &no_enhance()).await.expect("query");
        assert!(second.metadata.from_cache);
        assert_eq!(second.content, first.content);
        // The pipeline only ran once.
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_key_varies_with_options() {
        let retriever = Arc::new(FixedRetriever::new());
        let cache: Arc<dyn CacheProvider<RagResult>> = Arc::new(LruCacheProvider::new(16));
        let engine = engine(retriever.clone()).with_cache(cache);

        engine.query("rust", &no_enhance()).await.expect("query");
        let mut other = no_enhance();
        other.top_k = 1;
        let result = engine.query("rust", &other).await.expect("query");
        assert!(!result.metadata.from_cache);
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_failures_are_non_fatal() {
        struct BrokenCache;

        #[async_trait]
        impl CacheProvider<RagResult> for BrokenCache {
            async fn get(&self, _key: &str) -> Result<Option<RagResult>, RagError> {
                Err(RagError::CacheError("backend offline".into()))
            }

            async fn set(
                &self,
                _key: String,
                _value: RagResult,
                _ttl_ms: Option<u64>,
            ) -> Result<(), RagError> {
                Err(RagError::CacheError("backend offline".into()))
            }

            async fn remove(&self, _key: &str) -> Result<bool, RagError> {
                Err(RagError::CacheError("backend offline".into()))
            }

            async fn clear(&self) -> Result<(), RagError> {
                Err(RagError::CacheError("backend offline".into()))
            }

            async fn len(&self) -> usize {
                0
            }

            fn stats(&self) -> crate::cache::CacheStats {
                crate::cache::CacheStats::default()
            }
        }

        let engine = engine(Arc::new(FixedRetriever::new())).with_cache(Arc::new(BrokenCache));
        let result = engine.query("rust", &no_enhance()).await.expect("query");
        assert_eq!(result.metadata.retrieved_count, 2);
    }

    #[tokio::test]
    async fn test_enhancement_fans_out_and_merges_by_max_score() {
        let retriever = Arc::new(FixedRetriever::new());
        let engine = engine(retriever.clone()).with_enhancer(Arc::new(AppendEnhancer));
        let options = RagQueryOptions {
            rerank: false,
            ..RagQueryOptions::default()
        };

        let result = engine.query("rust", &options).await.expect("query");

        assert_eq!(result.metadata.effective_query, "rust enhanced");
        let all_queries = result.metadata.all_queries.as_ref().expect("alternates");
        assert_eq!(all_queries.len(), 2);
        // Both variants retrieved concurrently.
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 2);

        // "shared" appears in both result sets; the higher score (0.8 from
        // the alt query) wins the merge.
        let shared = result
            .retrieval_results
            .iter()
            .find(|r| r.id == "shared")
            .expect("shared");
        assert!((shared.score - 0.8).abs() < 1e-6);
        assert!(result.metadata.timings.enhance_ms.is_some());
    }

    #[tokio::test]
    async fn test_cancellation_checked_at_stage_entry() {
        let engine = engine(Arc::new(FixedRetriever::new()));
        let options = RagQueryOptions {
            cancel: CancelToken::new(),
            ..no_enhance()
        };
        options.cancel.cancel();

        let err = engine.query("rust", &options).await.unwrap_err();
        assert!(matches!(err, RagError::Aborted));
    }

    #[tokio::test]
    async fn test_enhancer_error_wrapped() {
        struct FailingEnhancer;

        #[async_trait]
        impl QueryEnhancer for FailingEnhancer {
            async fn enhance(&self, _query: &str) -> Result<EnhancedQuery, RagError> {
                Err(RagError::provider("llm down"))
            }
        }

        let engine = engine(Arc::new(FixedRetriever::new())).with_enhancer(Arc::new(FailingEnhancer));
        let options = RagQueryOptions {
            rerank: false,
            ..RagQueryOptions::default()
        };
        let err = engine.query("rust", &options).await.unwrap_err();
        assert!(matches!(err, RagError::EnhancementFailed { .. }));
    }

    #[tokio::test]
    async fn test_end_to_end_hybrid_pipeline() {
        use crate::index::Bm25Params;
        use crate::provider::{Embedding, EmbeddingProvider};
        use crate::retrieval::{Bm25Retriever, DenseRetriever, HybridRetriever};
        use crate::store::{InMemoryVectorStore, VectorStore};

        /// Bag-of-letters embedding: deterministic and similarity-preserving
        /// enough for a smoke pipeline.
        struct LetterEmbeddings;

        #[async_trait]
        impl EmbeddingProvider for LetterEmbeddings {
            async fn embed(&self, text: &str) -> Result<Embedding, RagError> {
                let mut v = vec![0.0f32; 26];
                for c in text.to_lowercase().chars() {
                    if c.is_ascii_lowercase() {
                        v[(c as u8 - b'a') as usize] += 1.0;
                    }
                }
                Ok(Embedding {
                    embedding: crate::util::normalize(&v),
                    token_count: None,
                    model: "letters".into(),
                })
            }

            fn dimensions(&self) -> usize {
                26
            }
        }

        let embeddings = Arc::new(LetterEmbeddings);
        let store = Arc::new(InMemoryVectorStore::new(26));
        let corpus = [
            ("pg", "postgres is a relational database"),
            ("my", "mysql is a relational database"),
            ("wx", "the weather is nice today"),
        ];
        let mut chunks = Vec::new();
        for (id, text) in corpus {
            let embedded = embeddings.embed(text).await.expect("embed");
            chunks.push(Chunk::new(id, text).with_embedding(embedded.embedding));
        }
        store.insert(chunks.clone()).await.expect("insert");

        let sparse = Bm25Retriever::new(Bm25Params::default()).expect("sparse");
        sparse.build(chunks.iter().map(|c| c.without_embedding()).collect());

        let hybrid = Arc::new(HybridRetriever::new(vec![
            Arc::new(DenseRetriever::new(embeddings.clone(), store)) as Arc<dyn Retriever>,
            Arc::new(sparse),
        ]));

        let engine = RagEngine::new(hybrid, RagConfig::default())
            .expect("engine")
            .with_reranker(Arc::new(crate::rerank::MmrReranker::new(embeddings)));

        let options = RagQueryOptions {
            enhance: false,
            ..RagQueryOptions::default()
        };
        let result = engine.query("postgres database", &options).await.expect("query");

        assert!(result.metadata.retrieved_count >= 2);
        assert_eq!(result.metadata.reranked_count, Some(result.metadata.retrieved_count));
        // The postgres chunk must head the assembled context.
        assert_eq!(result.sources[0].chunk_id, "pg");
        assert!(result.content.starts_with("[1] postgres"));
        // Contributions from both rankers survive fusion.
        let pg = result
            .retrieval_results
            .iter()
            .find(|r| r.id == "pg")
            .expect("pg");
        assert_eq!(pg.contributions.as_ref().expect("contributions").len(), 2);
        assert!(pg.confidence.as_ref().expect("confidence").overall > 0.5);
    }

    #[tokio::test]
    async fn test_timings_recorded() {
        let engine = engine(Arc::new(FixedRetriever::new()));
        let result = engine.query("rust", &no_enhance()).await.expect("query");
        let timings = &result.metadata.timings;
        assert!(timings.enhance_ms.is_none());
        assert!(timings.total_ms >= timings.retrieve_ms + timings.assemble_ms);
    }
}
