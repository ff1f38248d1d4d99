//! khoj-rag: a hybrid retrieval-augmented generation runtime.
//!
//! Two coupled subsystems: a retrieval core (HNSW + BM25 indexes, RRF
//! fusion, reranking, token-budgeted context assembly, result caching) and
//! an agent core (a bounded ReAct loop with tool dispatch, conversation
//! windowing, and retry/circuit-breaker recovery around remote model calls).
//! Model back-ends, document loaders, and chunkers stay behind narrow
//! provider traits.

pub mod agent;
pub mod assembly;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod provider;
pub mod recovery;
pub mod rerank;
pub mod retrieval;
pub mod store;
pub mod types;
pub mod util;

// Re-export primary types for convenience
pub use cancel::CancelToken;
pub use config::RagConfig;
pub use engine::{RagEngine, RagQueryOptions};
pub use error::RagError;
pub use types::{
    AssembledContext, Chunk, ContextSource, Metadata, MetadataValue, RagResult, ReActStep,
    ReActTrace, RerankerResult, RetrievalResult,
};

pub use agent::{Agent, AgentOptions, AgentRunResult, StreamEvent, ToolRegistry};
pub use assembly::{AssemblyOptions, ContextAssembler, RankedChunk};
pub use cache::{
    CacheProvider, CacheStats, CachedEmbeddingProvider, LruCacheProvider, PersistedCacheEntry,
};
pub use index::{Bm25Index, Bm25Params, DistanceMetric, HnswIndex, HnswParams};
pub use recovery::{
    BreakerConfig, BreakerRegistry, CircuitBreaker, CircuitState, ErrorRecovery, RecoveryOutcome,
    RetryPolicy, RetryStrategy,
};
pub use rerank::{
    CrossEncoderReranker, LlmRerankMode, LlmReranker, MmrReranker, PositionBias, RerankOptions,
    Reranker,
};
pub use retrieval::{Bm25Retriever, DenseRetriever, HybridRetriever, RetrieveOptions, Retriever};
pub use store::{
    HnswVectorStore, InMemoryVectorStore, MetadataFilter, SearchOptions, VectorStore,
};
