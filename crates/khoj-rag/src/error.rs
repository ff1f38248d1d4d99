//! Error taxonomy for the retrieval pipeline and agent loop.
//!
//! One hierarchy, tagged variants. Every variant carries a stable
//! machine-readable code (see [`RagError::code`]) so retry policies and
//! structured logs can match on it without parsing display strings.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RagError {
    #[error("vector dimension {got} does not match store dimension {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid metadata filter: {0}")]
    InvalidFilter(String),

    #[error("keyword index has not been built")]
    IndexNotBuilt,

    #[error("query enhancement failed: {source}")]
    EnhancementFailed {
        #[source]
        source: Box<RagError>,
    },

    #[error("retrieval failed: {source}")]
    RetrievalFailed {
        #[source]
        source: Box<RagError>,
    },

    #[error("reranking failed: {source}")]
    RerankingFailed {
        #[source]
        source: Box<RagError>,
    },

    #[error("context assembly failed: {source}")]
    AssemblyFailed {
        #[source]
        source: Box<RagError>,
    },

    /// Non-fatal by policy: the engine logs these and continues.
    #[error("cache operation failed: {0}")]
    CacheError(String),

    #[error("operation failed after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<RagError>,
    },

    #[error("circuit breaker is open ({remaining_ms} ms until half-open)")]
    CircuitOpen { remaining_ms: u64 },

    #[error("operation aborted")]
    Aborted,

    #[error("tool '{0}' not found")]
    ToolNotFound(String),

    #[error("tool '{name}' timed out after {timeout_ms} ms")]
    ToolTimeout { name: String, timeout_ms: u64 },

    #[error("schema validation failed: {0}")]
    ValidationError(String),

    #[error("agent error: {0}")]
    AgentError(String),

    #[error("provider error: {message}")]
    ProviderError { message: String, retryable: bool },

    #[error("invalid configuration: {0}")]
    ConfigError(String),
}

impl RagError {
    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DimensionMismatch { .. } => "DIMENSION_MISMATCH",
            Self::InvalidQuery(_) => "INVALID_QUERY",
            Self::InvalidFilter(_) => "INVALID_FILTER",
            Self::IndexNotBuilt => "INDEX_NOT_BUILT",
            Self::EnhancementFailed { .. } => "ENHANCEMENT_FAILED",
            Self::RetrievalFailed { .. } => "RETRIEVAL_FAILED",
            Self::RerankingFailed { .. } => "RERANKING_FAILED",
            Self::AssemblyFailed { .. } => "ASSEMBLY_FAILED",
            Self::CacheError(_) => "CACHE_ERROR",
            Self::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::Aborted => "ABORTED",
            Self::ToolNotFound(_) => "TOOL_NOT_FOUND",
            Self::ToolTimeout { .. } => "TOOL_TIMEOUT",
            Self::ValidationError(_) => "VALIDATION_ERROR",
            Self::AgentError(_) => "AGENT_ERROR",
            Self::ProviderError { .. } => "PROVIDER_ERROR",
            Self::ConfigError(_) => "CONFIG_ERROR",
        }
    }

    /// Wrap an arbitrary provider failure. Retryable by default; providers
    /// that know better construct the variant directly.
    pub fn provider(message: impl Into<String>) -> Self {
        Self::ProviderError {
            message: message.into(),
            retryable: true,
        }
    }

    /// Whether the default retry policy considers this error transient.
    /// Cancellation and caller mistakes are never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ProviderError { retryable, .. } => *retryable,
            Self::CacheError(_) => true,
            Self::Aborted
            | Self::CircuitOpen { .. }
            | Self::DimensionMismatch { .. }
            | Self::InvalidQuery(_)
            | Self::InvalidFilter(_)
            | Self::IndexNotBuilt
            | Self::ValidationError(_)
            | Self::ConfigError(_)
            | Self::ToolTimeout { .. } => false,
            _ => false,
        }
    }
}

pub type Result<T, E = RagError> = std::result::Result<T, E>;
