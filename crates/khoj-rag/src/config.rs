use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::RagError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RagConfig {
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub fusion: FusionConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub assembly: AssemblyConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub min_score: f32,
    /// HNSW graph parameters.
    pub hnsw_m: usize,
    pub hnsw_ef_construction: usize,
    pub hnsw_ef_search: usize,
    /// BM25 parameters.
    pub bm25_k1: f32,
    pub bm25_b: f32,
    pub bm25_min_doc_freq: usize,
    pub bm25_max_doc_freq_ratio: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            min_score: 0.0,
            hnsw_m: 16,
            hnsw_ef_construction: 200,
            hnsw_ef_search: 100,
            bm25_k1: 1.2,
            bm25_b: 0.75,
            bm25_min_doc_freq: 1,
            bm25_max_doc_freq_ratio: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
    /// RRF rank constant.
    pub rrf_k: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self { rrf_k: 60 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankConfig {
    pub top_k: Option<usize>,
    pub min_score: Option<f32>,
    /// MMR relevance/diversity balance.
    pub mmr_lambda: f32,
    /// In-flight request bound for the individual LLM scorer.
    pub llm_concurrency: usize,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            top_k: None,
            min_score: None,
            mmr_lambda: 0.5,
            llm_concurrency: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyConfig {
    pub max_tokens: Option<usize>,
    pub ordering: crate::rerank::PositionBias,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            max_tokens: Some(4096),
            ordering: crate::rerank::PositionBias::Relevance,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_size: usize,
    pub ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 1000,
            // 5 minutes
            ttl_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub half_open_requests: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: true,
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            half_open_requests: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub max_iterations: usize,
    pub tool_timeout_ms: u64,
    pub max_context_tokens: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            tool_timeout_ms: 30_000,
            max_context_tokens: 8192,
        }
    }
}

impl RagConfig {
    /// Validate config values, rejecting clearly broken configurations.
    pub fn validate(&self) -> Result<(), RagError> {
        if self.retrieval.top_k == 0 {
            return Err(RagError::ConfigError("retrieval.top_k must be > 0".into()));
        }
        if self.retrieval.hnsw_m == 0 {
            return Err(RagError::ConfigError("retrieval.hnsw_m must be > 0".into()));
        }
        if self.retrieval.bm25_k1 < 0.0 {
            return Err(RagError::ConfigError("retrieval.bm25_k1 must be >= 0".into()));
        }
        if !(0.0..=1.0).contains(&self.retrieval.bm25_b) {
            return Err(RagError::ConfigError("retrieval.bm25_b must be in [0, 1]".into()));
        }
        if !(0.0..=1.0).contains(&self.rerank.mmr_lambda) {
            return Err(RagError::ConfigError("rerank.mmr_lambda must be in [0, 1]".into()));
        }
        if self.rerank.llm_concurrency == 0 {
            return Err(RagError::ConfigError("rerank.llm_concurrency must be > 0".into()));
        }
        if self.fusion.rrf_k == 0 {
            return Err(RagError::ConfigError("fusion.rrf_k must be > 0".into()));
        }
        if self.cache.enabled && self.cache.max_size == 0 {
            return Err(RagError::ConfigError("cache.max_size must be > 0 when enabled".into()));
        }
        if self.recovery.backoff_multiplier < 1.0 {
            return Err(RagError::ConfigError(
                "recovery.backoff_multiplier must be >= 1".into(),
            ));
        }
        if self.recovery.failure_threshold == 0 {
            return Err(RagError::ConfigError(
                "recovery.failure_threshold must be > 0".into(),
            ));
        }
        if self.agent.max_iterations == 0 {
            return Err(RagError::ConfigError("agent.max_iterations must be > 0".into()));
        }
        Ok(())
    }

    /// Load config from a JSON file, falling back to defaults for missing fields.
    pub fn from_file(path: &Path) -> Result<Self, RagError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RagError::ConfigError(format!("failed to read config file: {}", e)))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| RagError::ConfigError(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(RagConfig::default().validate().is_ok());
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = RagConfig::default();
        assert_eq!(config.retrieval.hnsw_m, 16);
        assert_eq!(config.retrieval.hnsw_ef_construction, 200);
        assert_eq!(config.retrieval.hnsw_ef_search, 100);
        assert_eq!(config.fusion.rrf_k, 60);
        assert_eq!(config.rerank.llm_concurrency, 5);
        assert_eq!(config.cache.ttl_ms, 300_000);
        assert_eq!(config.recovery.failure_threshold, 5);
        assert_eq!(config.agent.max_iterations, 10);
        assert_eq!(config.agent.tool_timeout_ms, 30_000);
    }

    #[test]
    fn test_bad_bm25_b_rejected() {
        let mut config = RagConfig::default();
        config.retrieval.bm25_b = 1.5;
        assert!(matches!(config.validate(), Err(RagError::ConfigError(_))));
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let config: RagConfig =
            serde_json::from_str(r#"{"fusion": {"rrf_k": 30}}"#).expect("parse");
        assert_eq!(config.fusion.rrf_k, 30);
        assert_eq!(config.retrieval.top_k, 10);
    }
}
