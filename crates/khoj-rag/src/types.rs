use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Scalar metadata value attached to a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Str(String),
    Num(f64),
    Bool(bool),
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<f64> for MetadataValue {
    fn from(v: f64) -> Self {
        Self::Num(v)
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        Self::Num(v as f64)
    }
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

pub type Metadata = HashMap<String, MetadataValue>;

/// A retrievable text unit. Immutable once indexed; identity is the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    /// Fixed-length f32 vector. Must match the store dimension on every write.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Chunk {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            metadata: Metadata::new(),
            document_id: None,
            embedding: None,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_document_id(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Copy without the embedding, for results that don't request vectors.
    pub fn without_embedding(&self) -> Self {
        Self {
            embedding: None,
            ..self.clone()
        }
    }
}

/// Per-ranker signal recorded on a fused result. `rank`/`score` are absent
/// when the ranker did not return the chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankerContribution {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    pub contribution: f32,
}

/// Calibrated confidence for one fused result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceScore {
    pub rank_agreement: f32,
    pub score_consistency: f32,
    pub multi_signal_presence: f32,
    pub overall: f32,
}

/// A chunk plus a normalized relevance score in [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub id: String,
    pub chunk: Chunk,
    pub score: f32,
    /// Present on hybrid results only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contributions: Option<Vec<RankerContribution>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<ConfidenceScore>,
}

impl RetrievalResult {
    pub fn new(chunk: Chunk, score: f32) -> Self {
        Self {
            id: chunk.id.clone(),
            chunk,
            score,
            contributions: None,
            confidence: None,
        }
    }
}

/// Score transparency attached to every reranked result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub original_score: f32,
    pub reranker_score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relevance_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diversity_penalty: Option<f32>,
}

/// Retrieval result after reranking. Ranks are 1-indexed: `original_rank` is
/// the position in the reranker input, `new_rank` the position in its output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankerResult {
    pub id: String,
    pub chunk: Chunk,
    pub score: f32,
    pub original_rank: usize,
    pub new_rank: usize,
    pub breakdown: ScoreBreakdown,
}

/// Citation record for one chunk emitted into an assembled context.
/// `index` is the 1-based position in the output and the citation key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSource {
    pub index: usize,
    pub chunk_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    pub relevance: f32,
}

/// Token-budgeted concatenation of selected chunks with source citations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssembledContext {
    pub content: String,
    pub estimated_tokens: usize,
    pub chunk_count: usize,
    pub deduplicated_count: usize,
    pub dropped_count: usize,
    pub sources: Vec<ContextSource>,
}

/// Wall-clock milliseconds spent per pipeline stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageTimings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enhance_ms: Option<u64>,
    pub retrieve_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_ms: Option<u64>,
    pub assemble_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagMetadata {
    pub effective_query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all_queries: Option<Vec<String>>,
    pub retrieved_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reranked_count: Option<usize>,
    pub assembled_count: usize,
    pub deduplicated_count: usize,
    pub dropped_count: usize,
    pub from_cache: bool,
    pub timings: StageTimings,
}

/// The call-boundary shape of one retrieval. Serializes losslessly to JSON
/// for logging and cache storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagResult {
    pub content: String,
    pub estimated_tokens: usize,
    pub sources: Vec<ContextSource>,
    pub assembly: AssembledContext,
    pub retrieval_results: Vec<RetrievalResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reranker_results: Option<Vec<RerankerResult>>,
    pub metadata: RagMetadata,
}

// ==================== Agent trace types ====================

/// One step of a Thought/Action/Observation cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReActStep {
    Thought {
        content: String,
        timestamp: DateTime<Utc>,
    },
    Action {
        tool: String,
        input: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    Observation {
        result: serde_json::Value,
        success: bool,
        #[serde(default)]
        timed_out: bool,
        timestamp: DateTime<Utc>,
    },
}

/// Ordered record of an agent run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReActTrace {
    pub steps: Vec<ReActStep>,
    pub iterations: usize,
    pub total_tokens: usize,
    pub duration_ms: u64,
}

impl ReActTrace {
    pub fn thought(&mut self, content: impl Into<String>) {
        self.steps.push(ReActStep::Thought {
            content: content.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn action(&mut self, tool: impl Into<String>, input: serde_json::Value) {
        self.steps.push(ReActStep::Action {
            tool: tool.into(),
            input,
            timestamp: Utc::now(),
        });
    }

    pub fn observation(&mut self, result: serde_json::Value, success: bool, timed_out: bool) {
        self.steps.push(ReActStep::Observation {
            result,
            success,
            timed_out,
            timestamp: Utc::now(),
        });
    }

    pub fn action_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s, ReActStep::Action { .. }))
            .count()
    }

    pub fn observation_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s, ReActStep::Observation { .. }))
            .count()
    }
}
