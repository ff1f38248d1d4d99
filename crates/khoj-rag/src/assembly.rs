//! Context assembler: deduplicate, order, enforce the token budget, and
//! format selected chunks with 1-based citation indices.

use std::collections::HashSet;

use crate::rerank::{apply_position_bias, PositionBias};
use crate::types::{AssembledContext, Chunk, ContextSource, RerankerResult, RetrievalResult};
use crate::util::{self, TokenCounter};

/// One assembler input row: a chunk with the relevance the upstream stage
/// assigned it. Built from retrieval or rerank output.
#[derive(Debug, Clone)]
pub struct RankedChunk {
    pub chunk: Chunk,
    pub relevance: f32,
}

impl From<RetrievalResult> for RankedChunk {
    fn from(result: RetrievalResult) -> Self {
        Self {
            chunk: result.chunk,
            relevance: result.score,
        }
    }
}

impl From<RerankerResult> for RankedChunk {
    fn from(result: RerankerResult) -> Self {
        Self {
            chunk: result.chunk,
            relevance: result.score,
        }
    }
}

#[derive(Clone)]
pub struct AssemblyOptions {
    pub max_tokens: Option<usize>,
    pub ordering: PositionBias,
    /// Head-block size for the sandwich orderings.
    pub start_count: usize,
    /// External tokenizer; the char-based estimator is the fallback.
    pub token_counter: Option<TokenCounter>,
}

impl Default for AssemblyOptions {
    fn default() -> Self {
        Self {
            max_tokens: None,
            ordering: PositionBias::Relevance,
            start_count: 3,
            token_counter: None,
        }
    }
}

impl std::fmt::Debug for AssemblyOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssemblyOptions")
            .field("max_tokens", &self.max_tokens)
            .field("ordering", &self.ordering)
            .field("start_count", &self.start_count)
            .field("token_counter", &self.token_counter.is_some())
            .finish()
    }
}

pub struct ContextAssembler;

impl ContextAssembler {
    /// Assemble a bounded context from ranked chunks.
    ///
    /// Chunks that would overflow the budget are skipped, not terminal: the
    /// walk continues so smaller chunks further down can still fit.
    pub fn assemble(items: Vec<RankedChunk>, options: &AssemblyOptions) -> AssembledContext {
        // Dedup by chunk id, keeping the higher-ranked occurrence.
        let mut seen = HashSet::new();
        let before = items.len();
        let unique: Vec<RankedChunk> = items
            .into_iter()
            .filter(|item| seen.insert(item.chunk.id.clone()))
            .collect();
        let deduplicated_count = before - unique.len();

        let ordered = apply_position_bias(
            unique,
            options.ordering,
            options.start_count.max(1),
        );

        let count_tokens = |text: &str| -> usize {
            match &options.token_counter {
                Some(counter) => counter(text),
                None => util::estimate_tokens(text),
            }
        };

        let mut content = String::new();
        let mut sources = Vec::new();
        let mut estimated_tokens = 0usize;
        let mut dropped_count = 0usize;

        for item in ordered {
            let cost = count_tokens(&item.chunk.content);
            if let Some(budget) = options.max_tokens {
                if estimated_tokens + cost > budget {
                    dropped_count += 1;
                    continue;
                }
            }

            let index = sources.len() + 1;
            if !content.is_empty() {
                content.push_str("\n\n");
            }
            content.push_str(&format!("[{}] {}", index, item.chunk.content));
            estimated_tokens += cost;
            sources.push(ContextSource {
                index,
                chunk_id: item.chunk.id.clone(),
                document_id: item.chunk.document_id.clone(),
                relevance: item.relevance,
            });
        }

        tracing::debug!(
            emitted = sources.len(),
            deduplicated = deduplicated_count,
            dropped = dropped_count,
            tokens = estimated_tokens,
            "context assembled"
        );

        AssembledContext {
            content,
            estimated_tokens,
            chunk_count: sources.len(),
            deduplicated_count,
            dropped_count,
            sources,
        }
    }
}
