//! LLM-based reranker. Scores 0–10 per chunk, either with one request per
//! chunk under bounded concurrency or with a single batched prompt that asks
//! for a JSON array of scores. Lenient parsing with padding keeps a sloppy
//! model from sinking the whole rerank.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

use crate::error::RagError;
use crate::provider::{ChatMessage, ChatModelProvider, ChatOptions};
use crate::types::{RerankerResult, RetrievalResult};

use super::{finalize, RerankOptions, Reranker, ScoredItem};

const SNIPPET_CHARS: usize = 600;
const NEUTRAL_SCORE: f32 = 5.0;

#[derive(Debug, Clone)]
pub enum LlmRerankMode {
    /// One scoring request per chunk, at most `concurrency` in flight.
    Individual { concurrency: usize },
    /// One prompt carrying all chunks, expecting an array response.
    Batched,
}

impl Default for LlmRerankMode {
    fn default() -> Self {
        Self::Individual { concurrency: 5 }
    }
}

pub struct LlmReranker {
    model: Arc<dyn ChatModelProvider>,
    mode: LlmRerankMode,
}

impl LlmReranker {
    pub fn new(model: Arc<dyn ChatModelProvider>) -> Self {
        Self {
            model,
            mode: LlmRerankMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: LlmRerankMode) -> Self {
        self.mode = mode;
        self
    }

    async fn score_individually(
        &self,
        query: &str,
        results: &[RetrievalResult],
        concurrency: usize,
    ) -> Result<Vec<f32>, RagError> {
        let mut scores = Vec::with_capacity(results.len());
        for window in results.chunks(concurrency.max(1)) {
            let futures = window.iter().map(|result| {
                let model = self.model.clone();
                let prompt = individual_prompt(query, &result.chunk.content);
                async move {
                    let messages = [ChatMessage::user(prompt)];
                    model.chat(&messages, &ChatOptions::default()).await
                }
            });
            for outcome in join_all(futures).await {
                let score = match outcome {
                    Ok(completion) => parse_single_score(&completion.content),
                    Err(e) => {
                        tracing::warn!(error = %e, "LLM scoring request failed, using neutral score");
                        NEUTRAL_SCORE
                    }
                };
                scores.push(score / 10.0);
            }
        }
        Ok(scores)
    }

    async fn score_batched(
        &self,
        query: &str,
        results: &[RetrievalResult],
    ) -> Result<Vec<f32>, RagError> {
        let prompt = batch_prompt(query, results);
        let messages = [ChatMessage::user(prompt)];
        let completion = self.model.chat(&messages, &ChatOptions::default()).await?;
        Ok(parse_batch_scores(&completion.content, results.len())
            .into_iter()
            .map(|s| s / 10.0)
            .collect())
    }
}

#[async_trait]
impl Reranker for LlmReranker {
    fn name(&self) -> &str {
        "llm"
    }

    async fn rerank(
        &self,
        query: &str,
        results: Vec<RetrievalResult>,
        options: &RerankOptions,
    ) -> Result<Vec<RerankerResult>, RagError> {
        if results.is_empty() {
            return Ok(Vec::new());
        }

        let scores = match &self.mode {
            LlmRerankMode::Individual { concurrency } => {
                self.score_individually(query, &results, *concurrency).await?
            }
            LlmRerankMode::Batched => self.score_batched(query, &results).await?,
        };

        let items: Vec<ScoredItem> = results
            .into_iter()
            .zip(scores)
            .enumerate()
            .map(|(index, (result, score))| ScoredItem {
                original_index: index,
                result,
                score,
                relevance_score: Some(score),
                diversity_penalty: None,
            })
            .collect();

        Ok(finalize(items, options, false))
    }
}

fn snippet(content: &str) -> String {
    content.chars().take(SNIPPET_CHARS).collect()
}

fn individual_prompt(query: &str, content: &str) -> String {
    format!(
        "Rate how relevant the document is to the query on a scale of 0 to 10.\n\
         Query: {}\n\
         Document: {}\n\
         Respond with only the number.",
        query,
        snippet(content)
    )
}

fn batch_prompt(query: &str, results: &[RetrievalResult]) -> String {
    let docs = results
        .iter()
        .enumerate()
        .map(|(i, r)| format!("[{}] {}", i + 1, snippet(&r.chunk.content)))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Rate how relevant each document is to the query on a scale of 0 to 10.\n\
         Query: {}\n\
         Documents:\n{}\n\
         Respond with ONLY a JSON array of {} numbers in document order, e.g. [7, 2, 9].",
        query,
        docs,
        results.len()
    )
}

/// Parse one 0–10 score; unparseable output falls back to neutral.
fn parse_single_score(output: &str) -> f32 {
    extract_numbers(output)
        .first()
        .copied()
        .unwrap_or(NEUTRAL_SCORE)
        .clamp(0.0, 10.0)
}

/// Parse a batch response. Tries a JSON array first, then falls back to
/// extracting numeric tokens; short results are padded with the neutral
/// score so every document gets one.
fn parse_batch_scores(output: &str, expected: usize) -> Vec<f32> {
    let trimmed = output
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let mut scores: Vec<f32> = match serde_json::from_str::<Vec<f32>>(trimmed) {
        Ok(parsed) => parsed,
        Err(_) => {
            // Find the first bracketed array in surrounding prose.
            let from_array = trimmed.find('[').and_then(|start| {
                trimmed[start..]
                    .find(']')
                    .and_then(|end| serde_json::from_str::<Vec<f32>>(&trimmed[start..=start + end]).ok())
            });
            from_array.unwrap_or_else(|| extract_numbers(trimmed))
        }
    };

    scores.truncate(expected);
    while scores.len() < expected {
        scores.push(NEUTRAL_SCORE);
    }
    scores.into_iter().map(|s| s.clamp(0.0, 10.0)).collect()
}

fn extract_numbers(text: &str) -> Vec<f32> {
    let mut numbers = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() || (c == '.' && !current.is_empty() && !current.contains('.')) {
            current.push(c);
        } else if !current.is_empty() {
            if let Ok(n) = current.trim_end_matches('.').parse::<f32>() {
                numbers.push(n);
            }
            current.clear();
        }
    }
    if !current.is_empty() {
        if let Ok(n) = current.trim_end_matches('.').parse::<f32>() {
            numbers.push(n);
        }
    }
    numbers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatCompletion, FinishReason, StreamChunk};
    use crate::types::Chunk;
    use tokio::sync::mpsc;

    /// Scripted model: pops one canned reply per chat call.
    struct ScriptedModel {
        replies: parking_lot::Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<&str>) -> Self {
            Self {
                replies: parking_lot::Mutex::new(
                    replies.into_iter().rev().map(String::from).collect(),
                ),
            }
        }
    }

    #[async_trait]
    impl ChatModelProvider for ScriptedModel {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _options: &ChatOptions,
        ) -> Result<ChatCompletion, RagError> {
            let content = self
                .replies
                .lock()
                .pop()
                .ok_or_else(|| RagError::provider("script exhausted"))?;
            Ok(ChatCompletion {
                content,
                tool_calls: Vec::new(),
                finish_reason: FinishReason::Stop,
                usage: None,
                thinking: None,
                metadata: None,
            })
        }

        async fn stream_chat(
            &self,
            _messages: &[ChatMessage],
            _options: &ChatOptions,
        ) -> Result<mpsc::Receiver<StreamChunk>, RagError> {
            Err(RagError::provider("not scripted"))
        }
    }

    fn result(id: &str) -> RetrievalResult {
        RetrievalResult::new(Chunk::new(id, format!("content {}", id)), 0.5)
    }

    #[tokio::test]
    async fn test_individual_scoring_orders_by_reply() {
        let model = Arc::new(ScriptedModel::new(vec!["3", "9"]));
        let reranker = LlmReranker::new(model)
            .with_mode(LlmRerankMode::Individual { concurrency: 1 });
        let out = reranker
            .rerank("query", vec![result("low"), result("high")], &RerankOptions::default())
            .await
            .expect("rerank");

        assert_eq!(out[0].id, "high");
        assert!((out[0].score - 0.9).abs() < 1e-6);
        assert!((out[1].score - 0.3).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_batched_scoring_parses_array() {
        let model = Arc::new(ScriptedModel::new(vec!["[2, 8, 5]"]));
        let reranker = LlmReranker::new(model).with_mode(LlmRerankMode::Batched);
        let out = reranker
            .rerank(
                "query",
                vec![result("a"), result("b"), result("c")],
                &RerankOptions::default(),
            )
            .await
            .expect("rerank");
        assert_eq!(out[0].id, "b");
        assert!((out[0].score - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_batch_parse_fenced_json() {
        let scores = parse_batch_scores("```json\n[1, 2, 3]\n```", 3);
        assert_eq!(scores, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_batch_parse_prose_fallback() {
        let scores = parse_batch_scores("Scores: 7, then 2, then 10.", 3);
        assert_eq!(scores, vec![7.0, 2.0, 10.0]);
    }

    #[test]
    fn test_batch_parse_pads_short_output() {
        let scores = parse_batch_scores("[9]", 3);
        assert_eq!(scores, vec![9.0, 5.0, 5.0]);
    }

    #[test]
    fn test_batch_parse_clamps_out_of_range() {
        let scores = parse_batch_scores("[42, -3]", 2);
        assert_eq!(scores, vec![10.0, 0.0]);
    }

    #[test]
    fn test_single_parse_garbage_is_neutral() {
        assert_eq!(parse_single_score("no idea"), 5.0);
        assert_eq!(parse_single_score("8.5 out of 10"), 8.5);
    }
}
