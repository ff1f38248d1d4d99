//! External collaborator interfaces: chat models, embeddings, cross-encoder
//! scoring, and query enhancement. Everything behind these traits is an I/O
//! suspension point; the pipeline never assumes a concrete back-end.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use crate::error::RagError;

// ==================== Chat wire types ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// Message content: plain text or a list of typed parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Flatten to text for token counting and prompt assembly.
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text { text: String },
    Image { media_type: String, data: String },
    Document { media_type: String, data: String },
}

/// A chat message with role, content, and optional tool-call metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Option<MessageContent>,
    /// Tool calls requested by the assistant (role = Assistant only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Id of the tool call this message answers (role = Tool only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(ChatRole::Assistant, content)
    }

    fn text(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(MessageContent::Text(content.into())),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant_tool_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.map(MessageContent::Text),
            tool_calls: Some(tool_calls),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: ChatRole::Tool,
            content: Some(MessageContent::Text(content.into())),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
        }
    }

    pub fn content_text(&self) -> String {
        self.content.as_ref().map(|c| c.as_text()).unwrap_or_default()
    }
}

/// A complete tool call emitted by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON arguments string, exactly as emitted.
    pub arguments: String,
}

/// Schema describing a tool the model can call. Passed to the back-end
/// verbatim; `parameters` is a JSON-Schema object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// A chat completion from the model back-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
}

/// Partial tool call carried by one stream chunk. A new `id` starts a
/// pending entry; `name` sets the entry's name; `arguments` appends to its
/// buffer. See `agent::aggregator` for assembly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallFragment {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// Ordered chunks produced by a streaming chat completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    Text { delta: String },
    Thinking { delta: String },
    ToolCall { fragment: ToolCallFragment },
    Usage { usage: TokenUsage },
    Done { finish_reason: FinishReason },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThinkingOptions {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u32>,
}

/// Options recognized by chat back-ends. Every field is optional; back-ends
/// ignore what they don't support.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSchema>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingOptions>,
}

// ==================== Capability traits ====================

/// Result of embedding one text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub embedding: Vec<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u32>,
    pub model: String,
}

/// Embedding back-end. Output vectors must be unit-normalized when the
/// downstream index uses cosine distance.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Embedding, RagError>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, RagError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    fn dimensions(&self) -> usize;

    fn max_batch_size(&self) -> usize {
        32
    }

    async fn is_available(&self) -> bool {
        true
    }
}

/// Chat model back-end.
#[async_trait]
pub trait ChatModelProvider: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatCompletion, RagError>;

    /// Streaming completion. The receiver yields ordered chunks and ends
    /// after a `Done` chunk (or on channel close for back-ends that can't
    /// report a finish reason).
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<mpsc::Receiver<StreamChunk>, RagError>;

    async fn is_available(&self) -> bool {
        true
    }

    /// Optional capability; back-ends without a tokenizer return `None` and
    /// callers fall back to the char-based estimator.
    async fn count_tokens(&self, _messages: &[ChatMessage]) -> Option<usize> {
        None
    }
}

/// Cross-encoder scoring back-end: one raw score per `(text, text_pair)`
/// entry. Scores need not be bounded; the reranker applies the sigmoid.
#[async_trait]
pub trait CrossEncoderBackend: Send + Sync {
    async fn score_pairs(&self, pairs: &[(String, String)]) -> Result<Vec<f32>, RagError>;

    /// Optional model pre-load hook, called by the engine's warm-up.
    async fn warm_up(&self) -> Result<(), RagError> {
        Ok(())
    }
}

/// Optional query enhancement stage.
#[async_trait]
pub trait QueryEnhancer: Send + Sync {
    /// Rewrite the query. Implementations may return alternates alongside the
    /// main rewrite; the engine fans retrieval out over all of them.
    async fn enhance(&self, query: &str) -> Result<EnhancedQuery, RagError>;
}

#[derive(Debug, Clone)]
pub struct EnhancedQuery {
    pub query: String,
    /// Additional query variants, original included when the enhancer keeps it.
    pub alternates: Vec<String>,
}
