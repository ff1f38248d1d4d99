//! The ReAct reasoning loop: alternate model calls with tool execution,
//! bounded by `max_iterations`, with an optional streaming surface.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::cancel::CancelToken;
use crate::config::AgentConfig;
use crate::error::RagError;
use crate::provider::{
    ChatCompletion, ChatMessage, ChatModelProvider, ChatOptions, StreamChunk, ToolCall,
};
use crate::types::ReActTrace;

use super::aggregator::ToolCallAggregator;
use super::memory::MemoryProvider;
use super::tools::{ToolContext, ToolRegistry};

/// Events emitted by a streaming agent run. The sequence is finite and ends
/// with `Done`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Thought {
        content: String,
    },
    Action {
        tool: String,
        input: JsonValue,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },
    Observation {
        result: JsonValue,
        success: bool,
        timed_out: bool,
    },
    Done {
        output: Option<String>,
        error: Option<String>,
        trace: ReActTrace,
    },
}

type EventCallback = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

#[derive(Clone, Default)]
pub struct AgentOptions {
    pub session_id: Option<String>,
    pub cancel: CancelToken,
    pub chat_options: ChatOptions,
    /// Observer callback, invoked behind a panic guard: a broken callback
    /// never takes the loop down.
    pub on_event: Option<EventCallback>,
}

#[derive(Debug)]
pub struct AgentRunResult {
    pub output: String,
    pub trace: ReActTrace,
}

#[derive(Clone)]
pub struct Agent {
    model: Arc<dyn ChatModelProvider>,
    registry: Arc<ToolRegistry>,
    memory: Option<Arc<dyn MemoryProvider>>,
    config: AgentConfig,
}

impl Agent {
    pub fn new(model: Arc<dyn ChatModelProvider>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            model,
            registry,
            memory: None,
            config: AgentConfig::default(),
        }
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryProvider>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    async fn emit(
        options: &AgentOptions,
        sink: Option<&mpsc::Sender<StreamEvent>>,
        event: StreamEvent,
    ) {
        if let Some(callback) = &options.on_event {
            let guarded = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(&event);
            }));
            if guarded.is_err() {
                tracing::error!("agent event callback panicked; continuing");
            }
        }
        if let Some(sender) = sink {
            let _ = sender.send(event).await;
        }
    }

    async fn load_history(
        &self,
        options: &AgentOptions,
        initial: Vec<ChatMessage>,
    ) -> Result<Vec<ChatMessage>, RagError> {
        let mut messages = match (&self.memory, &options.session_id) {
            (Some(memory), Some(session_id)) => memory.load(session_id).await?,
            _ => Vec::new(),
        };
        messages.extend(initial);
        Ok(messages)
    }

    async fn save_history(&self, options: &AgentOptions, messages: &[ChatMessage]) {
        if let (Some(memory), Some(session_id)) = (&self.memory, &options.session_id) {
            if let Err(e) = memory.save(session_id, messages).await {
                tracing::warn!(session_id = %session_id, error = %e, "failed to persist conversation");
            }
        }
    }

    fn chat_options(&self, options: &AgentOptions) -> ChatOptions {
        let mut chat_options = options.chat_options.clone();
        let schemas = self.registry.schemas();
        if !schemas.is_empty() {
            chat_options.tools = Some(schemas);
        }
        chat_options
    }

    /// Run one iteration's tool calls in order, appending the assistant and
    /// tool messages to the history.
    async fn run_tool_calls(
        &self,
        content: String,
        tool_calls: Vec<ToolCall>,
        messages: &mut Vec<ChatMessage>,
        trace: &mut ReActTrace,
        options: &AgentOptions,
        sink: Option<&mpsc::Sender<StreamEvent>>,
    ) {
        let assistant_content = if content.is_empty() {
            None
        } else {
            Some(content)
        };
        messages.push(ChatMessage::assistant_tool_calls(
            assistant_content,
            tool_calls.clone(),
        ));

        for call in tool_calls {
            let input: JsonValue =
                serde_json::from_str(&call.arguments).unwrap_or_else(|_| serde_json::json!({}));

            trace.action(&call.name, input.clone());
            Self::emit(
                options,
                sink,
                StreamEvent::Action {
                    tool: call.name.clone(),
                    input: input.clone(),
                },
            ).await;
            Self::emit(
                options,
                sink,
                StreamEvent::ToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                },
            ).await;

            let context = ToolContext {
                cancel: options.cancel.clone(),
                session_id: options.session_id.clone(),
            };
            let execution = self
                .registry
                .dispatch(
                    &call.name,
                    input,
                    context,
                    Some(self.config.tool_timeout_ms),
                )
                .await;

            trace.observation(execution.result.clone(), execution.success, execution.timed_out);
            Self::emit(
                options,
                sink,
                StreamEvent::Observation {
                    result: execution.result.clone(),
                    success: execution.success,
                    timed_out: execution.timed_out,
                },
            ).await;

            let serialized = serde_json::to_string(&execution.result)
                .unwrap_or_else(|_| "{\"error\":\"unserializable tool result\"}".to_string());
            messages.push(ChatMessage::tool_result(&call.id, &call.name, serialized));
        }
    }

    async fn run_loop(
        &self,
        initial: Vec<ChatMessage>,
        options: &AgentOptions,
        sink: Option<&mpsc::Sender<StreamEvent>>,
        streaming_model: bool,
    ) -> Result<AgentRunResult, RagError> {
        let run_id = uuid::Uuid::new_v4();
        let started = Instant::now();
        let mut messages = self.load_history(options, initial).await?;
        let mut trace = ReActTrace::default();
        let chat_options = self.chat_options(options);
        tracing::debug!(run_id = %run_id, messages = messages.len(), "agent run starting");

        for iteration in 1..=self.config.max_iterations {
            if options.cancel.is_cancelled() {
                return Err(RagError::AgentError("aborted".into()));
            }
            trace.iterations = iteration;

            let completion = if streaming_model {
                self.collect_stream(&messages, &chat_options, options, sink)
                    .await?
            } else {
                self.model.chat(&messages, &chat_options).await?
            };

            if let Some(usage) = &completion.usage {
                trace.total_tokens += (usage.input_tokens + usage.output_tokens) as usize;
            }

            if completion.tool_calls.is_empty() {
                let output = completion.content;
                messages.push(ChatMessage::assistant(output.clone()));
                trace.duration_ms = started.elapsed().as_millis() as u64;
                self.save_history(options, &messages).await;
                tracing::info!(
                    run_id = %run_id,
                    iterations = iteration,
                    actions = trace.action_count(),
                    "agent run complete"
                );
                return Ok(AgentRunResult { output, trace });
            }

            if !completion.content.is_empty() {
                trace.thought(completion.content.clone());
                Self::emit(
                    options,
                    sink,
                    StreamEvent::Thought {
                        content: completion.content.clone(),
                    },
                ).await;
            }

            tracing::debug!(
                iteration,
                tool_calls = completion.tool_calls.len(),
                "executing requested tool calls"
            );
            self.run_tool_calls(
                completion.content,
                completion.tool_calls,
                &mut messages,
                &mut trace,
                options,
                sink,
            )
            .await;
        }

        trace.duration_ms = started.elapsed().as_millis() as u64;
        self.save_history(options, &messages).await;
        Err(RagError::AgentError(format!(
            "exceeded max iterations ({})",
            self.config.max_iterations
        )))
    }

    /// Drain one streaming completion into an aggregate response.
    async fn collect_stream(
        &self,
        messages: &[ChatMessage],
        chat_options: &ChatOptions,
        options: &AgentOptions,
        _sink: Option<&mpsc::Sender<StreamEvent>>,
    ) -> Result<ChatCompletion, RagError> {
        let mut rx = self.model.stream_chat(messages, chat_options).await?;
        let mut content = String::new();
        let mut thinking = String::new();
        let mut aggregator = ToolCallAggregator::new();
        let mut usage = None;
        let mut finish_reason = crate::provider::FinishReason::Stop;

        while let Some(chunk) = rx.recv().await {
            if options.cancel.is_cancelled() {
                return Err(RagError::AgentError("aborted".into()));
            }
            match chunk {
                StreamChunk::Text { delta } => content.push_str(&delta),
                StreamChunk::Thinking { delta } => thinking.push_str(&delta),
                StreamChunk::ToolCall { fragment } => aggregator.push(&fragment),
                StreamChunk::Usage { usage: u } => usage = Some(u),
                StreamChunk::Done { finish_reason: f } => {
                    finish_reason = f;
                    break;
                }
            }
        }

        Ok(ChatCompletion {
            content,
            tool_calls: aggregator.finish(),
            finish_reason,
            usage,
            thinking: if thinking.is_empty() {
                None
            } else {
                Some(thinking)
            },
            metadata: None,
        })
    }

    /// Run to completion, returning the final answer with the full trace.
    pub async fn execute(
        &self,
        initial_messages: Vec<ChatMessage>,
        options: AgentOptions,
    ) -> Result<AgentRunResult, RagError> {
        self.run_loop(initial_messages, &options, None, false).await
    }

    /// Streaming run: returns a finite event sequence ending in `Done`.
    pub fn execute_stream(
        &self,
        initial_messages: Vec<ChatMessage>,
        options: AgentOptions,
    ) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(64);
        let agent = self.clone();
        tokio::spawn(async move {
            let outcome = agent
                .run_loop(initial_messages, &options, Some(&tx), true)
                .await;
            let done = match outcome {
                Ok(result) => StreamEvent::Done {
                    output: Some(result.output),
                    error: None,
                    trace: result.trace,
                },
                Err(error) => StreamEvent::Done {
                    output: None,
                    error: Some(error.to_string()),
                    trace: ReActTrace::default(),
                },
            };
            let _ = tx.send(done).await;
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tools::AgentTool;
    use crate::provider::{FinishReason, TokenUsage, ToolCallFragment};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct EchoTool;

    #[async_trait]
    impl AgentTool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the input."
        }

        fn parameters_schema(&self) -> JsonValue {
            serde_json::json!({ "type": "object" })
        }

        async fn execute(
            &self,
            input: JsonValue,
            _context: ToolContext,
        ) -> anyhow::Result<JsonValue> {
            Ok(serde_json::json!({ "echoed": input }))
        }
    }

    /// Model that requests `echo` for `tool_rounds` iterations, then answers.
    struct ScriptedToolModel {
        tool_rounds: u32,
        calls: AtomicU32,
    }

    impl ScriptedToolModel {
        fn new(tool_rounds: u32) -> Self {
            Self {
                tool_rounds,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ChatModelProvider for ScriptedToolModel {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _options: &ChatOptions,
        ) -> Result<ChatCompletion, RagError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.tool_rounds {
                Ok(ChatCompletion {
                    content: format!("thinking about round {}", n + 1),
                    tool_calls: vec![ToolCall {
                        id: format!("call_{}", n),
                        name: "echo".into(),
                        arguments: "{\"round\": 1}".into(),
                    }],
                    finish_reason: FinishReason::ToolCalls,
                    usage: Some(TokenUsage {
                        input_tokens: 10,
                        output_tokens: 5,
                    }),
                    thinking: None,
                    metadata: None,
                })
            } else {
                Ok(ChatCompletion {
                    content: "final answer".into(),
                    tool_calls: Vec::new(),
                    finish_reason: FinishReason::Stop,
                    usage: Some(TokenUsage {
                        input_tokens: 10,
                        output_tokens: 5,
                    }),
                    thinking: None,
                    metadata: None,
                })
            }
        }

        async fn stream_chat(
            &self,
            _messages: &[ChatMessage],
            _options: &ChatOptions,
        ) -> Result<mpsc::Receiver<StreamChunk>, RagError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(16);
            let tool_rounds = self.tool_rounds;
            tokio::spawn(async move {
                if n < tool_rounds {
                    let _ = tx
                        .send(StreamChunk::ToolCall {
                            fragment: ToolCallFragment {
                                id: Some(format!("call_{}", n)),
                                name: Some("echo".into()),
                                arguments: Some("{\"part\":".into()),
                            },
                        })
                        .await;
                    let _ = tx
                        .send(StreamChunk::ToolCall {
                            fragment: ToolCallFragment {
                                id: None,
                                name: None,
                                arguments: Some("true}".into()),
                            },
                        })
                        .await;
                    let _ = tx
                        .send(StreamChunk::Done {
                            finish_reason: FinishReason::ToolCalls,
                        })
                        .await;
                } else {
                    let _ = tx
                        .send(StreamChunk::Text {
                            delta: "streamed ".into(),
                        })
                        .await;
                    let _ = tx
                        .send(StreamChunk::Text {
                            delta: "answer".into(),
                        })
                        .await;
                    let _ = tx
                        .send(StreamChunk::Done {
                            finish_reason: FinishReason::Stop,
                        })
                        .await;
                }
            });
            Ok(rx)
        }
    }

    fn agent(model: Arc<dyn ChatModelProvider>) -> Agent {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        Agent::new(model, Arc::new(registry))
    }

    #[tokio::test]
    async fn test_execute_runs_tools_then_answers() {
        let agent = agent(Arc::new(ScriptedToolModel::new(2)));
        let result = agent
            .execute(vec![ChatMessage::user("go")], AgentOptions::default())
            .await
            .expect("run");

        assert_eq!(result.output, "final answer");
        assert_eq!(result.trace.iterations, 3);
        assert_eq!(result.trace.action_count(), 2);
        assert_eq!(result.trace.observation_count(), 2);
        assert_eq!(result.trace.total_tokens, 45);
    }

    #[tokio::test]
    async fn test_iteration_bound_enforced() {
        let model = Arc::new(ScriptedToolModel::new(u32::MAX));
        let agent = agent(model.clone()).with_config(AgentConfig {
            max_iterations: 2,
            ..AgentConfig::default()
        });

        let err = agent
            .execute(vec![ChatMessage::user("go")], AgentOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, RagError::AgentError(_)));
        // Exactly two LLM calls, at most two actions and observations.
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
        // trace is not returned on failure; count via the model instead.
    }

    #[tokio::test]
    async fn test_unknown_tool_becomes_failed_observation() {
        struct UnknownToolModel {
            calls: AtomicU32,
        }

        #[async_trait]
        impl ChatModelProvider for UnknownToolModel {
            async fn chat(
                &self,
                _messages: &[ChatMessage],
                _options: &ChatOptions,
            ) -> Result<ChatCompletion, RagError> {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Ok(ChatCompletion {
                        content: String::new(),
                        tool_calls: vec![ToolCall {
                            id: "c1".into(),
                            name: "does_not_exist".into(),
                            arguments: "{}".into(),
                        }],
                        finish_reason: FinishReason::ToolCalls,
                        usage: None,
                        thinking: None,
                        metadata: None,
                    })
                } else {
                    Ok(ChatCompletion {
                        content: "recovered".into(),
                        tool_calls: Vec::new(),
                        finish_reason: FinishReason::Stop,
                        usage: None,
                        thinking: None,
                        metadata: None,
                    })
                }
            }

            async fn stream_chat(
                &self,
                _messages: &[ChatMessage],
                _options: &ChatOptions,
            ) -> Result<mpsc::Receiver<StreamChunk>, RagError> {
                Err(RagError::provider("not used"))
            }
        }

        let agent = agent(Arc::new(UnknownToolModel {
            calls: AtomicU32::new(0),
        }));
        let result = agent
            .execute(vec![ChatMessage::user("go")], AgentOptions::default())
            .await
            .expect("loop continues past unknown tool");

        assert_eq!(result.output, "recovered");
        let observation_failed = result.trace.steps.iter().any(|s| {
            matches!(
                s,
                crate::types::ReActStep::Observation { success: false, .. }
            )
        });
        assert!(observation_failed);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_run() {
        let agent = agent(Arc::new(ScriptedToolModel::new(u32::MAX)));
        let options = AgentOptions::default();
        options.cancel.cancel();

        let err = agent
            .execute(vec![ChatMessage::user("go")], options)
            .await
            .unwrap_err();
        match err {
            RagError::AgentError(message) => assert_eq!(message, "aborted"),
            other => panic!("expected AgentError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_memory_round_trip() {
        use crate::agent::memory::{InMemoryMemoryProvider, MemoryProvider};

        let memory = Arc::new(InMemoryMemoryProvider::new());
        let agent = agent(Arc::new(ScriptedToolModel::new(0)))
            .with_memory(memory.clone());
        let options = AgentOptions {
            session_id: Some("s1".into()),
            ..AgentOptions::default()
        };

        agent
            .execute(vec![ChatMessage::user("hello")], options)
            .await
            .expect("run");

        let saved = memory.load("s1").await.expect("load");
        // user message + final assistant answer
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[1].content_text(), "final answer");
    }

    #[tokio::test]
    async fn test_streaming_run_emits_done() {
        let agent = agent(Arc::new(ScriptedToolModel::new(1)));
        let mut rx = agent.execute_stream(vec![ChatMessage::user("go")], AgentOptions::default());

        let mut saw_tool_call = false;
        let mut saw_observation = false;
        let mut done_output = None;
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::ToolCall { name, arguments, .. } => {
                    saw_tool_call = true;
                    assert_eq!(name, "echo");
                    assert_eq!(arguments, "{\"part\":true}");
                }
                StreamEvent::Observation { success, .. } => {
                    saw_observation = true;
                    assert!(success);
                }
                StreamEvent::Done { output, error, .. } => {
                    assert!(error.is_none());
                    done_output = output;
                }
                _ => {}
            }
        }

        assert!(saw_tool_call);
        assert!(saw_observation);
        assert_eq!(done_output.as_deref(), Some("streamed answer"));
    }

    #[tokio::test]
    async fn test_panicking_callback_does_not_break_run() {
        let agent = agent(Arc::new(ScriptedToolModel::new(1)));
        let options = AgentOptions {
            on_event: Some(Arc::new(|_event: &StreamEvent| {
                panic!("callback blew up");
            })),
            ..AgentOptions::default()
        };

        let result = agent
            .execute(vec![ChatMessage::user("go")], options)
            .await
            .expect("callback panic is contained");
        assert_eq!(result.output, "final answer");
    }
}
