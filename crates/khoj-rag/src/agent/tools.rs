//! Agent tools: typed registry with schema-validated, timeout-bounded
//! dispatch. Tool failures never escape as errors — dispatch shapes every
//! outcome into an observation the model can react to.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::cancel::CancelToken;
use crate::provider::ToolSchema;

/// Execution context handed to every tool call.
#[derive(Clone, Default)]
pub struct ToolContext {
    pub cancel: CancelToken,
    pub session_id: Option<String>,
}

/// A tool the agent can invoke.
#[async_trait]
pub trait AgentTool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the tool's input object.
    fn parameters_schema(&self) -> JsonValue;

    /// Optional JSON Schema validated against the output post-hoc.
    fn output_schema(&self) -> Option<JsonValue> {
        None
    }

    async fn execute(&self, input: JsonValue, context: ToolContext) -> anyhow::Result<JsonValue>;
}

/// Observation-ready outcome of one dispatch.
#[derive(Debug, Clone)]
pub struct ToolExecution {
    pub result: JsonValue,
    pub success: bool,
    pub timed_out: bool,
    /// Stable error code when the call failed.
    pub error_code: Option<&'static str>,
}

impl ToolExecution {
    fn ok(result: JsonValue) -> Self {
        Self {
            result,
            success: true,
            timed_out: false,
            error_code: None,
        }
    }

    fn failed(message: String, code: &'static str) -> Self {
        Self {
            result: serde_json::json!({ "error": message }),
            success: false,
            timed_out: false,
            error_code: Some(code),
        }
    }
}

/// Registry of available tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn AgentTool>>,
    default_timeout_ms: u64,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            default_timeout_ms: 30_000,
        }
    }

    pub fn with_default_timeout(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    pub fn register(&mut self, tool: Arc<dyn AgentTool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentTool>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Tool definitions in the shape the model back-end receives verbatim.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .values()
            .map(|tool| ToolSchema {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect()
    }

    /// Dispatch one tool call: look up, validate input, execute under the
    /// timeout, validate output. Every failure mode lands in the returned
    /// observation rather than propagating.
    pub async fn dispatch(
        &self,
        name: &str,
        input: JsonValue,
        context: ToolContext,
        timeout_ms: Option<u64>,
    ) -> ToolExecution {
        let Some(tool) = self.get(name) else {
            return ToolExecution::failed(format!("tool '{}' not found", name), "TOOL_NOT_FOUND");
        };

        if let Err(message) = validate_against(&tool.parameters_schema(), &input) {
            tracing::warn!(tool = name, error = %message, "tool input rejected");
            return ToolExecution::failed(
                format!("input validation failed: {}", message),
                "VALIDATION_ERROR",
            );
        }

        let timeout_ms = timeout_ms.unwrap_or(self.default_timeout_ms);
        let started = std::time::Instant::now();
        let outcome = tokio::time::timeout(
            tokio::time::Duration::from_millis(timeout_ms),
            tool.execute(input, context),
        )
        .await;

        match outcome {
            Err(_) => {
                tracing::warn!(tool = name, timeout_ms, "tool timed out");
                ToolExecution {
                    result: serde_json::json!({
                        "error": format!("tool '{}' timed out after {} ms", name, timeout_ms),
                    }),
                    success: false,
                    timed_out: true,
                    error_code: Some("TOOL_TIMEOUT"),
                }
            }
            Ok(Err(error)) => {
                tracing::warn!(tool = name, error = %error, "tool execution failed");
                ToolExecution::failed(format!("tool execution failed: {}", error), "TOOL_ERROR")
            }
            Ok(Ok(result)) => {
                if let Some(schema) = tool.output_schema() {
                    if let Err(message) = validate_against(&schema, &result) {
                        tracing::warn!(tool = name, error = %message, "tool output rejected");
                        return ToolExecution::failed(
                            format!("output validation failed: {}", message),
                            "VALIDATION_ERROR",
                        );
                    }
                }
                tracing::debug!(
                    tool = name,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "tool call complete"
                );
                ToolExecution::ok(result)
            }
        }
    }
}

fn validate_against(schema: &JsonValue, instance: &JsonValue) -> Result<(), String> {
    let compiled = jsonschema::JSONSchema::compile(schema)
        .map_err(|e| format!("invalid schema: {}", e))?;
    let result = compiled.validate(instance);
    if let Err(errors) = result {
        let first = errors
            .into_iter()
            .next()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "schema mismatch".to_string());
        return Err(first);
    }
    Ok(())
}
