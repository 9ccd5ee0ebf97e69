//! Tool trait and batch execution

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use sortie_ai::Content;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::conversation::ConversationId;
use crate::events::ConversationEvent;
use crate::history::{ToolCallRequest, ToolOutput};

/// Result of a tool execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Content to return to the LLM
    pub content: Vec<Content>,
    /// Whether the execution resulted in an error
    pub is_error: bool,
}

impl ToolResult {
    /// Create a successful text result
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(text)],
            is_error: false,
        }
    }

    /// Create an error result
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(message)],
            is_error: true,
        }
    }

    /// Get the text content as a single string
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.as_text())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A sender for tool progress updates during execution.
///
/// Tools can use this to emit `ToolExecutionUpdate` events while running.
#[derive(Clone)]
pub struct ProgressSender {
    tx: broadcast::Sender<ConversationEvent>,
    conversation: ConversationId,
    tool_call_id: String,
    tool_name: String,
}

impl ProgressSender {
    /// Create a new progress sender for a specific tool invocation.
    pub fn new(
        tx: broadcast::Sender<ConversationEvent>,
        conversation: ConversationId,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
    ) -> Self {
        Self {
            tx,
            conversation,
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
        }
    }

    /// Send a progress update.
    pub fn send(&self, content: impl Into<String>) {
        let _ = self.tx.send(ConversationEvent::ToolExecutionUpdate {
            id: self.conversation,
            tool_call_id: self.tool_call_id.clone(),
            tool_name: self.tool_name.clone(),
            content: content.into(),
        });
    }
}

/// Trait for executable tools
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (used in API calls)
    fn name(&self) -> &str;

    /// Tool description for the LLM
    fn description(&self) -> &str;

    /// JSON Schema for parameters
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments
    async fn execute(
        &self,
        tool_call_id: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> ToolResult;

    /// Execute the tool with progress reporting support.
    ///
    /// Default implementation ignores the progress sender and delegates to `execute()`.
    async fn execute_with_progress(
        &self,
        tool_call_id: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
        _progress: ProgressSender,
    ) -> ToolResult {
        self.execute(tool_call_id, arguments, cancel).await
    }
}

/// Type alias for a boxed tool
pub type BoxedTool = Arc<dyn Tool>;

/// Convert a Tool to a sortie_ai::Tool for API calls
pub fn to_api_tool(tool: &dyn Tool) -> sortie_ai::Tool {
    sortie_ai::Tool::new(tool.name(), tool.description(), tool.parameters_schema())
}

/// Truncate to `max` characters, noting how much was cut
pub(crate) fn truncate_summary(s: &str, max: usize) -> String {
    let total = s.chars().count();
    if total <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max).collect();
    format!("{kept}... [{} more characters]", total - max)
}

/// Runs one turn's batch of tool calls and normalizes the results.
///
/// Unknown tools and arguments that fail schema validation become failed
/// outputs; a failing tool never aborts the batch.
pub struct ToolExecutor {
    tools: Vec<BoxedTool>,
    validators: HashMap<String, Arc<jsonschema::Validator>>,
    max_concurrency: usize,
    summary_limit: usize,
}

impl ToolExecutor {
    pub fn new(tools: Vec<BoxedTool>) -> Self {
        let mut validators = HashMap::new();
        for tool in &tools {
            let schema = tool.parameters_schema();
            match jsonschema::validator_for(&schema) {
                Ok(validator) => {
                    validators.insert(tool.name().to_string(), Arc::new(validator));
                }
                Err(e) => {
                    tracing::warn!(
                        "Invalid tool parameter schema for '{}', skipping validation: {}",
                        tool.name(),
                        e
                    );
                }
            }
        }

        Self {
            tools,
            validators,
            max_concurrency: 4,
            summary_limit: 4000,
        }
    }

    /// Upper bound on tool calls running at once within a batch
    pub fn with_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Maximum characters kept in each output summary
    pub fn with_summary_limit(mut self, limit: usize) -> Self {
        self.summary_limit = limit;
        self
    }

    /// Tool descriptors to advertise to the model
    pub fn api_tools(&self) -> Vec<sortie_ai::Tool> {
        self.tools.iter().map(|t| to_api_tool(t.as_ref())).collect()
    }

    /// Execute a batch. Calls may overlap, but the outputs come back in
    /// request order.
    pub async fn execute_batch(
        &self,
        conversation: ConversationId,
        calls: &[ToolCallRequest],
        cancel: &CancellationToken,
        events: &broadcast::Sender<ConversationEvent>,
    ) -> Vec<ToolOutput> {
        let pending: Vec<_> = calls
            .iter()
            .map(|call| self.execute_one(conversation, call, cancel.clone(), events))
            .collect();
        futures::stream::iter(pending)
            .buffered(self.max_concurrency)
            .collect()
            .await
    }

    async fn execute_one(
        &self,
        conversation: ConversationId,
        call: &ToolCallRequest,
        cancel: CancellationToken,
        events: &broadcast::Sender<ConversationEvent>,
    ) -> ToolOutput {
        let _ = events.send(ConversationEvent::ToolExecutionStart {
            id: conversation,
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
        });

        let result = match self.tools.iter().find(|t| t.name() == call.name) {
            None => {
                tracing::warn!(conversation = %conversation, "unknown tool '{}'", call.name);
                ToolResult::error(format!("Tool not found: {}", call.name))
            }
            Some(tool) => {
                let validation_error = self
                    .validators
                    .get(call.name.as_str())
                    .and_then(|validator| validate_with_validator(&call.arguments, validator));

                if let Some(err) = validation_error {
                    ToolResult::error(err)
                } else {
                    let progress = ProgressSender::new(
                        events.clone(),
                        conversation,
                        call.id.clone(),
                        call.name.clone(),
                    );
                    let run = AssertUnwindSafe(tool.execute_with_progress(
                        &call.id,
                        call.arguments.clone(),
                        cancel.clone(),
                        progress,
                    ))
                    .catch_unwind();
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => ToolResult::error("Tool execution cancelled"),
                        result = run => result.unwrap_or_else(|payload| {
                            let message = panic_message(payload.as_ref());
                            tracing::warn!(
                                conversation = %conversation,
                                "tool '{}' panicked: {}",
                                call.name,
                                message
                            );
                            ToolResult::error(format!("Tool panicked: {message}"))
                        }),
                    }
                }
            }
        };

        let summary = truncate_summary(&result.text_content(), self.summary_limit);
        let success = !result.is_error;
        tracing::debug!(
            conversation = %conversation,
            tool = %call.name,
            success,
            "tool finished"
        );

        let _ = events.send(ConversationEvent::ToolExecutionEnd {
            id: conversation,
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            summary: summary.clone(),
            success,
        });

        ToolOutput {
            call: call.clone(),
            success,
            summary,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Validate tool arguments using a pre-compiled validator.
/// Returns `Some(error_message)` if validation fails, `None` if valid.
fn validate_with_validator(
    args: &serde_json::Value,
    validator: &jsonschema::Validator,
) -> Option<String> {
    let errors: Vec<String> = validator
        .iter_errors(args)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{}: {}", path, e)
            }
        })
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(format!(
            "Tool argument validation failed:\n{}",
            errors.join("\n")
        ))
    }
}
