//! OpenAI-compatible Chat Completions API provider
//!
//! Also serves OpenRouter, Ollama and other endpoints that speak the same
//! wire format; the model's `base_url` decides where requests go.

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    providers::{LlmProvider, build_headers},
    stream::{MessageEvent, MessageEventStream},
    types::{Api, AssistantMetadata, Content, Context, Message, Model, StopReason, StreamOptions, Usage},
};

/// OpenAI API client
pub struct OpenAIProvider {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl OpenAIProvider {
    /// Create a new OpenAI provider with an API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: Some(api_key.into()),
        }
    }

    /// Create a provider for local endpoints that need no key
    pub fn without_key() -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: None,
        }
    }

    /// Create from environment variable
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| Error::InvalidApiKey)?;
        Ok(Self::new(api_key))
    }

    fn build_request(&self, model: &Model, context: &Context, options: &StreamOptions) -> OpenAIRequest {
        let mut messages = Vec::new();

        if let Some(ref system_prompt) = context.system_prompt {
            messages.push(OpenAIMessage {
                role: "system",
                content: Some(system_prompt.clone()),
                tool_calls: None,
                tool_call_id: None,
            });
        }

        messages.extend(context.messages.iter().map(convert_message));

        let tools: Option<Vec<OpenAITool>> = if context.tools.is_empty() {
            None
        } else {
            Some(
                context
                    .tools
                    .iter()
                    .map(|t| OpenAITool {
                        tool_type: "function",
                        function: OpenAIFunction {
                            name: t.name.clone(),
                            description: Some(t.description.clone()),
                            parameters: Some(t.parameters.clone()),
                        },
                    })
                    .collect(),
            )
        };

        let tool_choice = tools.as_ref().map(|_| serde_json::json!("auto"));
        OpenAIRequest {
            model: model.id.clone(),
            messages,
            stream: true,
            stream_options: StreamOptionsWire { include_usage: true },
            max_tokens: Some(options.max_tokens.unwrap_or(model.max_tokens / 3)),
            temperature: options.temperature,
            tools,
            tool_choice,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAIProvider {
    async fn stream(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
    ) -> Result<MessageEventStream> {
        let request = self.build_request(model, context, options);
        let url = format!("{}/chat/completions", model.base_url);

        tracing::debug!("OpenAI-compatible API URL: {}", url);

        let mut fixed = vec![("content-type", "application/json".to_string())];
        if let Some(ref key) = self.api_key {
            fixed.push(("authorization", format!("Bearer {}", key)));
        }
        let headers = build_headers(&fixed, model)?;

        let request_builder = self.client.post(&url).headers(headers).json(&request);

        let event_source = EventSource::new(request_builder)
            .map_err(|e| Error::Sse(format!("Failed to create event source: {}", e)))?;

        Ok(Box::pin(create_stream(event_source, model.clone())))
    }
}

fn text_of(content: &[Content]) -> String {
    content
        .iter()
        .filter_map(|c| c.as_text())
        .collect::<Vec<_>>()
        .join("")
}

fn convert_message(msg: &Message) -> OpenAIMessage {
    match msg {
        Message::User { content, .. } => OpenAIMessage {
            role: "user",
            content: Some(text_of(content)),
            tool_calls: None,
            tool_call_id: None,
        },
        Message::Assistant { content, .. } => {
            let tool_calls: Vec<OpenAIToolCall> = content
                .iter()
                .filter_map(|c| match c {
                    Content::ToolCall {
                        id,
                        name,
                        arguments,
                    } => Some(OpenAIToolCall {
                        id: id.clone(),
                        call_type: "function",
                        function: OpenAIFunctionCall {
                            name: name.clone(),
                            arguments: arguments.to_string(),
                        },
                    }),
                    _ => None,
                })
                .collect();

            let text = text_of(content);
            OpenAIMessage {
                role: "assistant",
                content: (!text.is_empty()).then_some(text),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                tool_call_id: None,
            }
        }
        Message::ToolResult {
            tool_call_id,
            content,
            ..
        } => OpenAIMessage {
            role: "tool",
            content: Some(text_of(content)),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.clone()),
        },
    }
}

/// Partially received tool call, keyed by the stream's tool index
#[derive(Debug, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
    announced: bool,
}

fn create_stream(
    mut event_source: EventSource,
    model: Model,
) -> impl futures::Stream<Item = MessageEvent> {
    stream! {
        let mut accumulated_text = String::new();
        let mut tool_calls: Vec<PendingToolCall> = Vec::new();
        let mut finish_reason: Option<String> = None;
        let mut usage = Usage::default();

        yield MessageEvent::Start { message: Message::assistant_empty() };

        while let Some(event) = event_source.next().await {
            let msg = match event {
                Ok(Event::Open) => continue,
                Ok(Event::Message(msg)) => msg,
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(e) => {
                    event_source.close();
                    yield MessageEvent::Error { message: format!("SSE error: {}", e) };
                    return;
                }
            };

            if msg.data == "[DONE]" {
                break;
            }

            let chunk = match serde_json::from_str::<StreamChunk>(&msg.data) {
                Ok(chunk) => chunk,
                Err(e) => {
                    event_source.close();
                    yield MessageEvent::Error {
                        message: format!("Failed to parse chunk: {}", e),
                    };
                    return;
                }
            };

            for choice in chunk.choices {
                if let Some(content) = choice.delta.content {
                    accumulated_text.push_str(&content);
                    yield MessageEvent::TextDelta { content_index: 0, delta: content };
                }

                for tc in choice.delta.tool_calls.unwrap_or_default() {
                    let idx = tc.index;
                    while tool_calls.len() <= idx {
                        tool_calls.push(PendingToolCall::default());
                    }
                    let pending = &mut tool_calls[idx];
                    if let Some(id) = tc.id {
                        pending.id = id;
                    }
                    if let Some(function) = tc.function {
                        if let Some(name) = function.name {
                            pending.name = name;
                        }
                        if !pending.announced && !pending.name.is_empty() {
                            pending.announced = true;
                            yield MessageEvent::ToolCallStart {
                                content_index: idx + 1,
                                id: pending.id.clone(),
                                name: pending.name.clone(),
                            };
                        }
                        if let Some(args) = function.arguments {
                            pending.arguments.push_str(&args);
                            yield MessageEvent::ToolCallDelta { content_index: idx + 1, delta: args };
                        }
                    }
                }

                if let Some(reason) = choice.finish_reason {
                    finish_reason = Some(reason);
                }
            }

            if let Some(stream_usage) = chunk.usage {
                usage.input = stream_usage.prompt_tokens;
                usage.output = stream_usage.completion_tokens;
            }
        }

        let mut content = Vec::new();
        if !accumulated_text.is_empty() {
            content.push(Content::text(accumulated_text));
        }
        for call in tool_calls {
            if call.id.is_empty() || call.name.is_empty() {
                continue;
            }
            let arguments = if call.arguments.trim().is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str(&call.arguments).unwrap_or(serde_json::Value::Null)
            };
            content.push(Content::tool_call(call.id, call.name, arguments));
        }

        let stop_reason = match finish_reason.as_deref() {
            Some("length") => StopReason::Length,
            Some("tool_calls") => StopReason::ToolUse,
            _ => StopReason::Stop,
        };

        let final_message = Message::Assistant {
            content,
            metadata: AssistantMetadata {
                api: Some(Api::OpenAICompletions),
                provider: Some(model.provider),
                model: Some(model.id.clone()),
                usage: usage.clone(),
                stop_reason: Some(stop_reason),
                timestamp: chrono::Utc::now().timestamp_millis(),
                ..Default::default()
            },
        };

        yield MessageEvent::Done {
            message: final_message,
            stop_reason,
            usage,
        };
    }
}

// Request/Response types

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    stream: bool,
    stream_options: StreamOptionsWire,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAITool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct StreamOptionsWire {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAIToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenAITool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: OpenAIFunction,
}

#[derive(Debug, Serialize)]
struct OpenAIFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct OpenAIToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: &'static str,
    function: OpenAIFunctionCall,
}

#[derive(Debug, Serialize)]
struct OpenAIFunctionCall {
    name: String,
    arguments: String,
}

// Streaming response types

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    index: usize,
    id: Option<String>,
    function: Option<StreamFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}
