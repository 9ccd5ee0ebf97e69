//! Anthropic Messages API provider

use crate::{
    error::{Error, Result},
    providers::{LlmProvider, build_headers},
    stream::{MessageEvent, MessageEventStream},
    types::{Api, AssistantMetadata, Content, Context, Message, Model, StopReason, StreamOptions, Tool, Usage},
};
use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic API client
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider with an API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
        }
    }

    /// Create from environment variable
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| Error::InvalidApiKey)?;
        Ok(Self::new(api_key))
    }

    fn build_request(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
    ) -> AnthropicRequest {
        let tools = if context.tools.is_empty() {
            None
        } else {
            Some(convert_tools(&context.tools))
        };

        AnthropicRequest {
            model: model.id.clone(),
            messages: convert_messages(&context.messages),
            max_tokens: options.max_tokens.unwrap_or(model.max_tokens / 3),
            stream: true,
            system: context.system_prompt.clone(),
            temperature: options.temperature,
            tools,
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn stream(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
    ) -> Result<MessageEventStream> {
        let request = self.build_request(model, context, options);
        let url = format!("{}/v1/messages", model.base_url);

        tracing::debug!("Anthropic API URL: {}", url);

        let headers = build_headers(
            &[
                ("x-api-key", self.api_key.clone()),
                ("anthropic-version", ANTHROPIC_VERSION.to_string()),
                ("accept", "application/json".to_string()),
                ("content-type", "application/json".to_string()),
            ],
            model,
        )?;

        let request_builder = self.client.post(&url).headers(headers).json(&request);

        let event_source = EventSource::new(request_builder)
            .map_err(|e| Error::Sse(format!("Failed to create event source: {}", e)))?;

        Ok(Box::pin(create_stream(event_source, model.clone())))
    }
}

/// Turn the SSE feed into message events
fn create_stream(
    mut event_source: EventSource,
    model: Model,
) -> impl futures::Stream<Item = MessageEvent> {
    stream! {
        let mut usage = Usage::default();
        let mut stop_reason = StopReason::Stop;
        let mut blocks: Vec<BlockState> = vec![];
        let mut error_message: Option<String> = None;

        yield MessageEvent::Start {
            message: Message::assistant_empty(),
        };

        while let Some(event_result) = event_source.next().await {
            let message = match event_result {
                Ok(Event::Open) => continue,
                Ok(Event::Message(message)) => message,
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(e) => {
                    error_message = Some(e.to_string());
                    break;
                }
            };

            match message.event.as_str() {
                "message_start" => {
                    if let Ok(data) = serde_json::from_str::<MessageStartEvent>(&message.data) {
                        apply_usage(&mut usage, &data.message.usage);
                    }
                }
                "content_block_start" => {
                    let Ok(data) = serde_json::from_str::<ContentBlockStartEvent>(&message.data) else {
                        continue;
                    };
                    let index = data.index as usize;
                    while blocks.len() <= index {
                        blocks.push(BlockState::Empty);
                    }
                    match data.content_block.block_type.as_str() {
                        "text" => {
                            blocks[index] = BlockState::Text(String::new());
                            yield MessageEvent::TextStart { content_index: index };
                        }
                        "thinking" => {
                            blocks[index] = BlockState::Thinking(String::new());
                            yield MessageEvent::ThinkingStart { content_index: index };
                        }
                        "tool_use" => {
                            let id = data.content_block.id.unwrap_or_default();
                            let name = data.content_block.name.unwrap_or_default();
                            blocks[index] = BlockState::ToolCall {
                                id: id.clone(),
                                name: name.clone(),
                                arguments_json: String::new(),
                            };
                            yield MessageEvent::ToolCallStart { content_index: index, id, name };
                        }
                        _ => {}
                    }
                }
                "content_block_delta" => {
                    let Ok(data) = serde_json::from_str::<ContentBlockDeltaEvent>(&message.data) else {
                        continue;
                    };
                    let index = data.index as usize;
                    let Some(block) = blocks.get_mut(index) else {
                        continue;
                    };
                    match (data.delta.delta_type.as_str(), block) {
                        ("text_delta", BlockState::Text(text)) => {
                            let delta = data.delta.text.unwrap_or_default();
                            text.push_str(&delta);
                            yield MessageEvent::TextDelta { content_index: index, delta };
                        }
                        ("thinking_delta", BlockState::Thinking(thinking)) => {
                            let delta = data.delta.thinking.unwrap_or_default();
                            thinking.push_str(&delta);
                            yield MessageEvent::ThinkingDelta { content_index: index, delta };
                        }
                        ("input_json_delta", BlockState::ToolCall { arguments_json, .. }) => {
                            let delta = data.delta.partial_json.unwrap_or_default();
                            arguments_json.push_str(&delta);
                            yield MessageEvent::ToolCallDelta { content_index: index, delta };
                        }
                        _ => {}
                    }
                }
                "content_block_stop" => {
                    let Ok(data) = serde_json::from_str::<ContentBlockStopEvent>(&message.data) else {
                        continue;
                    };
                    let index = data.index as usize;
                    match blocks.get(index) {
                        Some(BlockState::Text(text)) => {
                            yield MessageEvent::TextEnd { content_index: index, text: text.clone() };
                        }
                        Some(BlockState::Thinking(thinking)) => {
                            yield MessageEvent::ThinkingEnd {
                                content_index: index,
                                thinking: thinking.clone(),
                            };
                        }
                        Some(BlockState::ToolCall { id, name, arguments_json }) => {
                            yield MessageEvent::ToolCallEnd {
                                content_index: index,
                                id: id.clone(),
                                name: name.clone(),
                                arguments: parse_arguments(arguments_json),
                            };
                        }
                        _ => {}
                    }
                }
                "message_delta" => {
                    if let Ok(data) = serde_json::from_str::<MessageDeltaEvent>(&message.data) {
                        if let Some(reason) = data.delta.stop_reason {
                            stop_reason = map_stop_reason(&reason);
                        }
                        apply_usage(&mut usage, &data.usage);
                    }
                }
                "message_stop" => break,
                "error" => {
                    error_message = Some(
                        serde_json::from_str::<ErrorEvent>(&message.data)
                            .map(|data| data.error.message)
                            .unwrap_or(message.data),
                    );
                    break;
                }
                _ => {}
            }
        }

        event_source.close();

        if let Some(message) = error_message {
            yield MessageEvent::Error { message };
            return;
        }

        let content: Vec<Content> = blocks.into_iter().filter_map(BlockState::into_content).collect();

        let final_message = Message::Assistant {
            content,
            metadata: AssistantMetadata {
                api: Some(Api::AnthropicMessages),
                provider: Some(model.provider),
                model: Some(model.id.clone()),
                usage: usage.clone(),
                stop_reason: Some(stop_reason),
                error_message: None,
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
        };

        yield MessageEvent::Done {
            message: final_message,
            stop_reason,
            usage,
        };
    }
}

/// Per-index accumulation state for content blocks
#[derive(Debug)]
enum BlockState {
    Empty,
    Text(String),
    Thinking(String),
    ToolCall {
        id: String,
        name: String,
        arguments_json: String,
    },
}

impl BlockState {
    fn into_content(self) -> Option<Content> {
        match self {
            BlockState::Empty => None,
            BlockState::Text(text) => Some(Content::Text { text }),
            BlockState::Thinking(thinking) => Some(Content::Thinking { thinking }),
            BlockState::ToolCall {
                id,
                name,
                arguments_json,
            } => Some(Content::ToolCall {
                id,
                name,
                arguments: parse_arguments(&arguments_json),
            }),
        }
    }
}

/// Tool input arrives as a JSON string; an empty string means no arguments.
fn parse_arguments(arguments_json: &str) -> serde_json::Value {
    if arguments_json.trim().is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(arguments_json).unwrap_or(serde_json::Value::Null)
}

fn apply_usage(usage: &mut Usage, info: &UsageInfo) {
    if let Some(input) = info.input_tokens {
        usage.input = input;
    }
    usage.output = info.output_tokens;
    usage.cache_read = info.cache_read_input_tokens.unwrap_or(usage.cache_read);
    usage.cache_write = info.cache_creation_input_tokens.unwrap_or(usage.cache_write);
}

// ============================================================================
// Request types
// ============================================================================

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

// ============================================================================
// Response event types
// ============================================================================

#[derive(Debug, Deserialize)]
struct MessageStartEvent {
    message: MessageInfo,
}

#[derive(Debug, Deserialize)]
struct MessageInfo {
    usage: UsageInfo,
}

#[derive(Debug, Deserialize)]
struct UsageInfo {
    #[serde(default)]
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: u32,
    cache_read_input_tokens: Option<u32>,
    cache_creation_input_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStartEvent {
    index: u32,
    content_block: ContentBlockInfo,
}

#[derive(Debug, Deserialize)]
struct ContentBlockInfo {
    #[serde(rename = "type")]
    block_type: String,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDeltaEvent {
    index: u32,
    delta: DeltaInfo,
}

#[derive(Debug, Deserialize)]
struct DeltaInfo {
    #[serde(rename = "type")]
    delta_type: String,
    text: Option<String>,
    thinking: Option<String>,
    partial_json: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStopEvent {
    index: u32,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaEvent {
    delta: MessageDelta,
    usage: UsageInfo,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEvent {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

// ============================================================================
// Conversion functions
// ============================================================================

fn convert_messages(messages: &[Message]) -> Vec<AnthropicMessage> {
    let mut result: Vec<AnthropicMessage> = vec![];

    for message in messages {
        let (role, blocks) = match message {
            Message::User { content, .. } => {
                let blocks = content
                    .iter()
                    .filter_map(|c| c.as_text())
                    .map(|text| serde_json::json!({ "type": "text", "text": text }))
                    .collect();
                ("user", blocks)
            }
            Message::Assistant { content, .. } => {
                let blocks: Vec<serde_json::Value> = content
                    .iter()
                    .map(|c| match c {
                        Content::Text { text } => serde_json::json!({ "type": "text", "text": text }),
                        Content::Thinking { thinking } => serde_json::json!({
                            "type": "text",
                            "text": format!("<thinking>\n{}\n</thinking>", thinking)
                        }),
                        Content::ToolCall {
                            id,
                            name,
                            arguments,
                        } => serde_json::json!({
                            "type": "tool_use",
                            "id": id,
                            "name": name,
                            "input": arguments
                        }),
                    })
                    .collect();
                if blocks.is_empty() {
                    continue;
                }
                ("assistant", blocks)
            }
            Message::ToolResult {
                tool_call_id,
                content,
                is_error,
                ..
            } => {
                let text_content = content
                    .iter()
                    .filter_map(|c| c.as_text())
                    .collect::<Vec<_>>()
                    .join("\n");
                let block = serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": tool_call_id,
                    "content": text_content,
                    "is_error": is_error
                });
                ("user", vec![block])
            }
        };

        // The API rejects consecutive same-role turns; tool results from one
        // batch are folded into a single user turn.
        match result.last_mut() {
            Some(last) if last.role == role && role == "user" => last.content.extend(blocks),
            _ => result.push(AnthropicMessage {
                role,
                content: blocks,
            }),
        }
    }

    result
}

fn convert_tools(tools: &[Tool]) -> Vec<AnthropicTool> {
    tools
        .iter()
        .map(|tool| {
            let input_schema = if tool.parameters.is_object() {
                let mut schema = tool.parameters.clone();
                if let Some(obj) = schema.as_object_mut() {
                    obj.entry("type").or_insert(serde_json::json!("object"));
                }
                schema
            } else {
                serde_json::json!({
                    "type": "object",
                    "properties": {},
                    "required": []
                })
            };

            AnthropicTool {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema,
            }
        })
        .collect()
}

fn map_stop_reason(reason: &str) -> StopReason {
    match reason {
        "max_tokens" => StopReason::Length,
        "tool_use" => StopReason::ToolUse,
        _ => StopReason::Stop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_results_fold_into_one_user_turn() {
        let messages = vec![
            Message::user("goal"),
            Message::assistant(vec![
                Content::tool_call("a", "read", serde_json::json!({})),
                Content::tool_call("b", "read", serde_json::json!({})),
            ]),
            Message::tool_result("a", "read", vec![Content::text("one")], false),
            Message::tool_result("b", "read", vec![Content::text("two")], true),
        ];

        let converted = convert_messages(&messages);
        assert_eq!(converted.len(), 3);
        assert_eq!(converted[2].role, "user");
        assert_eq!(converted[2].content.len(), 2);
        assert_eq!(converted[2].content[1]["tool_use_id"], "b");
        assert_eq!(converted[2].content[1]["is_error"], true);
    }

    #[test]
    fn test_empty_assistant_message_dropped() {
        let messages = vec![Message::user("hi"), Message::assistant_empty()];
        assert_eq!(convert_messages(&messages).len(), 1);
    }

    #[test]
    fn test_convert_tools_defaults_object_type() {
        let tools = vec![Tool::new("t", "d", serde_json::json!({"properties": {}}))];
        let converted = convert_tools(&tools);
        assert_eq!(converted[0].input_schema["type"], "object");
    }

    #[test]
    fn test_parse_arguments_empty_is_object() {
        assert_eq!(parse_arguments(""), serde_json::json!({}));
        assert_eq!(parse_arguments("{\"a\":1}"), serde_json::json!({"a": 1}));
    }

    #[test]
    fn test_map_stop_reason() {
        assert_eq!(map_stop_reason("tool_use"), StopReason::ToolUse);
        assert_eq!(map_stop_reason("max_tokens"), StopReason::Length);
        assert_eq!(map_stop_reason("end_turn"), StopReason::Stop);
    }
}
