//! Streaming event types and utilities

use crate::error::{Error, Result};
use crate::types::{Content, Message, StopReason, Usage};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

/// Events emitted during message streaming
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageEvent {
    /// Initial message structure
    Start { message: Message },
    /// Text content started
    TextStart { content_index: usize },
    /// Text content delta
    TextDelta { content_index: usize, delta: String },
    /// Text content completed
    TextEnd { content_index: usize, text: String },
    /// Thinking content started
    ThinkingStart { content_index: usize },
    /// Thinking content delta
    ThinkingDelta { content_index: usize, delta: String },
    /// Thinking content completed
    ThinkingEnd {
        content_index: usize,
        thinking: String,
    },
    /// Tool call started
    ToolCallStart {
        content_index: usize,
        id: String,
        name: String,
    },
    /// Tool call arguments delta (partial JSON)
    ToolCallDelta { content_index: usize, delta: String },
    /// Tool call completed
    ToolCallEnd {
        content_index: usize,
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    /// Message completed successfully
    Done {
        message: Message,
        stop_reason: StopReason,
        usage: Usage,
    },
    /// Error occurred
    Error { message: String },
}

impl MessageEvent {
    /// Check if this is a terminal event (Done or Error)
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageEvent::Done { .. } | MessageEvent::Error { .. })
    }
}

/// A stream of message events
pub type MessageEventStream = Pin<Box<dyn Stream<Item = MessageEvent> + Send>>;

/// Builder for constructing an assistant message from streaming events
#[derive(Debug, Default)]
pub struct MessageBuilder {
    content_buffers: Vec<ContentBuffer>,
    usage: Usage,
    stop_reason: Option<StopReason>,
}

#[derive(Debug)]
enum ContentBuffer {
    Text(String),
    Thinking(String),
    ToolCall {
        id: String,
        name: String,
        arguments_json: String,
    },
}

impl ContentBuffer {
    fn to_content(&self) -> Content {
        match self {
            ContentBuffer::Text(text) => Content::text(text.clone()),
            ContentBuffer::Thinking(thinking) => Content::thinking(thinking.clone()),
            ContentBuffer::ToolCall {
                id,
                name,
                arguments_json,
            } => {
                let arguments =
                    serde_json::from_str(arguments_json).unwrap_or(serde_json::Value::Null);
                Content::tool_call(id.clone(), name.clone(), arguments)
            }
        }
    }
}

impl MessageBuilder {
    /// Create a new message builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a streaming event and update the message state
    pub fn process_event(&mut self, event: &MessageEvent) {
        match event {
            MessageEvent::TextStart { content_index } => {
                self.ensure_buffer(*content_index, ContentBuffer::Text(String::new()));
            }
            MessageEvent::TextDelta {
                content_index,
                delta,
            } => {
                if self.content_buffers.len() <= *content_index {
                    self.ensure_buffer(*content_index, ContentBuffer::Text(String::new()));
                }
                if let Some(ContentBuffer::Text(text)) =
                    self.content_buffers.get_mut(*content_index)
                {
                    text.push_str(delta);
                }
            }
            MessageEvent::TextEnd {
                content_index,
                text,
            } => {
                self.ensure_buffer(*content_index, ContentBuffer::Text(text.clone()));
            }
            MessageEvent::ThinkingStart { content_index } => {
                self.ensure_buffer(*content_index, ContentBuffer::Thinking(String::new()));
            }
            MessageEvent::ThinkingDelta {
                content_index,
                delta,
            } => {
                if let Some(ContentBuffer::Thinking(thinking)) =
                    self.content_buffers.get_mut(*content_index)
                {
                    thinking.push_str(delta);
                }
            }
            MessageEvent::ThinkingEnd {
                content_index,
                thinking,
            } => {
                self.ensure_buffer(*content_index, ContentBuffer::Thinking(thinking.clone()));
            }
            MessageEvent::ToolCallStart {
                content_index,
                id,
                name,
            } => {
                self.ensure_buffer(
                    *content_index,
                    ContentBuffer::ToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        arguments_json: String::new(),
                    },
                );
            }
            MessageEvent::ToolCallDelta {
                content_index,
                delta,
            } => {
                if let Some(ContentBuffer::ToolCall { arguments_json, .. }) =
                    self.content_buffers.get_mut(*content_index)
                {
                    arguments_json.push_str(delta);
                }
            }
            MessageEvent::ToolCallEnd {
                content_index,
                id,
                name,
                arguments,
            } => {
                self.ensure_buffer(
                    *content_index,
                    ContentBuffer::ToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        arguments_json: arguments.to_string(),
                    },
                );
            }
            MessageEvent::Done {
                stop_reason, usage, ..
            } => {
                self.stop_reason = Some(*stop_reason);
                self.usage = usage.clone();
            }
            MessageEvent::Start { .. } | MessageEvent::Error { .. } => {}
        }
    }

    /// Whether any content has been accumulated
    pub fn is_empty(&self) -> bool {
        self.content_buffers.is_empty()
    }

    /// Get the current partial message state
    pub fn current_content(&self) -> Vec<Content> {
        self.content_buffers
            .iter()
            .map(ContentBuffer::to_content)
            .collect()
    }

    /// Build the final message
    pub fn build(self) -> Message {
        let content = self.current_content();
        Message::Assistant {
            content,
            metadata: crate::types::AssistantMetadata {
                usage: self.usage,
                stop_reason: self.stop_reason,
                timestamp: chrono::Utc::now().timestamp_millis(),
                ..Default::default()
            },
        }
    }

    fn ensure_buffer(&mut self, index: usize, buffer: ContentBuffer) {
        while self.content_buffers.len() <= index {
            self.content_buffers.push(ContentBuffer::Text(String::new()));
        }
        self.content_buffers[index] = buffer;
    }
}

/// Drain a stream into its final assistant message and usage.
///
/// A provider `Error` event becomes an `Err`. A stream that ends without a
/// `Done` event falls back to whatever the builder accumulated.
pub async fn collect_response(mut stream: MessageEventStream) -> Result<(Message, Usage)> {
    let mut builder = MessageBuilder::new();

    while let Some(event) = stream.next().await {
        builder.process_event(&event);
        match event {
            MessageEvent::Done { message, usage, .. } => return Ok((message, usage)),
            MessageEvent::Error { message } => return Err(Error::api("stream_error", message)),
            _ => {}
        }
    }

    if builder.is_empty() {
        return Err(Error::UnexpectedResponse(
            "stream ended without a final message".to_string(),
        ));
    }
    let usage = builder.usage.clone();
    Ok((builder.build(), usage))
}
