//! Conversation transcript and the message list built from it for each turn.

use serde::{Deserialize, Serialize};
use sortie_ai::{Content, Message};

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl ToolCallRequest {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Collect the tool calls carried by an assistant message, in order
    pub fn from_message(message: &Message) -> Vec<Self> {
        message
            .tool_calls()
            .into_iter()
            .map(|(id, name, arguments)| Self::new(id, name, arguments.clone()))
            .collect()
    }
}

/// One normalized tool result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// The call this output answers
    pub call: ToolCallRequest,
    pub success: bool,
    pub summary: String,
}

impl ToolOutput {
    pub fn success(call: ToolCallRequest, summary: impl Into<String>) -> Self {
        Self {
            call,
            success: true,
            summary: summary.into(),
        }
    }

    pub fn failure(call: ToolCallRequest, summary: impl Into<String>) -> Self {
        Self {
            call,
            success: false,
            summary: summary.into(),
        }
    }
}

/// One step of a conversation transcript.
///
/// Histories are append-only. A `ToolResults` entry always follows the
/// `AssistantResponse` whose calls it answers, with the same turn number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEntry {
    AssistantResponse {
        turn: u32,
        text: String,
        tool_calls: Vec<ToolCallRequest>,
    },
    ToolResults {
        turn: u32,
        outputs: Vec<ToolOutput>,
    },
}

impl HistoryEntry {
    pub fn turn(&self) -> u32 {
        match self {
            HistoryEntry::AssistantResponse { turn, .. } | HistoryEntry::ToolResults { turn, .. } => {
                *turn
            }
        }
    }

    /// Text of an assistant response; `None` for tool results
    pub fn assistant_text(&self) -> Option<&str> {
        match self {
            HistoryEntry::AssistantResponse { text, .. } => Some(text),
            HistoryEntry::ToolResults { .. } => None,
        }
    }
}

/// The opening user message: instructions first, then the goal.
pub fn goal_message(instructions: &str, goal: &str) -> String {
    let instructions = instructions.trim();
    if instructions.is_empty() {
        format!("## Goal\n\n{goal}")
    } else {
        format!("{instructions}\n\n## Goal\n\n{goal}")
    }
}

/// Build the ordered message list for the next LM call.
///
/// The goal message always leads. Each assistant response becomes one
/// assistant message and each tool output its own tool-result message, so
/// a batch of N outputs yields N messages.
pub fn build_messages(history: &[HistoryEntry], instructions: &str, goal: &str) -> Vec<Message> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(Message::user(goal_message(instructions, goal)));

    for entry in history {
        match entry {
            HistoryEntry::AssistantResponse {
                text, tool_calls, ..
            } => {
                let mut content = Vec::with_capacity(tool_calls.len() + 1);
                if !text.is_empty() {
                    content.push(Content::text(text.as_str()));
                }
                content.extend(
                    tool_calls
                        .iter()
                        .map(|c| Content::tool_call(&c.id, &c.name, c.arguments.clone())),
                );
                messages.push(Message::assistant(content));
            }
            HistoryEntry::ToolResults { outputs, .. } => {
                messages.extend(outputs.iter().map(|output| {
                    Message::tool_result(
                        &output.call.id,
                        &output.call.name,
                        vec![Content::text(output.summary.as_str())],
                        !output.success,
                    )
                }));
            }
        }
    }

    messages
}

/// The non-empty assistant texts of every turn, joined by blank lines
pub fn accumulated_results(history: &[HistoryEntry]) -> String {
    history
        .iter()
        .filter_map(HistoryEntry::assistant_text)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}
