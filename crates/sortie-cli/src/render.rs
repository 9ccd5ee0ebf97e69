//! Terminal rendering of monitor snapshots

use sortie_agent::{Conversation, ConversationId, ConversationStatus, ResultsView, Snapshot};
use std::collections::HashMap;
use std::io::{self, Write};

const GOAL_PREVIEW_CHARS: usize = 60;

/// How snapshots are written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// One status line per changed conversation
    Text,
    /// Every snapshot as one JSON line
    Json,
}

/// Truncate a string to `max` characters, appending "..." if truncated.
/// Operates on Unicode char boundaries, not bytes.
pub fn truncate_chars(s: &str, max: usize) -> String {
    let mut chars = s.chars();
    let truncated: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{}...", truncated)
    } else {
        truncated
    }
}

/// The single status line shown for a conversation
pub fn format_line(conversation: &Conversation) -> String {
    let label = conversation
        .title
        .as_deref()
        .unwrap_or(conversation.goal.as_str())
        .replace('\n', " ");
    format!(
        "[#{}] {:<17} turn {}/{} tokens {}  {}",
        conversation.id,
        conversation.status.as_str(),
        conversation.current_turn,
        conversation.max_turns,
        conversation.total_tokens,
        truncate_chars(&label, GOAL_PREVIEW_CHARS)
    )
}

/// The closing block for a finished conversation
pub fn format_results(view: &ResultsView) -> String {
    let body = match (&view.error, &view.results) {
        (Some(error), _) => format!("error: {error}"),
        (None, Some(results)) if !results.is_empty() => results.clone(),
        _ => "(no output)".to_string(),
    };
    format!("=== #{} {} ===\n{}\n", view.id, view.status, body)
}

/// Writes snapshots, suppressing lines that have not changed
pub struct Renderer<W: Write> {
    out: W,
    mode: OutputMode,
    seen: HashMap<ConversationId, (ConversationStatus, u32, u64)>,
}

impl<W: Write> Renderer<W> {
    pub fn new(out: W, mode: OutputMode) -> Self {
        Self {
            out,
            mode,
            seen: HashMap::new(),
        }
    }

    pub fn render(&mut self, snapshot: &Snapshot) -> io::Result<()> {
        match self.mode {
            OutputMode::Json => {
                let line = serde_json::to_string(snapshot).map_err(io::Error::other)?;
                writeln!(self.out, "{line}")?;
            }
            OutputMode::Text => {
                let mut conversations: Vec<_> = snapshot.conversations.iter().collect();
                conversations.sort_by_key(|c| c.id);

                for conversation in conversations {
                    let key = (
                        conversation.status,
                        conversation.current_turn,
                        conversation.total_tokens,
                    );
                    if self.seen.get(&conversation.id) == Some(&key) {
                        continue;
                    }
                    self.seen.insert(conversation.id, key);
                    writeln!(self.out, "{}", format_line(conversation))?;
                }
            }
        }
        self.out.flush()
    }

    pub fn render_results(&mut self, view: &ResultsView) -> io::Result<()> {
        match self.mode {
            OutputMode::Json => {
                let line = serde_json::to_string(view).map_err(io::Error::other)?;
                writeln!(self.out, "{line}")?;
            }
            OutputMode::Text => write!(self.out, "{}", format_results(view))?,
        }
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
