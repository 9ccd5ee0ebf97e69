//! Turn classification: decide whether a conversation keeps going.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

use crate::conversation::ConversationStatus;

/// Emitted by the model when it considers the goal met
pub const COMPLETION_MARKER: &str = "~~~GOAL-ACHIEVED~~~";

/// Emitted by the model when it wants another turn without calling tools
pub const CONTINUING_MARKER: &str = "~~~CONTINUING~~~";

static COMPLETION_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:completed|accomplished)\b|\bsuccessfully\s+finished\b").unwrap()
});

/// Why a conversation continued or stopped after a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeReason {
    ToolsExecuting,
    AgentContinuing,
    TaskComplete,
    AgentFinished,
    MaxTurnsReached,
    Cancelled,
    Error,
}

impl OutcomeReason {
    /// Status the store should hold after this outcome
    pub fn status(self) -> ConversationStatus {
        match self {
            OutcomeReason::ToolsExecuting | OutcomeReason::AgentContinuing => {
                ConversationStatus::Working
            }
            OutcomeReason::TaskComplete => ConversationStatus::TaskComplete,
            OutcomeReason::AgentFinished => ConversationStatus::AgentFinished,
            OutcomeReason::MaxTurnsReached => ConversationStatus::MaxTurnsReached,
            OutcomeReason::Cancelled => ConversationStatus::Cancelled,
            OutcomeReason::Error => ConversationStatus::Error,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeReason::ToolsExecuting => "tools-executing",
            OutcomeReason::AgentContinuing => "agent-continuing",
            OutcomeReason::TaskComplete => "task-complete",
            OutcomeReason::AgentFinished => "agent-finished",
            OutcomeReason::MaxTurnsReached => "max-turns-reached",
            OutcomeReason::Cancelled => "cancelled",
            OutcomeReason::Error => "error",
        }
    }
}

impl fmt::Display for OutcomeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The classifier's verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub should_continue: bool,
    pub reason: OutcomeReason,
}

impl Outcome {
    fn proceed(reason: OutcomeReason) -> Self {
        Self {
            should_continue: true,
            reason,
        }
    }

    fn stop(reason: OutcomeReason) -> Self {
        Self {
            should_continue: false,
            reason,
        }
    }
}

/// Classify the latest response.
///
/// Requested tool calls win over anything the text says. The explicit
/// completion marker beats the continuing marker, which in turn beats the
/// completion keywords. A verdict that would continue past the last
/// permitted turn becomes `max-turns-reached`; a terminal verdict on the
/// last turn keeps its own reason. Pending tool calls on the last turn are
/// therefore discarded.
pub fn determine_outcome(
    text: Option<&str>,
    has_tool_calls: bool,
    current_turn: u32,
    max_turns: u32,
) -> Outcome {
    let verdict = classify_response(text, has_tool_calls);
    if verdict.should_continue && current_turn >= max_turns {
        return Outcome::stop(OutcomeReason::MaxTurnsReached);
    }
    verdict
}

fn classify_response(text: Option<&str>, has_tool_calls: bool) -> Outcome {
    if has_tool_calls {
        return Outcome::proceed(OutcomeReason::ToolsExecuting);
    }

    let Some(text) = text else {
        return Outcome::stop(OutcomeReason::AgentFinished);
    };

    if text.contains(COMPLETION_MARKER) {
        Outcome::stop(OutcomeReason::TaskComplete)
    } else if text.contains(CONTINUING_MARKER) {
        Outcome::proceed(OutcomeReason::AgentContinuing)
    } else if COMPLETION_KEYWORDS.is_match(text) {
        Outcome::stop(OutcomeReason::TaskComplete)
    } else {
        Outcome::stop(OutcomeReason::AgentFinished)
    }
}
