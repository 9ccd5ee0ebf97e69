//! Conversation records: identity, status and the fields the store tracks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::handle::CancelHandle;

/// Opaque conversation identity, assigned monotonically by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(u64);

impl ConversationId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw numeric value
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ConversationId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Lifecycle status of a conversation.
///
/// `Started` and `Working` are live; every other variant is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConversationStatus {
    Started,
    Working,
    TaskComplete,
    MaxTurnsReached,
    AgentFinished,
    Cancelled,
    Error,
}

impl ConversationStatus {
    pub const ALL: [ConversationStatus; 7] = [
        ConversationStatus::Started,
        ConversationStatus::Working,
        ConversationStatus::TaskComplete,
        ConversationStatus::MaxTurnsReached,
        ConversationStatus::AgentFinished,
        ConversationStatus::Cancelled,
        ConversationStatus::Error,
    ];

    /// Whether no further LM call will be issued from this status
    pub fn is_terminal(self) -> bool {
        !matches!(self, ConversationStatus::Started | ConversationStatus::Working)
    }

    /// The transition table: `started -> working -> {terminal}`, with
    /// `working` looping on itself and `started` allowed to end directly.
    pub fn can_transition_to(self, next: ConversationStatus) -> bool {
        use ConversationStatus::*;
        match (self, next) {
            (Started, Started) => false,
            (Started, _) => true,
            (Working, Started) => false,
            (Working, _) => true,
            (TaskComplete | MaxTurnsReached | AgentFinished | Cancelled | Error, _) => false,
        }
    }

    /// Kebab-case label used on the wire and in logs
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationStatus::Started => "started",
            ConversationStatus::Working => "working",
            ConversationStatus::TaskComplete => "task-complete",
            ConversationStatus::MaxTurnsReached => "max-turns-reached",
            ConversationStatus::AgentFinished => "agent-finished",
            ConversationStatus::Cancelled => "cancelled",
            ConversationStatus::Error => "error",
        }
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A conversation record as held by the store.
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub goal: String,
    pub model: String,
    pub caller: Option<String>,
    pub title: Option<String>,
    pub status: ConversationStatus,
    pub current_turn: u32,
    pub max_turns: u32,
    pub total_tokens: u64,
    pub started_at: DateTime<Utc>,
    pub cancelled: bool,
    #[serde(skip)]
    pub cancel_handle: Option<CancelHandle>,
    pub results: Option<String>,
    pub error: Option<String>,
}

/// Caller-supplied content for a new record; the store fills in the rest.
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub goal: String,
    pub model: String,
    pub caller: Option<String>,
    pub title: Option<String>,
    pub max_turns: u32,
    pub cancel_handle: Option<CancelHandle>,
}

/// A partial update. Only the fields that are `Some` are merged.
#[derive(Debug, Clone, Default)]
pub struct ConversationUpdate {
    pub status: Option<ConversationStatus>,
    pub current_turn: Option<u32>,
    pub total_tokens: Option<u64>,
    pub title: Option<String>,
    pub results: Option<String>,
    pub error: Option<String>,
    pub cancel_handle: Option<CancelHandle>,
}

impl ConversationUpdate {
    pub fn status(status: ConversationStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_turn(mut self, turn: u32) -> Self {
        self.current_turn = Some(turn);
        self
    }

    pub fn with_total_tokens(mut self, tokens: u64) -> Self {
        self.total_tokens = Some(tokens);
        self
    }

    pub fn with_results(mut self, results: impl Into<String>) -> Self {
        self.results = Some(results.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.current_turn.is_none()
            && self.total_tokens.is_none()
            && self.title.is_none()
            && self.results.is_none()
            && self.error.is_none()
            && self.cancel_handle.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_status() -> impl Strategy<Value = ConversationStatus> {
        proptest::sample::select(ConversationStatus::ALL.to_vec())
    }

    #[test]
    fn test_live_paths() {
        use ConversationStatus::*;
        assert!(Started.can_transition_to(Working));
        assert!(Working.can_transition_to(Working));
        assert!(Working.can_transition_to(TaskComplete));
        assert!(Started.can_transition_to(Cancelled));
        assert!(Started.can_transition_to(Error));
    }

    #[test]
    fn test_nothing_returns_to_started() {
        for status in ConversationStatus::ALL {
            assert!(!status.can_transition_to(ConversationStatus::Started), "{status}");
        }
    }

    #[test]
    fn test_status_wire_names() {
        let json = serde_json::to_string(&ConversationStatus::MaxTurnsReached).unwrap();
        assert_eq!(json, "\"max-turns-reached\"");
        assert_eq!(ConversationStatus::AgentFinished.to_string(), "agent-finished");
    }

    #[test]
    fn test_id_roundtrips_through_display() {
        let id = ConversationId::new(42);
        assert_eq!(id.to_string().parse::<ConversationId>().unwrap(), id);
    }

    #[test]
    fn test_update_builders() {
        let update = ConversationUpdate::status(ConversationStatus::Working).with_turn(2);
        assert_eq!(update.status, Some(ConversationStatus::Working));
        assert_eq!(update.current_turn, Some(2));
        assert!(update.results.is_none());
        assert!(ConversationUpdate::default().is_empty());
    }

    proptest! {
        #[test]
        fn terminal_states_have_no_exits(from in arb_status(), to in arb_status()) {
            if from.is_terminal() {
                prop_assert!(!from.can_transition_to(to));
            }
        }

        #[test]
        fn live_states_reach_every_terminal(from in arb_status(), to in arb_status()) {
            if !from.is_terminal() && to.is_terminal() {
                prop_assert!(from.can_transition_to(to));
            }
        }
    }
}
