//! Lifecycle events emitted by the store and the engine

use serde::{Deserialize, Serialize};

use crate::conversation::{ConversationId, ConversationStatus};
use crate::outcome::OutcomeReason;

/// Events describing what happened to a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationEvent {
    /// A record was added to the store
    Registered { id: ConversationId },

    /// A record was mutated in place
    Updated {
        id: ConversationId,
        status: ConversationStatus,
    },

    /// A record was marked cancelled
    Cancelled { id: ConversationId },

    /// A record was removed from the store
    Deleted { id: ConversationId },

    /// A new turn started
    TurnStart { id: ConversationId, turn: u32 },

    /// Tool execution started
    ToolExecutionStart {
        id: ConversationId,
        tool_call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    /// Tool execution progress update (emitted by tools during execution)
    ToolExecutionUpdate {
        id: ConversationId,
        tool_call_id: String,
        tool_name: String,
        content: String,
    },

    /// Tool execution completed
    ToolExecutionEnd {
        id: ConversationId,
        tool_call_id: String,
        tool_name: String,
        summary: String,
        success: bool,
    },

    /// The engine reached a terminal outcome
    Done {
        id: ConversationId,
        reason: OutcomeReason,
    },

    /// The LM call failed and the conversation ended in error
    Error { id: ConversationId, message: String },
}

impl ConversationEvent {
    /// The conversation this event concerns
    pub fn id(&self) -> ConversationId {
        match self {
            ConversationEvent::Registered { id }
            | ConversationEvent::Updated { id, .. }
            | ConversationEvent::Cancelled { id }
            | ConversationEvent::Deleted { id }
            | ConversationEvent::TurnStart { id, .. }
            | ConversationEvent::ToolExecutionStart { id, .. }
            | ConversationEvent::ToolExecutionUpdate { id, .. }
            | ConversationEvent::ToolExecutionEnd { id, .. }
            | ConversationEvent::Done { id, .. }
            | ConversationEvent::Error { id, .. } => *id,
        }
    }

    /// Whether the event changes what a snapshot of the store would show
    pub fn affects_state(&self) -> bool {
        !matches!(
            self,
            ConversationEvent::ToolExecutionStart { .. }
                | ConversationEvent::ToolExecutionUpdate { .. }
        )
    }

    /// Check if this is a terminal event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConversationEvent::Done { .. } | ConversationEvent::Error { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_tagged() {
        let event = ConversationEvent::Done {
            id: ConversationId::new(3),
            reason: OutcomeReason::TaskComplete,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "done");
        assert_eq!(json["id"], 3);
        assert_eq!(json["reason"], "task-complete");
    }

    #[test]
    fn test_terminal_and_state_flags() {
        let id = ConversationId::new(1);
        assert!(ConversationEvent::Error { id, message: "x".into() }.is_terminal());
        assert!(!ConversationEvent::TurnStart { id, turn: 1 }.is_terminal());
        assert!(ConversationEvent::Deleted { id }.affects_state());
        assert!(
            !ConversationEvent::ToolExecutionUpdate {
                id,
                tool_call_id: "c".into(),
                tool_name: "t".into(),
                content: "50%".into(),
            }
            .affects_state()
        );
    }
}
