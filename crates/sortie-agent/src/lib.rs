//! sortie-agent: Conversation engine for autonomous agent runs
//!
//! This crate provides the turn loop that drives a goal through multiple LM
//! calls and tool executions, the store that tracks every conversation, and
//! the monitor that lets a presentation layer observe and cancel them.

pub mod conversation;
pub mod engine;
pub mod error;
pub mod events;
pub mod handle;
pub mod history;
pub mod monitor;
pub mod orchestrator;
pub mod outcome;
pub mod store;
pub mod tool;
pub mod transport;

pub use conversation::{
    Conversation, ConversationId, ConversationStatus, ConversationUpdate, NewConversation,
};
pub use engine::{ConversationResult, ConversationTask, Engine, EngineConfig, RunRequest};
pub use error::{Error, Result};
pub use events::ConversationEvent;
pub use handle::CancelHandle;
pub use history::{HistoryEntry, ToolCallRequest, ToolOutput, build_messages};
pub use monitor::{ActionOutcome, Monitor, MonitorAction, ResultsView, Snapshot};
pub use orchestrator::{
    ConversationRequest, InstructionAssembler, InstructionSelector, InstructionSource,
    Orchestrator,
};
pub use outcome::{Outcome, OutcomeReason, determine_outcome};
pub use store::ConversationStore;
pub use tool::{BoxedTool, ProgressSender, Tool, ToolExecutor, ToolResult};
pub use transport::{Completion, ProviderTransport, Transport, TurnConfig};
