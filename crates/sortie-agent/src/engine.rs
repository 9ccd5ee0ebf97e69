//! The per-conversation control loop.
//!
//! Each turn builds messages from history, calls the model, classifies the
//! response and either runs the requested tools, loops, or finalizes the
//! record. Cancellation is checked at the top of every turn; the cancel
//! handle additionally aborts an in-flight model or tool call.

use sortie_ai::Model;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::conversation::{
    ConversationId, ConversationStatus, ConversationUpdate, NewConversation,
};
use crate::error::Error;
use crate::events::ConversationEvent;
use crate::handle::CancelHandle;
use crate::history::{HistoryEntry, accumulated_results, build_messages};
use crate::outcome::{COMPLETION_MARKER, CONTINUING_MARKER, OutcomeReason, determine_outcome};
use crate::store::ConversationStore;
use crate::tool::{BoxedTool, ToolExecutor};
use crate::transport::{Transport, TurnConfig};

/// Default system prompt: tells the model how to signal its progress.
pub fn default_system_prompt() -> String {
    format!(
        "You are an autonomous agent working toward a single goal over several turns.\n\
         Use the available tools whenever they help. When the goal is fully achieved, \
         end your reply with {COMPLETION_MARKER}. If you need another turn without \
         calling a tool, end your reply with {CONTINUING_MARKER}. A reply with neither \
         marker and no tool calls ends the conversation."
    )
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// System prompt sent with every turn
    pub system_prompt: Option<String>,
    /// Maximum tokens per response
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// How many tool calls of one batch may run at once
    pub tool_concurrency: usize,
    /// Maximum characters kept from each tool output
    pub summary_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            system_prompt: Some(default_system_prompt()),
            max_tokens: Some(8192),
            temperature: None,
            tool_concurrency: 4,
            summary_limit: 4000,
        }
    }
}

/// Everything needed to run one conversation
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub goal: String,
    /// Fully resolved instruction text
    pub instructions: String,
    pub model: Model,
    /// Turn limit. A direct caller passing 0 gets 1; the orchestrator
    /// rejects 0 before it reaches the engine.
    pub max_turns: u32,
    pub caller: Option<String>,
    pub title: Option<String>,
}

/// Terminal result of a conversation
#[derive(Debug, Clone)]
pub struct ConversationResult {
    pub id: ConversationId,
    pub history: Vec<HistoryEntry>,
    pub reason: OutcomeReason,
    /// Text of the last model response, if it had any
    pub final_response: Option<String>,
    /// Assistant texts of every turn, joined by blank lines
    pub results: String,
    pub turns: u32,
    pub total_tokens: u64,
    pub error: Option<String>,
}

/// A conversation running on its own tokio task
pub struct ConversationTask {
    pub id: ConversationId,
    handle: CancelHandle,
    store: Arc<ConversationStore>,
    join: JoinHandle<ConversationResult>,
}

impl ConversationTask {
    /// Handle for cancelling this conversation
    pub fn cancel_handle(&self) -> CancelHandle {
        self.handle.clone()
    }

    /// Wait for the terminal result.
    ///
    /// If the task died without finalizing (a panic in the transport, say),
    /// the record is moved to `error` here so it never stays live.
    pub async fn join(self) -> ConversationResult {
        let id = self.id;
        match self.join.await {
            Ok(result) => result,
            Err(e) => {
                let message = format!("conversation task failed: {e}");
                tracing::error!(conversation = %id, "{}", message);
                self.store.update(
                    id,
                    ConversationUpdate::status(ConversationStatus::Error).with_error(&message),
                );
                self.store.emit(ConversationEvent::Error {
                    id,
                    message: message.clone(),
                });

                let record = self.store.get(id);
                ConversationResult {
                    id,
                    history: Vec::new(),
                    reason: OutcomeReason::Error,
                    final_response: None,
                    results: record
                        .as_ref()
                        .and_then(|r| r.results.clone())
                        .unwrap_or_default(),
                    turns: record.as_ref().map_or(0, |r| r.current_turn),
                    total_tokens: record.as_ref().map_or(0, |r| r.total_tokens),
                    error: Some(message),
                }
            }
        }
    }
}

/// Drives conversations. Cheap to clone; clones share the store, transport
/// and tools.
#[derive(Clone)]
pub struct Engine {
    config: EngineConfig,
    store: Arc<ConversationStore>,
    transport: Arc<dyn Transport>,
    tools: Arc<ToolExecutor>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<ConversationStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let tools = ToolExecutor::new(vec![])
            .with_concurrency(config.tool_concurrency)
            .with_summary_limit(config.summary_limit);
        Self {
            config,
            store,
            transport,
            tools: Arc::new(tools),
        }
    }

    /// Replace the tool set offered to the model
    pub fn with_tools(mut self, tools: Vec<BoxedTool>) -> Self {
        let executor = ToolExecutor::new(tools)
            .with_concurrency(self.config.tool_concurrency)
            .with_summary_limit(self.config.summary_limit);
        self.tools = Arc::new(executor);
        self
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register the record and run the conversation to completion inline
    pub async fn run(&self, request: RunRequest) -> ConversationResult {
        let (id, handle) = self.register(&request);
        self.drive_instrumented(id, handle, request).await
    }

    /// Register the record now and run the conversation on its own task
    pub fn spawn(&self, request: RunRequest) -> ConversationTask {
        let (id, handle) = self.register(&request);
        let engine = self.clone();
        let task_handle = handle.clone();
        let join = tokio::spawn(async move {
            engine.drive_instrumented(id, task_handle, request).await
        });
        ConversationTask {
            id,
            handle,
            store: Arc::clone(&self.store),
            join,
        }
    }

    fn register(&self, request: &RunRequest) -> (ConversationId, CancelHandle) {
        let handle = CancelHandle::new();
        let id = self.store.register(NewConversation {
            goal: request.goal.clone(),
            model: request.model.id.clone(),
            caller: request.caller.clone(),
            title: request.title.clone(),
            max_turns: request.max_turns.max(1),
            cancel_handle: Some(handle.clone()),
        });
        (id, handle)
    }

    async fn drive_instrumented(
        &self,
        id: ConversationId,
        handle: CancelHandle,
        request: RunRequest,
    ) -> ConversationResult {
        let span = tracing::info_span!("conversation", id = %id);
        self.drive(id, handle, request).instrument(span).await
    }

    /// A deleted record counts as cancelled
    fn is_cancelled(&self, id: ConversationId, handle: &CancelHandle) -> bool {
        handle.is_cancelled() || self.store.is_cancelled(id).unwrap_or(true)
    }

    async fn drive(
        &self,
        id: ConversationId,
        handle: CancelHandle,
        request: RunRequest,
    ) -> ConversationResult {
        let max_turns = request.max_turns.max(1);
        let turn_config = TurnConfig {
            system_prompt: self.config.system_prompt.clone(),
            tools: self.tools.api_tools(),
            model: request.model.clone(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };
        let events = self.store.event_sender();

        let mut run = RunState {
            id,
            history: Vec::new(),
            turn: 0,
            total_tokens: 0,
            final_response: None,
        };

        tracing::info!(goal = %request.goal, max_turns, "conversation started");

        loop {
            if self.is_cancelled(id, &handle) {
                return self.finalize(run, OutcomeReason::Cancelled, None);
            }

            run.turn += 1;
            self.store
                .update(id, ConversationUpdate::default().with_turn(run.turn));
            self.store.emit(ConversationEvent::TurnStart { id, turn: run.turn });
            tracing::debug!(turn = run.turn, "turn started");

            let messages = build_messages(&run.history, &request.instructions, &request.goal);
            let completion = match self
                .transport
                .complete(messages, &turn_config, handle.token())
                .await
            {
                Ok(completion) => completion,
                Err(e) if e.is_cancellation() => {
                    return self.finalize(run, OutcomeReason::Cancelled, None);
                }
                Err(e) => {
                    let retryable = matches!(&e, Error::Ai(inner) if inner.is_retryable());
                    tracing::warn!(turn = run.turn, retryable, "model call failed: {}", e);
                    return self.finalize(run, OutcomeReason::Error, Some(e.to_string()));
                }
            };

            run.total_tokens += completion.usage.total();
            self.store.update(
                id,
                ConversationUpdate::default().with_total_tokens(run.total_tokens),
            );

            let outcome = determine_outcome(
                completion.text.as_deref(),
                !completion.tool_calls.is_empty(),
                run.turn,
                max_turns,
            );
            tracing::debug!(turn = run.turn, reason = %outcome.reason, "turn classified");

            run.final_response = completion.text.clone();
            run.history.push(HistoryEntry::AssistantResponse {
                turn: run.turn,
                text: completion.text.unwrap_or_default(),
                tool_calls: completion.tool_calls.clone(),
            });

            match outcome.reason {
                OutcomeReason::ToolsExecuting => {
                    let outputs = self
                        .tools
                        .execute_batch(id, &completion.tool_calls, &handle.token(), &events)
                        .await;
                    run.history.push(HistoryEntry::ToolResults {
                        turn: run.turn,
                        outputs,
                    });
                    self.store
                        .update(id, ConversationUpdate::status(outcome.reason.status()));
                }
                OutcomeReason::AgentContinuing => {
                    self.store
                        .update(id, ConversationUpdate::status(outcome.reason.status()));
                }
                reason => return self.finalize(run, reason, None),
            }
        }
    }

    /// Write the terminal state to the store and build the result
    fn finalize(
        &self,
        run: RunState,
        reason: OutcomeReason,
        error: Option<String>,
    ) -> ConversationResult {
        let id = run.id;
        let results = accumulated_results(&run.history);

        match reason {
            OutcomeReason::Cancelled => {
                self.store.mark_cancelled(id);
                if !results.is_empty() {
                    self.store
                        .update(id, ConversationUpdate::default().with_results(&results));
                }
            }
            OutcomeReason::Error => {
                let message = error.clone().unwrap_or_else(|| "unknown error".to_string());
                self.store.update(
                    id,
                    ConversationUpdate::status(reason.status())
                        .with_error(&message)
                        .with_results(&results),
                );
            }
            _ => {
                self.store.update(
                    id,
                    ConversationUpdate::status(reason.status()).with_results(&results),
                );
            }
        }

        match &error {
            Some(message) => self.store.emit(ConversationEvent::Error {
                id,
                message: message.clone(),
            }),
            None => self.store.emit(ConversationEvent::Done { id, reason }),
        }

        tracing::info!(
            %reason,
            turns = run.turn,
            total_tokens = run.total_tokens,
            "conversation finished"
        );

        ConversationResult {
            id,
            history: run.history,
            reason,
            final_response: run.final_response,
            results,
            turns: run.turn,
            total_tokens: run.total_tokens,
            error,
        }
    }
}

/// Loop-local bookkeeping for one conversation
struct RunState {
    id: ConversationId,
    history: Vec<HistoryEntry>,
    turn: u32,
    total_tokens: u64,
    final_response: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::history::ToolCallRequest;
    use crate::tool::{Tool, ToolResult};
    use crate::transport::Completion;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use sortie_ai::Usage;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    type Hook = Box<dyn Fn(usize) + Send + Sync>;

    /// Replays canned completions; `hook` runs with the call index before
    /// each response is returned.
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<Completion>>>,
        calls: AtomicUsize,
        seen: Mutex<Vec<usize>>,
        hook: Option<Hook>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<Completion>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
                hook: None,
            }
        }

        fn with_hook(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
            self.hook = Some(Box::new(hook));
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn complete(
            &self,
            messages: Vec<sortie_ai::Message>,
            _config: &TurnConfig,
            _cancel: CancellationToken,
        ) -> Result<Completion> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push(messages.len());
            if let Some(hook) = &self.hook {
                hook(index);
            }
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(text("(script exhausted)")))
        }
    }

    /// Blocks until cancelled, like a slow provider
    struct HangingTransport;

    #[async_trait]
    impl Transport for HangingTransport {
        async fn complete(
            &self,
            _messages: Vec<sortie_ai::Message>,
            _config: &TurnConfig,
            cancel: CancellationToken,
        ) -> Result<Completion> {
            cancel.cancelled().await;
            Err(sortie_ai::Error::Aborted.into())
        }
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echoes input"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        async fn execute(
            &self,
            _tool_call_id: &str,
            arguments: serde_json::Value,
            _cancel: CancellationToken,
        ) -> ToolResult {
            ToolResult::text(arguments["text"].as_str().unwrap_or_default())
        }
    }

    fn usage(total: u32) -> Usage {
        Usage {
            input: total,
            ..Default::default()
        }
    }

    fn text(t: &str) -> Completion {
        Completion::new(Some(t.to_string()), vec![], usage(10))
    }

    fn tool_call(id: &str) -> Completion {
        Completion::new(
            None,
            vec![ToolCallRequest::new(id, "echo", json!({"text": id}))],
            usage(10),
        )
    }

    fn request(max_turns: u32) -> RunRequest {
        RunRequest {
            goal: "Tidy the repo".into(),
            instructions: "Be careful.".into(),
            model: sortie_ai::models::resolve_model(sortie_ai::Provider::Anthropic, "test"),
            max_turns,
            caller: None,
            title: None,
        }
    }

    fn engine(transport: Arc<dyn Transport>) -> Engine {
        Engine::new(
            EngineConfig::default(),
            Arc::new(ConversationStore::new()),
            transport,
        )
        .with_tools(vec![Arc::new(EchoTool)])
    }

    fn count_entries(history: &[HistoryEntry]) -> (usize, usize) {
        let assistants = history
            .iter()
            .filter(|e| matches!(e, HistoryEntry::AssistantResponse { .. }))
            .count();
        (assistants, history.len() - assistants)
    }

    #[tokio::test]
    async fn test_goal_marker_on_single_turn_completes() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(text("~~~GOAL-ACHIEVED~~~"))]));
        let engine = engine(transport.clone());

        let result = engine.run(request(1)).await;

        assert_eq!(result.reason, OutcomeReason::TaskComplete);
        assert_eq!(transport.calls(), 1);
        let record = engine.store().get(result.id).unwrap();
        assert_eq!(record.status, ConversationStatus::TaskComplete);
        assert_eq!(record.current_turn, 1);
    }

    #[tokio::test]
    async fn test_tools_then_plain_text_finishes() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(tool_call("t1")),
            Ok(tool_call("t2")),
            Ok(text("Here is a summary of what changed.")),
        ]));
        let engine = engine(transport.clone());

        let result = engine.run(request(3)).await;

        assert_eq!(result.reason, OutcomeReason::AgentFinished);
        assert_eq!(result.turns, 3);
        assert_eq!(count_entries(&result.history), (3, 2));
        assert_eq!(
            result.final_response.as_deref(),
            Some("Here is a summary of what changed.")
        );

        // goal, then goal + assistant + 1 result, then + assistant + 1 result
        assert_eq!(*transport.seen.lock(), vec![1, 3, 5]);

        let record = engine.store().get(result.id).unwrap();
        assert_eq!(record.current_turn, 3);
        assert_eq!(record.status, ConversationStatus::AgentFinished);
        assert_eq!(record.total_tokens, 30);
    }

    #[tokio::test]
    async fn test_tool_results_follow_their_response() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(tool_call("t1")),
            Ok(text("~~~GOAL-ACHIEVED~~~")),
        ]));
        let result = engine(transport).run(request(5)).await;

        match &result.history[1] {
            HistoryEntry::ToolResults { turn, outputs } => {
                assert_eq!(*turn, 1);
                assert_eq!(outputs.len(), 1);
                assert!(outputs[0].success);
                assert_eq!(outputs[0].summary, "t1");
            }
            other => panic!("expected tool results, got {other:?}"),
        }
        let turns: Vec<_> = result.history.iter().map(HistoryEntry::turn).collect();
        assert!(turns.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_continuing_model_stops_at_exactly_max_turns() {
        for max_turns in 1..=5u32 {
            let script = (0..10).map(|_| Ok(text("Working on it. ~~~CONTINUING~~~"))).collect();
            let transport = Arc::new(ScriptedTransport::new(script));
            let engine = engine(transport.clone());

            let result = engine.run(request(max_turns)).await;

            assert_eq!(result.reason, OutcomeReason::MaxTurnsReached);
            assert_eq!(result.turns, max_turns);
            assert_eq!(transport.calls(), max_turns as usize);
            assert_eq!(
                engine.store().get(result.id).unwrap().current_turn,
                max_turns
            );
        }
    }

    #[tokio::test]
    async fn test_tool_calls_on_last_turn_are_discarded() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(tool_call("t1")),
            Ok(tool_call("t2")),
        ]));
        let result = engine(transport).run(request(2)).await;

        assert_eq!(result.reason, OutcomeReason::MaxTurnsReached);
        assert_eq!(count_entries(&result.history), (2, 1));
    }

    #[tokio::test]
    async fn test_cancel_flag_between_turns_prevents_second_call() {
        let store = Arc::new(ConversationStore::new());
        let hook_store = Arc::clone(&store);
        let transport = Arc::new(
            ScriptedTransport::new(vec![
                Ok(text("Halfway. ~~~CONTINUING~~~")),
                Ok(text("~~~GOAL-ACHIEVED~~~")),
            ])
            .with_hook(move |_| {
                for record in hook_store.list() {
                    hook_store.mark_cancelled(record.id);
                }
            }),
        );
        let engine = Engine::new(EngineConfig::default(), store.clone(), transport.clone());

        let result = engine.run(request(5)).await;

        assert_eq!(result.reason, OutcomeReason::Cancelled);
        assert_eq!(transport.calls(), 1);
        let record = store.get(result.id).unwrap();
        assert_eq!(record.status, ConversationStatus::Cancelled);
        assert!(record.cancelled);
        assert_eq!(record.results.as_deref(), Some("Halfway. ~~~CONTINUING~~~"));
    }

    #[tokio::test]
    async fn test_cancel_handle_aborts_in_flight_call() {
        let engine = engine(Arc::new(HangingTransport));
        let task = engine.spawn(request(5));
        let id = task.id;

        tokio::task::yield_now().await;
        task.cancel_handle().cancel();
        let result = task.join().await;

        assert_eq!(result.reason, OutcomeReason::Cancelled);
        assert_eq!(
            engine.store().get(id).unwrap().status,
            ConversationStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_deleted_in_flight_counts_as_cancelled() {
        let store = Arc::new(ConversationStore::new());
        let hook_store = Arc::clone(&store);
        let transport = Arc::new(
            ScriptedTransport::new(vec![Ok(text("~~~CONTINUING~~~"))]).with_hook(move |_| {
                for record in hook_store.list() {
                    hook_store.delete(record.id);
                }
            }),
        );
        let engine = Engine::new(EngineConfig::default(), store.clone(), transport.clone());

        let result = engine.run(request(5)).await;

        assert_eq!(result.reason, OutcomeReason::Cancelled);
        assert_eq!(transport.calls(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_provider_error_is_terminal_and_not_retried() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(sortie_ai::Error::api("overloaded_error", "busy").into()),
            Ok(text("~~~GOAL-ACHIEVED~~~")),
        ]));
        let engine = engine(transport.clone());

        let result = engine.run(request(5)).await;

        assert_eq!(result.reason, OutcomeReason::Error);
        assert_eq!(transport.calls(), 1);
        let record = engine.store().get(result.id).unwrap();
        assert_eq!(record.status, ConversationStatus::Error);
        assert_eq!(
            record.error.as_deref(),
            Some("API error: busy (type: overloaded_error)")
        );
    }

    #[tokio::test]
    async fn test_failed_tool_is_fed_back_not_fatal() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(Completion::new(
                Some("Trying a tool.".into()),
                vec![ToolCallRequest::new("c1", "does_not_exist", json!({}))],
                usage(5),
            )),
            Ok(text("That tool is missing, so the task is accomplished another way.")),
        ]));
        let result = engine(transport).run(request(5)).await;

        assert_eq!(result.reason, OutcomeReason::TaskComplete);
        match &result.history[1] {
            HistoryEntry::ToolResults { outputs, .. } => {
                assert!(!outputs[0].success);
                assert!(outputs[0].summary.contains("does_not_exist"));
            }
            other => panic!("expected tool results, got {other:?}"),
        }
    }

    struct PanickingTool;

    #[async_trait]
    impl Tool for PanickingTool {
        fn name(&self) -> &str {
            "boom"
        }
        fn description(&self) -> &str {
            "Panics"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        async fn execute(
            &self,
            _tool_call_id: &str,
            _arguments: serde_json::Value,
            _cancel: CancellationToken,
        ) -> ToolResult {
            panic!("tool blew up");
        }
    }

    /// Panics inside the conversation task itself
    struct PanickingTransport;

    #[async_trait]
    impl Transport for PanickingTransport {
        async fn complete(
            &self,
            _messages: Vec<sortie_ai::Message>,
            _config: &TurnConfig,
            _cancel: CancellationToken,
        ) -> Result<Completion> {
            panic!("transport blew up");
        }
    }

    #[tokio::test]
    async fn test_panicking_tool_is_fed_back_not_fatal() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(Completion::new(
                None,
                vec![ToolCallRequest::new("c1", "boom", json!({}))],
                usage(5),
            )),
            Ok(text("The tool failed, so I stopped.")),
        ]));
        let engine = Engine::new(
            EngineConfig::default(),
            Arc::new(ConversationStore::new()),
            transport,
        )
        .with_tools(vec![Arc::new(PanickingTool)]);

        let task = engine.spawn(request(5));
        let result = task.join().await;

        assert_eq!(result.reason, OutcomeReason::AgentFinished);
        match &result.history[1] {
            HistoryEntry::ToolResults { outputs, .. } => {
                assert!(!outputs[0].success);
                assert_eq!(outputs[0].summary, "Tool panicked: tool blew up");
            }
            other => panic!("expected tool results, got {other:?}"),
        }
        assert_eq!(
            engine.store().get(result.id).unwrap().status,
            ConversationStatus::AgentFinished
        );
    }

    #[tokio::test]
    async fn test_dead_task_is_finalized_as_error_on_join() {
        let engine = engine(Arc::new(PanickingTransport));
        let mut rx = engine.store().subscribe();

        let task = engine.spawn(request(5));
        let id = task.id;
        let result = task.join().await;

        assert_eq!(result.reason, OutcomeReason::Error);
        assert_eq!(result.turns, 1);
        assert!(result.error.as_deref().unwrap().contains("panicked"));

        let record = engine.store().get(id).unwrap();
        assert_eq!(record.status, ConversationStatus::Error);
        assert!(record.error.is_some());

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        assert!(matches!(last, Some(ConversationEvent::Error { .. })));
    }

    #[tokio::test]
    async fn test_zero_max_turns_is_treated_as_one() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(text("~~~CONTINUING~~~"))]));
        let engine = engine(transport.clone());

        let result = engine.run(request(0)).await;

        assert_eq!(result.reason, OutcomeReason::MaxTurnsReached);
        assert_eq!(transport.calls(), 1);
        assert_eq!(engine.store().get(result.id).unwrap().max_turns, 1);
    }

    #[tokio::test]
    async fn test_results_accumulate_across_turns() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(text("Read the code. ~~~CONTINUING~~~")),
            Ok(text("Fixed it. ~~~GOAL-ACHIEVED~~~")),
        ]));
        let engine = engine(transport);
        let result = engine.run(request(5)).await;

        assert_eq!(
            result.results,
            "Read the code. ~~~CONTINUING~~~\n\nFixed it. ~~~GOAL-ACHIEVED~~~"
        );
        assert_eq!(
            engine.store().get(result.id).unwrap().results.as_deref(),
            Some(result.results.as_str())
        );
    }

    #[tokio::test]
    async fn test_record_without_caller_stays_absent() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(text("ok"))]));
        let engine = engine(transport);
        let result = engine.run(request(1)).await;
        assert!(engine.store().get(result.id).unwrap().caller.is_none());
    }

    #[tokio::test]
    async fn test_lifecycle_events_end_with_done() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(tool_call("t1")),
            Ok(text("~~~GOAL-ACHIEVED~~~")),
        ]));
        let engine = engine(transport);
        let mut rx = engine.store().subscribe();

        let result = engine.run(request(5)).await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(ConversationEvent::Registered { .. })));
        assert_eq!(
            events.last(),
            Some(&ConversationEvent::Done {
                id: result.id,
                reason: OutcomeReason::TaskComplete
            })
        );
        assert!(events.iter().any(|e| matches!(e, ConversationEvent::TurnStart { turn: 2, .. })));
        assert!(events.iter().any(|e| matches!(e, ConversationEvent::ToolExecutionEnd { .. })));
    }

    #[tokio::test]
    async fn test_concurrent_conversations_share_store() {
        let store = Arc::new(ConversationStore::new());
        let script = (0..8).map(|_| Ok(text("done, task completed"))).collect();
        let transport = Arc::new(ScriptedTransport::new(script));
        let engine = Engine::new(EngineConfig::default(), store.clone(), transport);

        let tasks: Vec<_> = (0..4).map(|_| engine.spawn(request(3))).collect();
        for task in tasks {
            let result = task.join().await;
            assert_eq!(result.reason, OutcomeReason::TaskComplete);
        }
        assert_eq!(store.len(), 4);
        assert!(store.list().iter().all(|r| r.status == ConversationStatus::TaskComplete));
    }
}
