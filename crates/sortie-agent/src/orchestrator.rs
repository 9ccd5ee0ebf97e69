//! Instruction resolution in front of the engine

use async_trait::async_trait;
use serde_json::Value;
use sortie_ai::Model;
use std::path::PathBuf;
use std::sync::Arc;

use crate::engine::{ConversationResult, ConversationTask, Engine, RunRequest};
use crate::error::{Error, Result};

/// Separates resolved instructions from appended context file content
pub const CONTEXT_SECTION_MARKER: &str = "\n\n## Context Files\n\n";

/// Where a conversation's instructions come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstructionSource {
    /// Literal text, used as-is
    Text(String),
    /// Files concatenated by the instruction assembler
    Files(Vec<PathBuf>),
    /// Chosen by the instruction selector
    Auto,
}

impl InstructionSource {
    /// Parse the loosely-typed shape callers send: a string, an array of
    /// path strings, or `{"auto": true}`. Anything else is rejected.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::String(text) => Ok(Self::Text(text.clone())),
            Value::Array(_) => parse_paths(value, "instructions").map(Self::Files),
            Value::Object(map) if map.len() == 1 && map.get("auto") == Some(&Value::Bool(true)) => {
                Ok(Self::Auto)
            }
            other => Err(Error::Validation(format!(
                "instructions must be a string, a list of file paths or {{\"auto\": true}}, got {}",
                describe(other)
            ))),
        }
    }
}

/// Parse a list of context file paths. `null` means none.
pub fn parse_context_files(value: &Value) -> Result<Vec<PathBuf>> {
    match value {
        Value::Null => Ok(Vec::new()),
        _ => parse_paths(value, "context files"),
    }
}

fn parse_paths(value: &Value, what: &str) -> Result<Vec<PathBuf>> {
    let Value::Array(items) = value else {
        return Err(Error::Validation(format!(
            "{what} must be a list of file paths, got {}",
            describe(value)
        )));
    };

    items
        .iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::String(path) if !path.trim().is_empty() => Ok(PathBuf::from(path)),
            other => Err(Error::Validation(format!(
                "{what}[{i}] must be a non-empty path string, got {}",
                describe(other)
            ))),
        })
        .collect()
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Concatenates instruction files into one text
#[async_trait]
pub trait InstructionAssembler: Send + Sync {
    /// Each file's content prefixed by a `From: <name>` header, joined by
    /// blank lines. No paths yields an empty string.
    async fn assemble(&self, paths: &[PathBuf]) -> Result<String>;
}

/// Picks instructions automatically for a goal
#[async_trait]
pub trait InstructionSelector: Send + Sync {
    async fn select(&self, goal: &str) -> Result<String>;
}

/// A request to start a conversation
#[derive(Debug, Clone)]
pub struct ConversationRequest {
    pub goal: String,
    pub instructions: InstructionSource,
    pub context_files: Vec<PathBuf>,
    pub model: Model,
    pub max_turns: u32,
    pub caller: Option<String>,
    pub title: Option<String>,
}

/// Resolves instructions, then hands the conversation to the engine.
///
/// All validation happens before the store sees the conversation.
pub struct Orchestrator {
    engine: Engine,
    assembler: Arc<dyn InstructionAssembler>,
    selector: Option<Arc<dyn InstructionSelector>>,
}

impl Orchestrator {
    pub fn new(engine: Engine, assembler: Arc<dyn InstructionAssembler>) -> Self {
        Self {
            engine,
            assembler,
            selector: None,
        }
    }

    pub fn with_selector(mut self, selector: Arc<dyn InstructionSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Resolve instructions and start the conversation on its own task
    pub async fn start(&self, request: ConversationRequest) -> Result<ConversationTask> {
        let run = self.prepare(request).await?;
        Ok(self.engine.spawn(run))
    }

    /// Resolve instructions and run the conversation inline
    pub async fn run(&self, request: ConversationRequest) -> Result<ConversationResult> {
        let run = self.prepare(request).await?;
        Ok(self.engine.run(run).await)
    }

    async fn prepare(&self, request: ConversationRequest) -> Result<RunRequest> {
        if request.goal.trim().is_empty() {
            return Err(Error::Validation("goal must not be empty".into()));
        }
        if request.max_turns == 0 {
            return Err(Error::Validation("max turns must be at least 1".into()));
        }

        let instructions = self
            .resolve_instructions(&request.instructions, &request.context_files, &request.goal)
            .await?;

        Ok(RunRequest {
            goal: request.goal,
            instructions,
            model: request.model,
            max_turns: request.max_turns,
            caller: request.caller,
            title: request.title,
        })
    }

    /// Produce the single instruction string the engine receives
    pub async fn resolve_instructions(
        &self,
        source: &InstructionSource,
        context_files: &[PathBuf],
        goal: &str,
    ) -> Result<String> {
        let mut instructions = match source {
            InstructionSource::Text(text) => text.clone(),
            InstructionSource::Files(paths) => self.assembler.assemble(paths).await?,
            InstructionSource::Auto => {
                let selector = self.selector.as_ref().ok_or_else(|| {
                    Error::Instructions("automatic selection is not configured".into())
                })?;
                selector.select(goal).await?
            }
        };

        if !context_files.is_empty() {
            let context = self.assembler.assemble(context_files).await?;
            if !context.is_empty() {
                instructions.push_str(CONTEXT_SECTION_MARKER);
                instructions.push_str(&context);
            }
        }

        tracing::debug!(chars = instructions.len(), "instructions resolved");
        Ok(instructions)
    }
}
