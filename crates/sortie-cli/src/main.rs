//! sortie - dispatch autonomous agent conversations from the command line

mod config;
mod instructions;
mod render;
mod tools;

use anyhow::{Context as _, anyhow};
use clap::Parser;
use sortie_agent::{
    ConversationRequest, ConversationStore, Engine, EngineConfig, InstructionSource, Monitor,
    Orchestrator, OutcomeReason, ProviderTransport,
};
use sortie_ai::Provider;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::instructions::{AutoSelector, FsAssembler};
use crate::render::{OutputMode, Renderer};

/// sortie - run goals as autonomous, tool-using LLM conversations
#[derive(Parser, Debug)]
#[command(name = "sortie")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Goal to pursue; repeat to run several conversations concurrently
    #[arg(short, long = "goal", required_unless_present = "init_config")]
    goals: Vec<String>,

    /// Instruction text used as-is
    #[arg(short, long, conflicts_with_all = ["instructions_file", "auto_instructions"])]
    instructions: Option<String>,

    /// Instruction file; repeat to concatenate several
    #[arg(long = "instructions-file", conflicts_with = "auto_instructions")]
    instructions_file: Vec<PathBuf>,

    /// Discover instruction files automatically (AGENTS.md, CLAUDE.md, instructions_dir)
    #[arg(long)]
    auto_instructions: bool,

    /// Extra file appended to the instructions; repeatable
    #[arg(long = "context-file")]
    context_file: Vec<PathBuf>,

    /// Model to use (default: claude-sonnet-4-5-20250929)
    #[arg(short, long)]
    model: Option<String>,

    /// Provider (anthropic, openai, openrouter, ollama)
    #[arg(short, long)]
    provider: Option<String>,

    /// Turns allowed per conversation
    #[arg(long)]
    max_turns: Option<u32>,

    /// Who is dispatching, recorded on each conversation
    #[arg(long)]
    caller: Option<String>,

    /// Display title for the conversations
    #[arg(long)]
    title: Option<String>,

    /// Emit snapshots and results as JSON lines
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

impl Args {
    fn instruction_source(&self) -> InstructionSource {
        if let Some(text) = &self.instructions {
            InstructionSource::Text(text.clone())
        } else if !self.instructions_file.is_empty() {
            InstructionSource::Files(self.instructions_file.clone())
        } else if self.auto_instructions {
            InstructionSource::Auto
        } else {
            InstructionSource::Text(String::new())
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("sortie=debug,sortie_agent=debug,sortie_ai=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    // Initialize config and exit
    if args.init_config {
        let path = config::Config::init().context("Error creating config")?;
        println!("Config file created at: {}", path.display());
        println!("\nExample config:\n{}", config::example_config());
        return Ok(());
    }

    let cfg = config::Config::load();

    // Merge config with CLI args (CLI takes precedence)
    let provider_name = args
        .provider
        .clone()
        .or(cfg.provider.clone())
        .unwrap_or_else(|| "anthropic".to_string());
    let provider =
        Provider::parse(&provider_name).ok_or_else(|| anyhow!("Unknown provider: {provider_name}"))?;
    let model_id = args
        .model
        .clone()
        .or(cfg.model.clone())
        .unwrap_or_else(|| sortie_ai::models::DEFAULT_MODEL_ID.to_string());
    let model = sortie_ai::models::resolve_model(provider, &model_id);
    let max_turns = args
        .max_turns
        .or(cfg.max_turns)
        .unwrap_or(config::DEFAULT_MAX_TURNS);

    let transport = match cfg.get_api_key(provider) {
        Some(key) => ProviderTransport::with_api_key(key),
        None => match provider.api_key_env_var() {
            Some(var) => {
                eprintln!("Error: No API key found for {}", provider.name());
                eprintln!();
                eprintln!("Set your API key with: export {}=your-key", var);
                eprintln!("Or add it to config file: sortie --init-config");
                std::process::exit(1);
            }
            None => ProviderTransport::new(),
        },
    };

    let store = Arc::new(ConversationStore::new());
    let engine = Engine::new(EngineConfig::default(), Arc::clone(&store), Arc::new(transport))
        .with_tools(tools::default_tools());
    let selector = AutoSelector::from_env(cfg.instructions_dir.clone())
        .context("Cannot determine the working directory")?;
    let orchestrator =
        Orchestrator::new(engine, Arc::new(FsAssembler)).with_selector(Arc::new(selector));

    let mode = if args.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };

    // Monitor: store events -> snapshots -> renderer
    let monitor = Arc::new(Monitor::new(Arc::clone(&store)));
    let shutdown = CancellationToken::new();
    let mut snapshots = monitor.subscribe();
    let monitor_task = monitor.spawn(shutdown.clone());

    let render_stop = CancellationToken::new();
    let render_task = {
        let render_stop = render_stop.clone();
        tokio::spawn(async move {
            let mut renderer = Renderer::new(std::io::stdout(), mode);
            loop {
                let snapshot = tokio::select! {
                    biased;
                    received = snapshots.recv() => match received {
                        Ok(snapshot) => snapshot,
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    },
                    _ = render_stop.cancelled() => break,
                };
                if let Err(e) = renderer.render(&snapshot) {
                    tracing::warn!("Failed to write snapshot: {}", e);
                }
            }
            renderer
        })
    };

    // Ctrl-C cancels everything still running
    let interrupt_task = {
        let monitor = Arc::clone(&monitor);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let cancelled = monitor.cancel_all();
                eprintln!("\nCancelling {} conversation(s)...", cancelled);
            }
        })
    };

    let instructions = args.instruction_source();
    let mut tasks = Vec::with_capacity(args.goals.len());
    for goal in &args.goals {
        let request = ConversationRequest {
            goal: goal.clone(),
            instructions: instructions.clone(),
            context_files: args.context_file.clone(),
            model: model.clone(),
            max_turns,
            caller: args.caller.clone(),
            title: args.title.clone(),
        };
        let task = orchestrator.start(request).await?;
        tracing::info!(conversation = %task.id, "dispatched goal");
        tasks.push(task);
    }

    let mut results = Vec::with_capacity(tasks.len());
    for task in tasks {
        results.push(task.join().await);
    }

    interrupt_task.abort();
    shutdown.cancel();
    monitor_task.await?;
    render_stop.cancel();
    let mut renderer = render_task.await?;

    for result in &results {
        if let Some(view) = monitor.show_results(result.id) {
            renderer.render_results(&view)?;
        }
    }

    if results.iter().any(|r| r.reason == OutcomeReason::Error) {
        std::process::exit(1);
    }
    Ok(())
}
