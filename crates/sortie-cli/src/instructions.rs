//! Instruction files from disk
//!
//! `FsAssembler` concatenates explicitly named files. `AutoSelector` finds
//! instructions on its own, loading context files (AGENTS.md or CLAUDE.md) from:
//! 1. Global: ~/.config/sortie/
//! 2. Parent directories: from repo root down to the working directory
//! 3. The working directory itself
//!
//! and then any markdown file in the configured instructions directory whose
//! name shares a word with the goal.

use async_trait::async_trait;
use sortie_agent::{Error, InstructionAssembler, InstructionSelector, Result};
use std::path::{Path, PathBuf};

/// Names of context files to look for (in order of preference)
const CONTEXT_FILE_NAMES: &[&str] = &["AGENTS.md", "CLAUDE.md"];

/// Shortest file-name word that can match a goal
const MIN_MATCH_LEN: usize = 3;

/// Reads instruction files and joins them under `From:` headers
#[derive(Debug, Clone, Copy, Default)]
pub struct FsAssembler;

#[async_trait]
impl InstructionAssembler for FsAssembler {
    async fn assemble(&self, paths: &[PathBuf]) -> Result<String> {
        let mut sections = Vec::with_capacity(paths.len());
        for path in paths {
            let content = tokio::fs::read_to_string(path).await.map_err(|e| {
                Error::Instructions(format!("failed to read {}: {}", path.display(), e))
            })?;
            sections.push(format!("From: {}\n{}", display_name(path), content.trim_end()));
        }
        Ok(sections.join("\n\n"))
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Discovers instruction files around the working directory
#[derive(Debug, Clone)]
pub struct AutoSelector {
    global_dir: Option<PathBuf>,
    cwd: PathBuf,
    instructions_dir: Option<PathBuf>,
}

impl AutoSelector {
    pub fn new(
        global_dir: Option<PathBuf>,
        cwd: PathBuf,
        instructions_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            global_dir,
            cwd,
            instructions_dir,
        }
    }

    /// Selector rooted at the process working directory and the user's config dir
    pub fn from_env(instructions_dir: Option<PathBuf>) -> std::io::Result<Self> {
        let global = dirs::config_dir().map(|d| d.join("sortie"));
        Ok(Self::new(global, std::env::current_dir()?, instructions_dir))
    }

    /// Files that would be loaded for `goal`, lowest priority first
    pub fn discover(&self, goal: &str) -> Vec<PathBuf> {
        let mut files = Vec::new();

        if let Some(global) = &self.global_dir {
            files.extend(find_context_file(global));
        }
        for dir in directories_to_check(&self.cwd) {
            files.extend(find_context_file(&dir));
        }
        if let Some(dir) = &self.instructions_dir {
            files.extend(matching_instruction_files(dir, goal));
        }

        files.dedup();
        files
    }
}

#[async_trait]
impl InstructionSelector for AutoSelector {
    async fn select(&self, goal: &str) -> Result<String> {
        let files = self.discover(goal);
        tracing::debug!(count = files.len(), "auto-selected instruction files");
        FsAssembler.assemble(&files).await
    }
}

/// Directories from the repo root (or filesystem root) down to `cwd`
fn directories_to_check(cwd: &Path) -> Vec<PathBuf> {
    let start_dir = find_repo_root(cwd).unwrap_or_else(|| PathBuf::from("/"));

    let mut dirs_to_check = Vec::new();
    let mut current = Some(cwd);
    while let Some(dir) = current {
        if !dir.starts_with(&start_dir) {
            break;
        }
        dirs_to_check.push(dir.to_path_buf());
        current = dir.parent();
    }

    // Reverse so we go from root -> cwd
    dirs_to_check.reverse();
    dirs_to_check
}

/// Find the repository root by looking for .git directory
fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let mut current = Some(start);

    while let Some(dir) = current {
        if dir.join(".git").exists() {
            return Some(dir.to_path_buf());
        }
        current = dir.parent();
    }

    None
}

/// The first non-empty context file in `dir`
fn find_context_file(dir: &Path) -> Option<PathBuf> {
    CONTEXT_FILE_NAMES.iter().map(|name| dir.join(name)).find(|path| {
        std::fs::read_to_string(path)
            .map(|content| !content.trim().is_empty())
            .unwrap_or(false)
    })
}

/// Markdown files in `dir` whose name shares a word with the goal
fn matching_instruction_files(dir: &Path, goal: &str) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        tracing::warn!("instructions directory {} is not readable", dir.display());
        return Vec::new();
    };

    let goal_words = words(goal);
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "md"))
        .filter(|path| {
            path.file_stem()
                .map(|stem| words(&stem.to_string_lossy()))
                .is_some_and(|stem_words| stem_words.iter().any(|w| goal_words.contains(w)))
        })
        .collect();
    files.sort();
    files
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= MIN_MATCH_LEN)
        .map(str::to_lowercase)
        .collect()
}
