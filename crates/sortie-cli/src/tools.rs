//! Read-only tools offered to every conversation

use async_trait::async_trait;
use serde_json::json;
use sortie_agent::{BoxedTool, Tool, ToolResult};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const MAX_LINES: usize = 2000;
const MAX_ENTRIES: usize = 200;

/// The default tool set
pub fn default_tools() -> Vec<BoxedTool> {
    vec![Arc::new(ReadTool), Arc::new(ListTool)]
}

/// Expand a leading `~` to the home directory
fn expand_path(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None if path == "~" => dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
        None => PathBuf::from(path),
    }
}

/// Reads a text file, optionally a window of its lines
pub struct ReadTool;

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read a text file. Use offset and limit to page through large files."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to read (relative or absolute)"
                },
                "offset": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Line number to start reading from (1-indexed)"
                },
                "limit": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Maximum number of lines to read"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> ToolResult {
        let Some(path) = arguments.get("path").and_then(|v| v.as_str()) else {
            return ToolResult::error("Missing 'path' argument");
        };
        if cancel.is_cancelled() {
            return ToolResult::error("Operation cancelled");
        }

        let content = match tokio::fs::read_to_string(expand_path(path)).await {
            Ok(c) => c,
            Err(e) => return ToolResult::error(format!("Failed to read file: {}", e)),
        };

        let lines: Vec<&str> = content.lines().collect();
        let offset = arguments
            .get("offset")
            .and_then(|v| v.as_u64())
            .map(|o| (o as usize).saturating_sub(1))
            .unwrap_or(0);
        let limit = arguments
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|l| l as usize)
            .unwrap_or(MAX_LINES);

        if offset > 0 && offset >= lines.len() {
            return ToolResult::error(format!(
                "Offset {} is beyond end of file ({} lines total)",
                offset + 1,
                lines.len()
            ));
        }

        let end = offset.saturating_add(limit).min(lines.len());
        let mut output = lines[offset..end].join("\n");
        if end < lines.len() {
            output.push_str(&format!(
                "\n\n... ({} more lines. Use offset={} to continue reading)",
                lines.len() - end,
                end + 1
            ));
        }
        ToolResult::text(output)
    }
}

/// Lists the entries of one directory
pub struct ListTool;

#[async_trait]
impl Tool for ListTool {
    fn name(&self) -> &str {
        "list"
    }

    fn description(&self) -> &str {
        "List the contents of a directory. Directories end with '/'."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory path to list (defaults to current directory)"
                },
                "show_hidden": {
                    "type": "boolean",
                    "description": "Whether to show hidden files (default: false)"
                }
            }
        })
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> ToolResult {
        let path = expand_path(arguments.get("path").and_then(|v| v.as_str()).unwrap_or("."));
        let show_hidden = arguments
            .get("show_hidden")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let mut read_dir = match tokio::fs::read_dir(&path).await {
            Ok(d) => d,
            Err(e) => {
                return ToolResult::error(format!("Cannot list {}: {}", path.display(), e));
            }
        };

        let mut entries = Vec::new();
        loop {
            if cancel.is_cancelled() {
                return ToolResult::error("List cancelled");
            }
            let entry = match read_dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => return ToolResult::error(format!("Error reading directory: {}", e)),
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if !show_hidden && name.starts_with('.') {
                continue;
            }
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            entries.push(if is_dir { format!("{name}/") } else { name });
        }

        if entries.is_empty() {
            return ToolResult::text("(empty directory)");
        }

        entries.sort();
        let total = entries.len();
        entries.truncate(MAX_ENTRIES);
        let mut output = entries.join("\n");
        if total > MAX_ENTRIES {
            output.push_str(&format!("\n\n(showing first {} of {} entries)", MAX_ENTRIES, total));
        }
        ToolResult::text(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn test_read_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, "one\ntwo\nthree\nfour").unwrap();

        let result = ReadTool
            .execute(
                "c1",
                json!({"path": path.to_string_lossy(), "offset": 2, "limit": 2}),
                CancellationToken::new(),
            )
            .await;

        assert!(!result.is_error);
        assert_eq!(
            result.text_content(),
            "two\nthree\n\n... (1 more lines. Use offset=4 to continue reading)"
        );
    }

    #[tokio::test]
    async fn test_read_huge_limit_reads_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, "one\ntwo\nthree").unwrap();

        let result = ReadTool
            .execute(
                "c1",
                json!({"path": path.to_string_lossy(), "offset": 2, "limit": u64::MAX}),
                CancellationToken::new(),
            )
            .await;

        assert!(!result.is_error);
        assert_eq!(result.text_content(), "two\nthree");
    }

    #[tokio::test]
    async fn test_read_missing_file_is_error_result() {
        let result = ReadTool
            .execute(
                "c1",
                json!({"path": "/definitely/not/here.txt"}),
                CancellationToken::new(),
            )
            .await;
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn test_list_marks_directories_and_hides_dotfiles() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("Cargo.toml"), "").unwrap();
        fs::write(dir.path().join(".env"), "").unwrap();

        let result = ListTool
            .execute(
                "c1",
                json!({"path": dir.path().to_string_lossy()}),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(result.text_content(), "Cargo.toml\nsrc/");
    }

    #[test]
    fn test_default_tools_have_valid_schemas() {
        for tool in default_tools() {
            assert!(jsonschema::validator_for(&tool.parameters_schema()).is_ok());
        }
    }
}
