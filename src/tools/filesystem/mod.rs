use crate::sandbox::{SafetyLevel, Sandbox};
use crate::tools::base::{ExecutionContext, Tool, ToolResult, require_str};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::fmt::Write as _;
use std::sync::Arc;
use walkdir::WalkDir;

/// Cap on search_files matches returned to the model.
const MAX_SEARCH_MATCHES: usize = 100;

pub struct ReadFileTool {
    sandbox: Arc<Sandbox>,
}

impl ReadFileTool {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file in the sandbox."
    }

    fn safety_default(&self) -> SafetyLevel {
        SafetyLevel::Safe
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Relative path to the file"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, params: Value, _ctx: &ExecutionContext) -> Result<ToolResult> {
        let path = require_str(&params, "path")?;

        let resolved = match self.sandbox.resolve_file(path) {
            Ok(p) => p,
            Err(e) => return Ok(ToolResult::error(e.to_string())),
        };

        match tokio::fs::read_to_string(&resolved).await {
            Ok(content) => Ok(ToolResult::text(content)),
            Err(e) => Ok(ToolResult::error(format!("error reading file: {}", e))),
        }
    }
}

pub struct WriteFileTool {
    sandbox: Arc<Sandbox>,
}

impl WriteFileTool {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file in the sandbox. Creates parent directories if needed."
    }

    fn safety_default(&self) -> SafetyLevel {
        SafetyLevel::Moderate
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Relative path to the file"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, params: Value, _ctx: &ExecutionContext) -> Result<ToolResult> {
        let path = require_str(&params, "path")?;
        let content = require_str(&params, "content")?;

        let resolved = match self.sandbox.resolve_for_write(path) {
            Ok(p) => p,
            Err(e) => return Ok(ToolResult::error(e.to_string())),
        };

        if let Some(parent) = resolved.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            return Ok(ToolResult::error(format!(
                "error creating parent directory: {}",
                e
            )));
        }

        match tokio::fs::write(&resolved, content).await {
            Ok(()) => Ok(ToolResult::text(format!(
                "wrote {} bytes to {}",
                content.len(),
                path
            ))),
            Err(e) => Ok(ToolResult::error(format!("error writing file: {}", e))),
        }
    }
}

pub struct ListDirTool {
    sandbox: Arc<Sandbox>,
}

impl ListDirTool {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List files and directories in a path. Directories are listed first."
    }

    fn safety_default(&self) -> SafetyLevel {
        SafetyLevel::Safe
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Relative path to list (default: '.')"
                }
            },
            "required": []
        })
    }

    async fn execute(&self, params: Value, _ctx: &ExecutionContext) -> Result<ToolResult> {
        let path = params["path"].as_str().unwrap_or(".");

        let resolved = match self.sandbox.resolve_dir(path) {
            Ok(p) => p,
            Err(e) => return Ok(ToolResult::error(e.to_string())),
        };

        let mut entries: Vec<(bool, String, Option<u64>)> = Vec::new();
        let read = match std::fs::read_dir(&resolved) {
            Ok(rd) => rd,
            Err(e) => return Ok(ToolResult::error(format!("error reading directory: {}", e))),
        };
        for entry in read.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let meta = entry.metadata().ok();
            let is_dir = meta.as_ref().is_some_and(std::fs::Metadata::is_dir);
            let size = meta.filter(|m| m.is_file()).map(|m| m.len());
            entries.push((is_dir, name, size));
        }

        // Directories first, then files, each alphabetically.
        entries.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.to_lowercase().cmp(&b.1.to_lowercase())));

        let mut out = String::new();
        for (is_dir, name, size) in &entries {
            if *is_dir {
                let _ = writeln!(out, "{}/", name);
            } else {
                let _ = writeln!(out, "{} ({} bytes)", name, size.unwrap_or(0));
            }
        }
        if out.is_empty() {
            out.push_str("(empty directory)");
        }
        Ok(ToolResult::text(out))
    }
}

pub struct SearchFilesTool {
    sandbox: Arc<Sandbox>,
}

impl SearchFilesTool {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for SearchFilesTool {
    fn name(&self) -> &str {
        "search_files"
    }

    fn description(&self) -> &str {
        "Search for files matching a glob pattern (e.g. '*.py', '**/*.ts')."
    }

    fn safety_default(&self) -> SafetyLevel {
        SafetyLevel::Safe
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern to match"
                },
                "path": {
                    "type": "string",
                    "description": "Starting directory (default: '.')"
                }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, params: Value, _ctx: &ExecutionContext) -> Result<ToolResult> {
        let pattern = require_str(&params, "pattern")?;
        let path = params["path"].as_str().unwrap_or(".");

        let resolved = match self.sandbox.resolve_dir(path) {
            Ok(p) => p,
            Err(e) => return Ok(ToolResult::error(e.to_string())),
        };

        let matcher = match glob_to_regex(pattern) {
            Ok(m) => m,
            Err(e) => return Ok(ToolResult::error(format!("invalid pattern: {}", e))),
        };
        let match_full_path = pattern.contains('/');

        let mut matches = Vec::new();
        let mut total = 0usize;
        for entry in WalkDir::new(&resolved).into_iter().filter_map(|e| e.ok()) {
            let Ok(rel) = entry.path().strip_prefix(self.sandbox.root()) else {
                continue;
            };
            let rel_str = rel.to_string_lossy();
            let candidate = if match_full_path {
                rel_str.as_ref()
            } else {
                entry.file_name().to_str().unwrap_or_default()
            };
            if candidate.is_empty() || !matcher.is_match(candidate) {
                continue;
            }
            total += 1;
            if matches.len() < MAX_SEARCH_MATCHES {
                let suffix = if entry.file_type().is_dir() { "/" } else { "" };
                matches.push(format!("{}{}", rel_str, suffix));
            }
        }

        let mut out = matches.join("\n");
        if total > matches.len() {
            let _ = write!(out, "\n({} more matches not shown)", total - matches.len());
        }
        if out.is_empty() {
            out = format!("no files match '{}'", pattern);
        }
        Ok(ToolResult::text(out))
    }
}

/// Translate a glob pattern into an anchored regex. `**` crosses directory
/// separators, `*` and `?` do not.
fn glob_to_regex(pattern: &str) -> Result<regex::Regex> {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // Swallow a following '/' so "**/*.rs" also matches
                    // top-level files.
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        out.push_str("(?:.*/)?");
                    } else {
                        out.push_str(".*");
                    }
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    Ok(regex::Regex::new(&out)?)
}
