use crate::sandbox::{SafetyLevel, Sandbox, classify_command};
use crate::tools::base::{ExecutionContext, Tool, ToolResult, require_str};
use crate::utils::subprocess::sandboxed_command;
use crate::utils::truncate_at_utf8_boundary;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Maximum combined stdout+stderr size before truncation.
const MAX_OUTPUT_BYTES: usize = 1024 * 1024; // 1 MB

const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;
const DEFAULT_PYTHON_TIMEOUT_SECS: u64 = 10;
/// Backstop enforced by the registry; per-call timeouts govern below this.
const EXEC_BACKSTOP_SECS: u64 = 300;

/// Format captured output, reserving a share of the budget for stderr so
/// error messages survive truncation of a noisy stdout.
fn format_output(stdout_raw: &[u8], stderr_raw: &[u8], exit_code: Option<i32>) -> String {
    let combined_len = stdout_raw.len() + stderr_raw.len();
    let truncated = combined_len > MAX_OUTPUT_BYTES;

    let stderr_reserve = MAX_OUTPUT_BYTES / 4;
    let stdout_max = MAX_OUTPUT_BYTES - stderr_reserve.min(stderr_raw.len());
    let stdout_bytes = if stdout_raw.len() > stdout_max {
        truncate_at_utf8_boundary(stdout_raw, stdout_max)
    } else {
        stdout_raw
    };
    let remaining = MAX_OUTPUT_BYTES.saturating_sub(stdout_bytes.len());
    let stderr_bytes = if stderr_raw.len() > remaining {
        truncate_at_utf8_boundary(stderr_raw, remaining)
    } else {
        stderr_raw
    };

    let stdout = String::from_utf8_lossy(stdout_bytes);
    let stderr = String::from_utf8_lossy(stderr_bytes);

    let mut result = String::new();
    if !stdout.is_empty() {
        result.push_str(&stdout);
    }
    if !stderr.is_empty() {
        if !result.is_empty() {
            result.push_str("\n--- stderr ---\n");
        }
        result.push_str(&stderr);
    }
    if truncated {
        result.push_str("\n[output truncated at 1MB]");
    }
    if result.is_empty() {
        result.push_str("(no output)");
    }
    if let Some(code) = exit_code {
        if code != 0 {
            result.push_str(&format!("\n[exit code: {}]", code));
        }
    } else {
        result.push_str("\n[terminated by signal]");
    }
    result
}

/// Run a shell command with the sandbox root as CWD and a scrubbed
/// environment. Safety classification happens upstream in the approval
/// gate; by the time `execute` runs the call has been approved or
/// bypassed.
pub struct RunCommandTool {
    sandbox: Arc<Sandbox>,
}

impl RunCommandTool {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for RunCommandTool {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        "Run a shell command in the sandbox directory. Use with caution."
    }

    fn safety_default(&self) -> SafetyLevel {
        // Derived per call from command classification; the static default
        // is only a floor for callers that skip classification.
        SafetyLevel::Moderate
    }

    fn execution_timeout(&self) -> Duration {
        Duration::from_secs(EXEC_BACKSTOP_SECS)
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "cmd": {
                    "type": "string",
                    "description": "Shell command to execute"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds (default: 30)"
                }
            },
            "required": ["cmd"]
        })
    }

    async fn execute(&self, params: Value, _ctx: &ExecutionContext) -> Result<ToolResult> {
        let command = require_str(&params, "cmd")?;
        let timeout = params["timeout"]
            .as_u64()
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS);
        let (safety, _) = classify_command(command);

        let mut cmd = sandboxed_command("sh", self.sandbox.root());
        cmd.arg("-c").arg(command);

        match tokio::time::timeout(Duration::from_secs(timeout), cmd.output()).await {
            Ok(Ok(output)) => {
                let text = format_output(&output.stdout, &output.stderr, output.status.code());
                let result = if output.status.success() {
                    ToolResult::text(text)
                } else {
                    ToolResult::error(format!("command failed: {}", text))
                };
                Ok(result.with_safety(safety))
            }
            Ok(Err(e)) => Ok(ToolResult::error(format!("error executing command: {}", e))
                .with_safety(safety)),
            Err(_) => {
                warn!("run_command timed out after {}s: {}", timeout, command);
                Ok(
                    ToolResult::error(format!("command timed out after {} seconds", timeout))
                        .with_safety(safety),
                )
            }
        }
    }
}

/// Execute Python code from a temp script inside the sandbox, with a
/// reduced environment. Always classified dangerous.
pub struct RunPythonTool {
    sandbox: Arc<Sandbox>,
}

impl RunPythonTool {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for RunPythonTool {
    fn name(&self) -> &str {
        "run_python"
    }

    fn description(&self) -> &str {
        "Execute Python code and return the output."
    }

    fn safety_default(&self) -> SafetyLevel {
        SafetyLevel::Dangerous
    }

    fn execution_timeout(&self) -> Duration {
        Duration::from_secs(EXEC_BACKSTOP_SECS)
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "Python code to execute"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds (default: 10)"
                }
            },
            "required": ["code"]
        })
    }

    async fn execute(&self, params: Value, _ctx: &ExecutionContext) -> Result<ToolResult> {
        let code = require_str(&params, "code")?;
        let timeout = params["timeout"]
            .as_u64()
            .unwrap_or(DEFAULT_PYTHON_TIMEOUT_SECS);

        // Script lives inside the sandbox so the interpreter's own path
        // checks stay within bounds; removed after the run.
        let script_path = self
            .sandbox
            .root()
            .join(format!(".drover_py_{}.py", uuid::Uuid::new_v4().simple()));
        if let Err(e) = tokio::fs::write(&script_path, code).await {
            return Ok(ToolResult::error(format!("error staging script: {}", e))
                .with_safety(SafetyLevel::Dangerous));
        }

        let mut cmd = sandboxed_command("python3", self.sandbox.root());
        cmd.env("PYTHONDONTWRITEBYTECODE", "1");
        cmd.arg(&script_path);

        let outcome = tokio::time::timeout(Duration::from_secs(timeout), cmd.output()).await;
        let _ = tokio::fs::remove_file(&script_path).await;

        match outcome {
            Ok(Ok(output)) => {
                let text = format_output(&output.stdout, &output.stderr, output.status.code());
                let result = if output.status.success() {
                    ToolResult::text(text)
                } else {
                    ToolResult::error(format!("python failed: {}", text))
                };
                Ok(result.with_safety(SafetyLevel::Dangerous))
            }
            Ok(Err(e)) => Ok(ToolResult::error(format!("error executing python: {}", e))
                .with_safety(SafetyLevel::Dangerous)),
            Err(_) => Ok(
                ToolResult::error(format!("execution timed out after {} seconds", timeout))
                    .with_safety(SafetyLevel::Dangerous),
            ),
        }
    }
}
