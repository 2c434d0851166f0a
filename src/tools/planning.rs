use crate::sandbox::SafetyLevel;
use crate::tools::base::{ExecutionContext, Tool, ToolResult, require_str};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

/// Scratchpad tool: records a thought and does nothing else. Gives the
/// model an explicit reasoning step without side effects. Never gated.
pub struct ThinkTool;

#[async_trait]
impl Tool for ThinkTool {
    fn name(&self) -> &str {
        "think"
    }

    fn description(&self) -> &str {
        "Record a thought or intermediate reasoning step. Has no side effects."
    }

    fn safety_default(&self) -> SafetyLevel {
        SafetyLevel::Safe
    }

    fn approval_exempt(&self) -> bool {
        true
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "thought": {
                    "type": "string",
                    "description": "The thought to record"
                }
            },
            "required": ["thought"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ExecutionContext) -> Result<ToolResult> {
        let thought = require_str(&params, "thought")?;
        debug!(
            principal = %ctx.principal.id,
            "think: {}",
            thought
        );
        Ok(ToolResult::text("thought recorded"))
    }
}

/// Structured plan recording: the model lays out a goal and its steps;
/// the tool echoes the numbered plan back so it lands in the transcript.
/// Never gated.
pub struct PlanTaskTool;

#[async_trait]
impl Tool for PlanTaskTool {
    fn name(&self) -> &str {
        "plan_task"
    }

    fn description(&self) -> &str {
        "Record a structured plan for the current goal before executing it."
    }

    fn safety_default(&self) -> SafetyLevel {
        SafetyLevel::Safe
    }

    fn approval_exempt(&self) -> bool {
        true
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "goal": {
                    "type": "string",
                    "description": "The overall goal"
                },
                "steps": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Ordered list of steps"
                }
            },
            "required": ["goal", "steps"]
        })
    }

    async fn execute(&self, params: Value, _ctx: &ExecutionContext) -> Result<ToolResult> {
        let goal = require_str(&params, "goal")?;
        let steps: Vec<&str> = params["steps"]
            .as_array()
            .map(|arr| arr.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        if steps.is_empty() {
            return Ok(ToolResult::error("plan must contain at least one step"));
        }

        let mut out = format!("plan recorded for: {}\n", goal);
        for (i, step) in steps.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, step));
        }
        Ok(ToolResult::text(out))
    }
}
