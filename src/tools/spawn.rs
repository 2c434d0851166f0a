use crate::sandbox::SafetyLevel;
use crate::spawner::Spawner;
use crate::tools::base::{ExecutionContext, Tool, ToolResult, require_str};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

/// Built-in tool that lets sufficiently privileged agents spawn sub-agents
/// through the governed spawner. Depth, concurrency, and permission
/// intersection all apply; the calling instance becomes the parent so
/// ancestry is tracked.
pub struct SpawnAgentTool {
    spawner: Arc<Spawner>,
}

impl SpawnAgentTool {
    pub fn new(spawner: Arc<Spawner>) -> Self {
        Self { spawner }
    }
}

#[async_trait]
impl Tool for SpawnAgentTool {
    fn name(&self) -> &str {
        "spawn_agent"
    }

    fn description(&self) -> &str {
        "Spawn a sub-agent from a template to work on a delegated task."
    }

    fn safety_default(&self) -> SafetyLevel {
        SafetyLevel::Moderate
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "template_id": {
                    "type": "string",
                    "description": "Template to spawn from"
                },
                "task": {
                    "type": "string",
                    "description": "Task for the sub-agent"
                },
                "context": {
                    "type": "object",
                    "description": "Optional initial context for the sub-agent"
                }
            },
            "required": ["template_id", "task"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ExecutionContext) -> Result<ToolResult> {
        let template_id = require_str(&params, "template_id")?;
        let task = require_str(&params, "task")?;
        let context = params.get("context").filter(|v| !v.is_null());

        match self.spawner.spawn(
            &ctx.principal,
            template_id,
            task,
            context,
            ctx.instance_id.as_deref(),
        ) {
            Ok(instance) => Ok(ToolResult::text(
                json!({
                    "instance_id": instance.id,
                    "status": instance.status.as_str(),
                    "depth": instance.depth,
                })
                .to_string(),
            )),
            // Governance rejections surface to the model as tool errors so
            // it can adjust instead of crashing the loop.
            Err(e) => Ok(ToolResult::error(format!("spawn failed: {}", e))),
        }
    }
}
