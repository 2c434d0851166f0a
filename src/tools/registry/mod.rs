use crate::providers::base::ToolDefinition;
use crate::tools::base::{ExecutionContext, Tool, ToolResult};
use anyhow::Result;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Produce a canonical JSON string with object keys sorted recursively.
/// Used for single-flight dispatch keys so duplicate model-emitted calls
/// hash identically regardless of key insertion order.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonical_value(v))).collect();
            serde_json::to_string(&sorted).unwrap_or_default()
        }
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonical_value(v))).collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        Value::Array(arr) => Value::Array(arr.iter().map(canonical_value).collect()),
        other => other.clone(),
    }
}

/// Name-keyed registry of built-in tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            warn!("tool registry: overwriting duplicate tool '{}'", name);
        }
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn Tool>)> {
        self.tools.iter()
    }

    /// Descriptor set in the OpenAI function-calling shape, sorted by name
    /// for a stable schema across turns.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<_> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a tool in a spawned task with timeout and panic isolation.
    /// Timeouts produce a distinct error text, never conflated with process
    /// exit codes.
    pub async fn execute(
        &self,
        name: &str,
        params: Value,
        ctx: &ExecutionContext,
    ) -> Result<ToolResult> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("tool '{}' not found", name))?
            .clone();

        debug!("executing tool '{}' with arguments: {}", name, params);

        let tool_name = name.to_string();
        let ctx = ctx.clone();
        let timeout = tool.execution_timeout();
        let timeout_secs = timeout.as_secs();

        let handle = tokio::task::spawn(async move {
            tokio::time::timeout(timeout, tool.execute(params, &ctx)).await
        });

        match handle.await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                warn!("tool '{}' timed out after {}s", tool_name, timeout_secs);
                Ok(ToolResult::error(format!(
                    "tool '{}' timed out after {}s",
                    tool_name, timeout_secs
                )))
            }
            Err(join_err) => {
                if join_err.is_panic() {
                    error!("tool '{}' panicked: {:?}", tool_name, join_err);
                    Ok(ToolResult::error(format!(
                        "tool '{}' crashed unexpectedly",
                        tool_name
                    )))
                } else {
                    Err(anyhow::anyhow!("tool '{}' was cancelled", tool_name))
                }
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
