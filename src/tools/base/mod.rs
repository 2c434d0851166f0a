use crate::providers::base::{ImageData, ToolDefinition};
use crate::sandbox::SafetyLevel;
use async_trait::async_trait;
use serde_json::Value;

/// One typed piece of tool output. Text parts are serialized into the
/// tool-result message; image parts travel base64-encoded with an explicit
/// MIME tag.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text { text: String },
    Image { data: String, mime_type: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    Success,
    Error,
}

/// Result of a tool execution: a status, typed content parts, and the
/// safety level the call was classified at.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub status: ToolStatus,
    pub content: Vec<ContentPart>,
    pub safety: SafetyLevel,
}

impl ToolResult {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Success,
            content: vec![ContentPart::Text {
                text: content.into(),
            }],
            safety: SafetyLevel::Safe,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Error,
            content: vec![ContentPart::Text {
                text: content.into(),
            }],
            safety: SafetyLevel::Safe,
        }
    }

    pub fn with_safety(mut self, safety: SafetyLevel) -> Self {
        self.safety = safety;
        self
    }

    pub fn is_error(&self) -> bool {
        self.status == ToolStatus::Error
    }

    /// Flatten the result for a provider tool-result message: text parts
    /// concatenated, image parts split out for base64 transport.
    pub fn render(&self) -> (String, Vec<ImageData>) {
        let mut text = String::new();
        let mut images = Vec::new();
        for part in &self.content {
            match part {
                ContentPart::Text { text: t } => {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(t);
                }
                ContentPart::Image { data, mime_type } => {
                    images.push(ImageData {
                        media_type: mime_type.clone(),
                        data: data.clone(),
                    });
                }
            }
        }
        (text, images)
    }
}

impl std::fmt::Display for ToolResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (text, _) = self.render();
        write!(f, "{}", text)
    }
}

/// Context passed to every tool execution: who is running, and for which
/// instance (for event attribution and privilege checks in tools that
/// govern, e.g. `spawn_agent`).
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub principal: crate::rbac::Principal,
    pub instance_id: Option<String>,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> Value; // JSON Schema

    async fn execute(&self, params: Value, ctx: &ExecutionContext) -> anyhow::Result<ToolResult>;

    /// Static safety classification. `run_command` overrides this per call
    /// via command classification; everything else is fixed.
    fn safety_default(&self) -> SafetyLevel {
        SafetyLevel::Moderate
    }

    /// Tools that only record model state (`think`, `plan_task`) never pass
    /// through the approval gate.
    fn approval_exempt(&self) -> bool {
        false
    }

    /// Per-tool execution timeout enforced by the registry.
    fn execution_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(120)
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// Pull a required string parameter out of tool arguments.
pub(crate) fn require_str<'a>(params: &'a Value, key: &str) -> anyhow::Result<&'a str> {
    params[key]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("missing '{}' parameter", key))
}
