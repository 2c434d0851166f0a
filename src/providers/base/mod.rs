use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// A tool invocation emitted by the model. `id` is the provider-issued
/// opaque string that must be echoed verbatim in the matching tool-result
/// message to preserve the provider's ordering contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Token accounting reported by the provider for a single turn.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn turn_total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub model: String,
    pub usage: Usage,
}

impl ChatResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// A base64-encoded image attached to a message, with an explicit MIME tag.
#[derive(Debug, Clone)]
pub struct ImageData {
    pub media_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Default)]
pub struct Message {
    pub role: String,
    pub content: String,
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    pub tool_call_id: Option<String>,
    /// Whether this tool result represents an error (for role="tool" messages)
    pub is_error: bool,
    pub images: Vec<ImageData>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Option<Vec<ToolCallRequest>>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
            tool_calls,
            ..Default::default()
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            role: "tool".into(),
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            is_error,
            ..Default::default()
        }
    }

    pub fn tool_result_with_images(
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
        images: Vec<ImageData>,
        is_error: bool,
    ) -> Self {
        Self {
            role: "tool".into(),
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            is_error,
            images,
        }
    }
}

/// Tool definition in the OpenAI function-calling shape, as handed to the
/// chat-completion collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value, // JSON Schema
}

impl ToolDefinition {
    pub fn to_schema(&self) -> Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// Parameters for a chat request.
#[derive(Debug, Clone)]
pub struct ChatRequest<'a> {
    pub messages: Vec<Message>,
    pub tools: Option<Vec<ToolDefinition>>,
    pub model: Option<&'a str>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Retry schedule for transient provider failures. The agent loop retries
/// at most twice with 100ms / 400ms delays before surfacing
/// `model_unavailable`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 100,
            backoff_multiplier: 4.0,
        }
    }
}

/// The single external collaborator for model inference. Provider drivers
/// beyond the bundled OpenAI-compatible client are out of scope; this trait
/// is the seam.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, req: ChatRequest<'_>) -> anyhow::Result<ChatResponse>;

    fn default_model(&self) -> &str;

    /// Chat with the fixed retry schedule. Every attempt failure is logged;
    /// the last error is returned after the schedule is exhausted.
    async fn chat_with_retry(
        &self,
        req: ChatRequest<'_>,
        retry: &RetryConfig,
    ) -> anyhow::Result<ChatResponse> {
        let mut last_error = None;

        for attempt in 0..=retry.max_retries {
            if attempt > 0 {
                let delay = (retry.initial_delay_ms as f64
                    * retry.backoff_multiplier.powi(attempt as i32 - 1))
                    as u64;
                debug!("waiting {}ms before provider retry {}", delay, attempt);
                tokio::time::sleep(tokio::time::Duration::from_millis(delay)).await;
            }
            match self.chat(req.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!("chat request failed on attempt {}: {}", attempt, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("all retry attempts failed")))
    }
}
