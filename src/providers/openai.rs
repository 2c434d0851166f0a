use crate::providers::base::{ChatProvider, ChatRequest, ChatResponse, ToolCallRequest, Usage};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;

const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const CONNECT_TIMEOUT_SECS: u64 = 30;
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// OpenAI-compatible chat-completion client. The base URL is configurable
/// so the same client speaks to Groq, Ollama, and other compatible
/// gateways.
pub struct OpenAiProvider {
    api_key: String,
    default_model: String,
    base_url: String,
    client: Client,
}

impl OpenAiProvider {
    pub fn new(api_key: String, default_model: Option<String>, base_url: Option<String>) -> Self {
        Self {
            api_key,
            default_model: default_model.unwrap_or_else(|| "gpt-4o".to_string()),
            base_url: base_url.unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            client: Client::builder()
                .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    fn parse_response(json: &Value) -> Result<ChatResponse> {
        let choice = json["choices"]
            .as_array()
            .and_then(|arr| arr.first())
            .context("no choices in chat completion response")?;

        let message = &choice["message"];
        let content = message["content"].as_str().map(ToString::to_string);

        let mut tool_calls = Vec::new();
        if let Some(calls) = message["tool_calls"].as_array() {
            for tc in calls {
                if let Some(function) = tc["function"].as_object() {
                    // Arguments arrive as a JSON-encoded string.
                    let arguments = function
                        .get("arguments")
                        .and_then(Value::as_str)
                        .and_then(|s| serde_json::from_str(s).ok())
                        .unwrap_or_else(|| json!({}));

                    tool_calls.push(ToolCallRequest {
                        id: tc["id"].as_str().unwrap_or("").to_string(),
                        name: function
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string(),
                        arguments,
                    });
                }
            }
        }

        let usage = Usage {
            prompt_tokens: json["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            completion_tokens: json["usage"]["completion_tokens"].as_u64().unwrap_or(0),
            total_tokens: json["usage"]["total_tokens"].as_u64().unwrap_or(0),
        };

        Ok(ChatResponse {
            content,
            tool_calls,
            model: json["model"].as_str().unwrap_or("").to_string(),
            usage,
        })
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    async fn chat(&self, req: ChatRequest<'_>) -> Result<ChatResponse> {
        let messages: Vec<Value> = req
            .messages
            .iter()
            .map(|msg| {
                let mut obj = json!({ "role": msg.role });
                if !msg.images.is_empty() && msg.role == "user" {
                    let mut parts = Vec::new();
                    if !msg.content.is_empty() {
                        parts.push(json!({ "type": "text", "text": msg.content }));
                    }
                    for img in &msg.images {
                        parts.push(json!({
                            "type": "image_url",
                            "image_url": {
                                "url": format!("data:{};base64,{}", img.media_type, img.data)
                            }
                        }));
                    }
                    obj["content"] = Value::Array(parts);
                } else {
                    obj["content"] = Value::String(msg.content.clone());
                }
                if let Some(calls) = &msg.tool_calls
                    && !calls.is_empty()
                {
                    obj["tool_calls"] = Value::Array(
                        calls
                            .iter()
                            .map(|tc| {
                                json!({
                                    "id": tc.id,
                                    "type": "function",
                                    "function": {
                                        "name": tc.name,
                                        "arguments": tc.arguments.to_string(),
                                    }
                                })
                            })
                            .collect(),
                    );
                }
                if let Some(id) = &msg.tool_call_id {
                    obj["tool_call_id"] = Value::String(id.clone());
                }
                obj
            })
            .collect();

        let mut body = json!({
            "model": req.model.unwrap_or(&self.default_model),
            "messages": messages,
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
        });

        if let Some(tools) = &req.tools
            && !tools.is_empty()
        {
            body["tools"] = Value::Array(tools.iter().map(|t| t.to_schema()).collect());
        }

        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("chat completion request failed")?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .context("failed to decode chat completion response")?;

        if !status.is_success() {
            let message = payload["error"]["message"]
                .as_str()
                .unwrap_or("unknown provider error");
            anyhow::bail!("provider returned {}: {}", status, message);
        }

        Self::parse_response(&payload)
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}
