use anyhow::{Context, Result};
use serde_json::{Value, json};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP transport for remote tool servers: `GET <base>/tools` for
/// discovery, `POST <base>/tools/call` for invocation.
pub struct HttpClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    pub async fn list_tools(&self) -> Result<Vec<(String, String, Value)>> {
        let response = self
            .client
            .get(format!("{}/tools", self.base_url))
            .send()
            .await
            .context("tool discovery request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("tool discovery returned {}", response.status());
        }
        let body: Value = response.json().await.context("invalid discovery response")?;
        let tools = body["tools"]
            .as_array()
            .context("discovery response missing 'tools' array")?;
        Ok(tools
            .iter()
            .map(|t| {
                (
                    t["name"].as_str().unwrap_or("").to_string(),
                    t["description"].as_str().unwrap_or("").to_string(),
                    t["inputSchema"].clone(),
                )
            })
            .filter(|(name, _, _)| !name.is_empty())
            .collect())
    }

    /// Invoke one tool. The remote may reply with its own
    /// `pending_approval` envelope; the raw body is returned either way
    /// and interpreted by the multiplexer.
    pub async fn call_tool(&self, name: &str, arguments: &Value) -> Result<Value> {
        let response = self
            .client
            .post(format!("{}/tools/call", self.base_url))
            .json(&json!({"name": name, "arguments": arguments}))
            .send()
            .await
            .context("tool call request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("tool call returned {}", response.status());
        }
        response.json().await.context("invalid tool call response")
    }
}
