use crate::sandbox::SafetyLevel;
use crate::tools::base::{ExecutionContext, Tool, ToolResult, require_str};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_NUM_RESULTS: u64 = 5;
const MAX_NUM_RESULTS: u64 = 20;

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// Pluggable web search backend.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, query: &str, num_results: u64) -> Result<Vec<SearchHit>>;
}

/// Brave Search API backend.
pub struct BraveSearchBackend {
    api_key: String,
    client: reqwest::Client,
}

impl BraveSearchBackend {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(20))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

#[async_trait]
impl SearchBackend for BraveSearchBackend {
    async fn search(&self, query: &str, num_results: u64) -> Result<Vec<SearchHit>> {
        let response = self
            .client
            .get("https://api.search.brave.com/res/v1/web/search")
            .header("X-Subscription-Token", &self.api_key)
            .header("Accept", "application/json")
            .query(&[("q", query), ("count", &num_results.to_string())])
            .send()
            .await
            .context("search request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("search API returned {}", response.status());
        }

        let body: Value = response.json().await.context("invalid search response")?;
        let hits = body["web"]["results"]
            .as_array()
            .map(|results| {
                results
                    .iter()
                    .map(|r| SearchHit {
                        title: r["title"].as_str().unwrap_or("").to_string(),
                        url: r["url"].as_str().unwrap_or("").to_string(),
                        snippet: r["description"].as_str().unwrap_or("").to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(hits)
    }
}

/// Web search built-in, delegating to whatever backend is configured.
pub struct WebSearchTool {
    backend: Option<Arc<dyn SearchBackend>>,
}

impl WebSearchTool {
    pub fn new(backend: Option<Arc<dyn SearchBackend>>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for information."
    }

    fn safety_default(&self) -> SafetyLevel {
        SafetyLevel::Safe
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search query"
                },
                "num_results": {
                    "type": "integer",
                    "description": "Number of results (default: 5)"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, _ctx: &ExecutionContext) -> Result<ToolResult> {
        let query = require_str(&params, "query")?;
        let num_results = params["num_results"]
            .as_u64()
            .unwrap_or(DEFAULT_NUM_RESULTS)
            .min(MAX_NUM_RESULTS);

        let Some(backend) = &self.backend else {
            return Ok(ToolResult::error("web search backend is not configured"));
        };

        match backend.search(query, num_results).await {
            Ok(hits) if hits.is_empty() => {
                Ok(ToolResult::text(format!("no results for '{}'", query)))
            }
            Ok(hits) => {
                let mut out = String::new();
                for (i, hit) in hits.iter().enumerate() {
                    let _ = writeln!(
                        out,
                        "{}. {} ({})\n   {}",
                        i + 1,
                        hit.title,
                        hit.url,
                        hit.snippet
                    );
                }
                Ok(ToolResult::text(out))
            }
            Err(e) => Ok(ToolResult::error(format!("web search failed: {}", e))),
        }
    }
}

/// One retrieved chunk from the knowledge base.
#[derive(Debug, Clone)]
pub struct RagChunk {
    pub source: String,
    pub content: String,
    pub score: f64,
}

/// Seam to the retrieval pipeline, which lives outside this core.
#[async_trait]
pub trait RagBackend: Send + Sync {
    async fn query(&self, query: &str, top_k: u64) -> Result<Vec<RagChunk>>;
}

/// Knowledge-base query built-in, delegating to the retrieval collaborator.
pub struct RagQueryTool {
    backend: Option<Arc<dyn RagBackend>>,
}

impl RagQueryTool {
    pub fn new(backend: Option<Arc<dyn RagBackend>>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Tool for RagQueryTool {
    fn name(&self) -> &str {
        "rag_query"
    }

    fn description(&self) -> &str {
        "Query the user's knowledge base for relevant information."
    }

    fn safety_default(&self) -> SafetyLevel {
        SafetyLevel::Safe
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Question to ask the knowledge base"
                },
                "top_k": {
                    "type": "integer",
                    "description": "Number of chunks to retrieve (default: 5)"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, _ctx: &ExecutionContext) -> Result<ToolResult> {
        let query = require_str(&params, "query")?;
        let top_k = params["top_k"].as_u64().unwrap_or(5).min(MAX_NUM_RESULTS);

        let Some(backend) = &self.backend else {
            return Ok(ToolResult::error("knowledge base is not available"));
        };

        match backend.query(query, top_k).await {
            Ok(chunks) if chunks.is_empty() => Ok(ToolResult::text("no relevant chunks found")),
            Ok(chunks) => {
                let mut out = String::new();
                for chunk in &chunks {
                    let _ = writeln!(
                        out,
                        "[{} score={:.3}]\n{}\n",
                        chunk.source, chunk.score, chunk.content
                    );
                }
                Ok(ToolResult::text(out))
            }
            Err(e) => Ok(ToolResult::error(format!("rag query failed: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedBackend;

    #[async_trait]
    impl SearchBackend for FixedBackend {
        async fn search(&self, _query: &str, _n: u64) -> Result<Vec<SearchHit>> {
            Ok(vec![SearchHit {
                title: "Rust".into(),
                url: "https://rust-lang.org".into(),
                snippet: "a language".into(),
            }])
        }
    }

    struct FixedRag;

    #[async_trait]
    impl RagBackend for FixedRag {
        async fn query(&self, _q: &str, _k: u64) -> Result<Vec<RagChunk>> {
            Ok(vec![RagChunk {
                source: "handbook.md".into(),
                content: "the answer".into(),
                score: 0.87,
            }])
        }
    }

    #[tokio::test]
    async fn test_web_search_formats_hits() {
        let tool = WebSearchTool::new(Some(Arc::new(FixedBackend)));
        let result = tool
            .execute(json!({"query": "rust"}), &ExecutionContext::default())
            .await
            .unwrap();
        let text = result.to_string();
        assert!(text.contains("1. Rust"));
        assert!(text.contains("rust-lang.org"));
    }

    #[tokio::test]
    async fn test_web_search_without_backend() {
        let tool = WebSearchTool::new(None);
        let result = tool
            .execute(json!({"query": "rust"}), &ExecutionContext::default())
            .await
            .unwrap();
        assert!(result.is_error());
        assert!(result.to_string().contains("not configured"));
    }

    #[tokio::test]
    async fn test_rag_query_formats_chunks() {
        let tool = RagQueryTool::new(Some(Arc::new(FixedRag)));
        let result = tool
            .execute(json!({"query": "what is it"}), &ExecutionContext::default())
            .await
            .unwrap();
        let text = result.to_string();
        assert!(text.contains("handbook.md"));
        assert!(text.contains("0.870"));
    }

    #[tokio::test]
    async fn test_rag_query_without_backend() {
        let tool = RagQueryTool::new(None);
        let result = tool
            .execute(json!({"query": "x"}), &ExecutionContext::default())
            .await
            .unwrap();
        assert!(result.is_error());
    }
}
