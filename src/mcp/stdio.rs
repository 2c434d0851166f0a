use anyhow::{Context, Result};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Environment variables forwarded to MCP server processes.
const ALLOWED_ENV_VARS: &[&str] = &["PATH", "HOME", "USER", "LANG", "LC_ALL", "TZ", "TMPDIR"];

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;

/// Line-delimited JSON-RPC 2.0 client over a child process's stdio.
///
/// A reader task owns stdout and routes responses to pending requests by
/// id. Server-initiated requests and notifications are ignored; the core
/// only consumes `initialize`, `tools/list`, and `tools/call`.
pub struct StdioClient {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    pending: PendingMap,
    next_id: AtomicU64,
    reader: tokio::task::JoinHandle<()>,
    server_id: String,
}

impl StdioClient {
    /// Spawn the server process and run the `initialize` handshake.
    pub async fn connect(
        server_id: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        // Scrubbed environment plus the server's own overlay.
        cmd.env_clear();
        for &var in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(var) {
                cmd.env(var, val);
            }
        }
        for (k, v) in env {
            cmd.env(k, v);
        }
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::inherit());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn MCP server '{}'", server_id))?;
        let stdin = child.stdin.take().context("MCP server stdin unavailable")?;
        let stdout = child
            .stdout
            .take()
            .context("MCP server stdout unavailable")?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = pending.clone();
        let reader_server = server_id.to_string();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let Ok(message) = serde_json::from_str::<Value>(line) else {
                            warn!("MCP server '{}' sent non-JSON line", reader_server);
                            continue;
                        };
                        let Some(id) = message["id"].as_u64() else {
                            // Notification or server-initiated request.
                            debug!(
                                "MCP server '{}' message without numeric id ignored",
                                reader_server
                            );
                            continue;
                        };
                        let outcome = if message.get("error").is_some_and(|e| !e.is_null()) {
                            let code = message["error"]["code"].as_i64().unwrap_or(0);
                            let text = message["error"]["message"].as_str().unwrap_or("unknown");
                            Err(format!("JSON-RPC error {}: {}", code, text))
                        } else {
                            Ok(message["result"].clone())
                        };
                        if let Some(tx) = reader_pending.lock().await.remove(&id) {
                            let _ = tx.send(outcome);
                        }
                    }
                    Ok(None) => break, // EOF: server exited
                    Err(e) => {
                        warn!("MCP server '{}' stdout read error: {}", reader_server, e);
                        break;
                    }
                }
            }
            // Fail anything still in flight so callers see the death.
            let mut map = reader_pending.lock().await;
            for (_, tx) in map.drain() {
                let _ = tx.send(Err("server connection closed".to_string()));
            }
        });

        let client = Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            reader,
            server_id: server_id.to_string(),
        };

        let init = client
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "clientInfo": {"name": "drover", "version": crate::VERSION},
                }),
            )
            .await
            .with_context(|| format!("MCP handshake failed for server '{}'", server_id))?;
        debug!(
            "MCP server '{}' initialized (protocol {})",
            server_id,
            init["protocolVersion"].as_str().unwrap_or("?")
        );
        client.notify("notifications/initialized", json!({})).await?;

        Ok(client)
    }

    async fn send_line(&self, payload: &Value) -> Result<()> {
        let mut line = serde_json::to_string(payload)?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("write to MCP server '{}' failed", self.server_id))?;
        stdin.flush().await?;
        Ok(())
    }

    async fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.send_line(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        }))
        .await
    }

    /// Send one request and await its response, bounded by the request
    /// timeout.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let sent = self
            .send_line(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }))
            .await;
        if let Err(e) = sent {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(rpc_error))) => anyhow::bail!(rpc_error),
            Ok(Err(_)) => anyhow::bail!("server connection closed"),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                anyhow::bail!(
                    "request '{}' to MCP server '{}' timed out",
                    method,
                    self.server_id
                )
            }
        }
    }

    /// `tools/list`: the advertised descriptor set.
    pub async fn list_tools(&self) -> Result<Vec<(String, String, Value)>> {
        let result = self.request("tools/list", json!({})).await?;
        let tools = result["tools"]
            .as_array()
            .context("tools/list result missing 'tools' array")?;
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

    /// `tools/call`: returns the raw result value
    /// (`{content: [...], isError}`).
    pub async fn call_tool(&self, name: &str, arguments: &Value) -> Result<Value> {
        self.request(
            "tools/call",
            json!({"name": name, "arguments": arguments}),
        )
        .await
    }

    /// Kill the server process and stop the reader.
    pub async fn shutdown(self) {
        self.reader.abort();
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            warn!("failed to kill MCP server '{}': {}", self.server_id, e);
        }
    }
}
