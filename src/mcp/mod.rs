pub mod http;
pub mod stdio;

use crate::errors::{DroverError, DroverResult};
use crate::providers::base::ToolDefinition;
use crate::rbac::Role;
use crate::tools::base::{ContentPart, ExecutionContext, ToolResult, ToolStatus};
use crate::tools::registry::canonical_json;
use crate::tools::setup::SandboxedTools;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Server id of the bundled built-in tool server.
pub const BUILTIN_SERVER_ID: &str = "drover-tools";

/// Transport configuration for an MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "transport")]
pub enum TransportConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Http {
        url: String,
    },
    Builtin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// A tool advertised by an MCP server, cached at discovery time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolDescriptor {
    pub server_id: String,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

enum Connection {
    Stdio(stdio::StdioClient),
    Http(http::HttpClient),
    Builtin(Arc<SandboxedTools>),
}

struct McpServer {
    config: McpServerConfig,
    conn: Option<Connection>,
    tools: Vec<McpToolDescriptor>,
}

/// Rewrite an external tool name to encode its origin server.
pub fn mangle(server_id: &str, tool_name: &str) -> String {
    format!("mcp_{}_{}", server_id, tool_name)
}

/// Invert [`mangle`]: split on the first `_` after the `mcp_` prefix.
/// Total on well-formed names; fails loudly otherwise. Sound because
/// server ids are forbidden from containing `_`.
pub fn demangle(name: &str) -> DroverResult<(String, String)> {
    let rest = name
        .strip_prefix("mcp_")
        .ok_or_else(|| DroverError::BadToolName(name.to_string()))?;
    match rest.split_once('_') {
        Some((server, tool)) if !server.is_empty() && !tool.is_empty() => {
            Ok((server.to_string(), tool.to_string()))
        }
        _ => Err(DroverError::BadToolName(name.to_string())),
    }
}

/// True when the loop should route this tool name through the multiplexer.
pub fn is_mangled(name: &str) -> bool {
    name.starts_with("mcp_")
}

/// Single-flight key for one dispatch within an agent step: duplicate
/// model-emitted calls hash identically regardless of argument key order.
pub fn flight_key(target: &str, args: &Value) -> String {
    format!("{}:{}", target, canonical_json(args))
}

/// Registry and router for external tool servers.
///
/// Descriptor caches are read-mostly: discovery and server add/remove take
/// the write lock, dispatch proceeds under a read snapshot.
pub struct McpMultiplexer {
    servers: RwLock<HashMap<String, McpServer>>,
}

impl McpMultiplexer {
    pub fn new() -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
        }
    }

    fn validate(config: &McpServerConfig) -> DroverResult<()> {
        if config.id.is_empty() {
            return Err(DroverError::SchemaViolation(
                "server id must not be empty".to_string(),
            ));
        }
        // The demangling split is on the first underscore; ids containing
        // one would corrupt dispatch, so discovery rejects them outright.
        if config.id.contains('_') {
            return Err(DroverError::BadToolName(format!(
                "server id '{}' must not contain '_'",
                config.id
            )));
        }
        match &config.transport {
            TransportConfig::Stdio { command, .. } if command.is_empty() => Err(
                DroverError::SchemaViolation("stdio transport requires a command".to_string()),
            ),
            TransportConfig::Http { url } if url.is_empty() => Err(DroverError::SchemaViolation(
                "http transport requires a url".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Register a server, connect, and discover its tools. A connection
    /// failure leaves the server registered but inactive.
    pub async fn add_server(&self, config: McpServerConfig) -> DroverResult<()> {
        Self::validate(&config)?;
        let id = config.id.clone();

        let connected = match &config.transport {
            TransportConfig::Stdio { command, args } => {
                match stdio::StdioClient::connect(&id, command, args, &config.env).await {
                    Ok(client) => Some(Connection::Stdio(client)),
                    Err(e) => {
                        warn!("failed to connect MCP server '{}': {}", id, e);
                        None
                    }
                }
            }
            TransportConfig::Http { url } => Some(Connection::Http(http::HttpClient::new(url))),
            TransportConfig::Builtin => {
                return Err(DroverError::SchemaViolation(
                    "builtin servers are registered through add_builtin_server".to_string(),
                ));
            }
        };

        let mut config = config;
        config.is_active = connected.is_some();
        let server = McpServer {
            config,
            conn: connected,
            tools: Vec::new(),
        };
        self.servers.write().await.insert(id.clone(), server);

        if let Err(e) = self.rediscover(&id).await {
            warn!("tool discovery failed for MCP server '{}': {}", id, e);
            // The server may have been removed concurrently between the
            // insert above and this reacquisition; nothing to mark then.
            if let Some(server) = self.servers.write().await.get_mut(&id) {
                server.config.is_active = false;
            }
        }
        Ok(())
    }

    /// Register the built-in tool server, exposing the local registry over
    /// the same multiplexer surface as external servers.
    pub async fn add_builtin_server(&self, tools: Arc<SandboxedTools>) -> DroverResult<()> {
        let descriptors: Vec<McpToolDescriptor> = tools
            .registry()
            .definitions()
            .into_iter()
            .map(|d| McpToolDescriptor {
                server_id: BUILTIN_SERVER_ID.to_string(),
                name: d.name,
                description: d.description,
                input_schema: d.parameters,
            })
            .collect();

        let server = McpServer {
            config: McpServerConfig {
                id: BUILTIN_SERVER_ID.to_string(),
                name: "Drover Tools".to_string(),
                transport: TransportConfig::Builtin,
                env: HashMap::new(),
                is_active: true,
            },
            conn: Some(Connection::Builtin(tools)),
            tools: descriptors,
        };
        self.servers
            .write()
            .await
            .insert(BUILTIN_SERVER_ID.to_string(), server);
        Ok(())
    }

    /// Close the connection and drop the descriptor cache.
    pub async fn remove_server(&self, server_id: &str) -> bool {
        let removed = self.servers.write().await.remove(server_id);
        match removed {
            Some(server) => {
                if let Some(Connection::Stdio(client)) = server.conn {
                    client.shutdown().await;
                }
                info!("removed MCP server '{}'", server_id);
                true
            }
            None => false,
        }
    }

    /// Re-run discovery for one server, fully replacing its cache.
    pub async fn rediscover(&self, server_id: &str) -> DroverResult<usize> {
        let discovered = {
            let servers = self.servers.read().await;
            let server = servers
                .get(server_id)
                .ok_or_else(|| DroverError::ServerNotFound(server_id.to_string()))?;
            match &server.conn {
                Some(Connection::Stdio(client)) => {
                    client.list_tools().await.map_err(|e| unavailable(server_id, e))?
                }
                Some(Connection::Http(client)) => {
                    client.list_tools().await.map_err(|e| unavailable(server_id, e))?
                }
                Some(Connection::Builtin(tools)) => tools
                    .registry()
                    .definitions()
                    .into_iter()
                    .map(|d| (d.name, d.description, d.parameters))
                    .collect(),
                None => {
                    return Err(DroverError::ServerUnavailable {
                        server: server_id.to_string(),
                        message: "not connected".to_string(),
                    });
                }
            }
        };

        let descriptors: Vec<McpToolDescriptor> = discovered
            .into_iter()
            .map(|(name, description, input_schema)| McpToolDescriptor {
                server_id: server_id.to_string(),
                name,
                description,
                input_schema,
            })
            .collect();
        let count = descriptors.len();

        let mut servers = self.servers.write().await;
        let server = servers
            .get_mut(server_id)
            .ok_or_else(|| DroverError::ServerNotFound(server_id.to_string()))?;
        server.tools = descriptors;
        info!("discovered {} tools on MCP server '{}'", count, server_id);
        Ok(count)
    }

    pub async fn list_servers(&self) -> Vec<McpServerConfig> {
        let servers = self.servers.read().await;
        let mut out: Vec<_> = servers.values().map(|s| s.config.clone()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Cached descriptors for one server, as an order-independent set is
    /// not needed here: discovery order is preserved.
    pub async fn tools_for_server(&self, server_id: &str) -> Vec<McpToolDescriptor> {
        let servers = self.servers.read().await;
        servers
            .get(server_id)
            .map(|s| s.tools.clone())
            .unwrap_or_default()
    }

    /// The fixed visibility policy table. user and rag_user see nothing,
    /// agent_user sees the built-in server, agent_developer adds custom
    /// servers, admin and owner see everything.
    pub async fn visible_servers(&self, role: Role) -> Vec<String> {
        let servers = self.servers.read().await;
        let mut out: Vec<String> = servers
            .values()
            .filter(|s| {
                let builtin = matches!(s.config.transport, TransportConfig::Builtin);
                match role {
                    Role::User | Role::RagUser => false,
                    Role::AgentUser => builtin,
                    Role::AgentDeveloper => true,
                    Role::Admin | Role::Owner => true,
                }
            })
            .map(|s| s.config.id.clone())
            .collect();
        out.sort();
        out
    }

    pub async fn is_visible(&self, role: Role, server_id: &str) -> bool {
        self.visible_servers(role)
            .await
            .iter()
            .any(|s| s == server_id)
    }

    /// Mangled tool definitions across every active server visible to the
    /// role. This is the schema handed to the model.
    pub async fn visible_tool_definitions(&self, role: Role) -> Vec<ToolDefinition> {
        let visible = self.visible_servers(role).await;
        let servers = self.servers.read().await;
        let mut defs = Vec::new();
        for id in visible {
            let Some(server) = servers.get(&id) else {
                continue;
            };
            if !server.config.is_active {
                continue;
            }
            for tool in &server.tools {
                defs.push(ToolDefinition {
                    name: mangle(&tool.server_id, &tool.name),
                    description: format!("[MCP:{}] {}", server.config.name, tool.description),
                    parameters: tool.input_schema.clone(),
                });
            }
        }
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Route one invocation to the owning server's transport. Transport
    /// failures surface as `server_unavailable`; retrying is the caller's
    /// decision, never the multiplexer's.
    pub async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        args: &Value,
        ctx: &ExecutionContext,
    ) -> DroverResult<ToolResult> {
        let servers = self.servers.read().await;
        let server = servers
            .get(server_id)
            .ok_or_else(|| DroverError::ServerNotFound(server_id.to_string()))?;
        if !server.config.is_active {
            return Err(DroverError::ServerUnavailable {
                server: server_id.to_string(),
                message: "server is inactive".to_string(),
            });
        }

        match &server.conn {
            Some(Connection::Stdio(client)) => {
                let value = client
                    .call_tool(tool_name, args)
                    .await
                    .map_err(|e| unavailable(server_id, e))?;
                Ok(value_to_tool_result(&value))
            }
            Some(Connection::Http(client)) => {
                let value = client
                    .call_tool(tool_name, args)
                    .await
                    .map_err(|e| unavailable(server_id, e))?;
                Ok(value_to_tool_result(&value))
            }
            Some(Connection::Builtin(tools)) => tools
                .registry()
                .execute(tool_name, args.clone(), ctx)
                .await
                .map_err(|e| DroverError::ToolRuntime {
                    tool: tool_name.to_string(),
                    message: e.to_string(),
                }),
            None => Err(DroverError::ServerUnavailable {
                server: server_id.to_string(),
                message: "not connected".to_string(),
            }),
        }
    }

    /// Dispatch by mangled name, enforcing server visibility for the role.
    pub async fn call_mangled(
        &self,
        role: Role,
        mangled_name: &str,
        args: &Value,
        ctx: &ExecutionContext,
    ) -> DroverResult<ToolResult> {
        let (server_id, tool_name) = demangle(mangled_name)?;
        if !self.is_visible(role, &server_id).await {
            return Err(DroverError::ServerNotVisible(server_id));
        }
        self.call_tool(&server_id, &tool_name, args, ctx).await
    }
}

impl Default for McpMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

fn unavailable(server_id: &str, e: anyhow::Error) -> DroverError {
    DroverError::ServerUnavailable {
        server: server_id.to_string(),
        message: e.to_string(),
    }
}

/// Convert an MCP `tools/call` result (`{content: [...], isError}`) into a
/// local tool result. A remote's own `pending_approval` envelope passes
/// through verbatim as text: the remote owns that pending id.
fn value_to_tool_result(value: &Value) -> ToolResult {
    if value["status"].as_str() == Some("pending_approval") {
        return ToolResult {
            status: ToolStatus::Success,
            content: vec![ContentPart::Text {
                text: value.to_string(),
            }],
            safety: crate::sandbox::SafetyLevel::Safe,
        };
    }

    let is_error = value["isError"].as_bool().unwrap_or(false);
    let mut parts = Vec::new();
    if let Some(content) = value["content"].as_array() {
        for item in content {
            match item["type"].as_str() {
                Some("text") => parts.push(ContentPart::Text {
                    text: item["text"].as_str().unwrap_or("").to_string(),
                }),
                Some("image") => parts.push(ContentPart::Image {
                    data: item["data"].as_str().unwrap_or("").to_string(),
                    mime_type: item["mimeType"].as_str().unwrap_or("image/png").to_string(),
                }),
                _ => parts.push(ContentPart::Text {
                    text: item.to_string(),
                }),
            }
        }
    } else {
        parts.push(ContentPart::Text {
            text: value.to_string(),
        });
    }

    ToolResult {
        status: if is_error {
            ToolStatus::Error
        } else {
            ToolStatus::Success
        },
        content: parts,
        safety: crate::sandbox::SafetyLevel::Safe,
    }
}
