use crate::agent::{AgentRunner, ApprovalDriver, RunConfig, RunStatus};
use crate::approval::{ApprovalMode, PendingCall};
use crate::config::{Config, load_config};
use crate::mcp::{McpMultiplexer, TransportConfig};
use crate::providers::OpenAiProvider;
use crate::providers::base::ChatProvider;
use crate::rbac::{Principal, Role};
use crate::session::SessionManager;
use crate::spawner::{SpawnPolicy, Spawner};
use crate::store::Store;
use crate::tools::setup::ToolBuildContext;
use crate::tools::web::BraveSearchBackend;
use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "drover", version, about = "Agentic orchestration core")]
struct Cli {
    /// Path to config.json (default: ~/.drover/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Spawn an instance from a template and drive it to completion
    Run {
        /// Template id to spawn from
        #[arg(long)]
        template: String,
        /// The goal for the agent
        goal: String,
        /// Sandbox directory (default: current directory)
        #[arg(long)]
        sandbox: Option<PathBuf>,
        /// Skip approval for safe/moderate tools
        #[arg(long)]
        trust: bool,
        /// Principal id (default: local)
        #[arg(long, default_value = "local")]
        principal: String,
        /// Principal role
        #[arg(long, default_value = "owner")]
        role: String,
    },
    /// Manage agent templates
    Templates {
        #[command(subcommand)]
        command: TemplatesCommand,
    },
    /// Manage MCP servers
    Mcp {
        #[command(subcommand)]
        command: McpCommand,
    },
    /// Show the event log for an instance
    Events {
        instance: String,
        /// Include events from the whole spawn tree
        #[arg(long)]
        tree: bool,
    },
}

#[derive(Subcommand)]
enum TemplatesCommand {
    /// List active templates
    List,
    /// Create or update a template from a JSON file
    Create { file: PathBuf },
}

#[derive(Subcommand)]
enum McpCommand {
    /// List configured servers and their discovered tools
    List,
    /// Remove a server
    Remove { id: String },
}

/// Blocks on stdin for each parked call: the driver, not the loop, owns
/// the waiting.
struct StdinApprovalDriver;

#[async_trait]
impl ApprovalDriver for StdinApprovalDriver {
    async fn decide(&self, call: &PendingCall) -> Option<bool> {
        println!(
            "\napproval required [{}] {} {}",
            call.safety, call.tool_name, call.arguments
        );
        print!("approve? [y/N] ");
        let _ = std::io::stdout().flush();

        let answer = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).ok()?;
            Some(line.trim().to_lowercase())
        })
        .await
        .ok()
        .flatten();

        match answer.as_deref() {
            Some("y") | Some("yes") => Some(true),
            _ => Some(false),
        }
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Run {
            template,
            goal,
            sandbox,
            trust,
            principal,
            role,
        } => run_agent(&config, &template, &goal, sandbox, trust, &principal, &role).await,
        Command::Templates { command } => templates(&config, command),
        Command::Mcp { command } => mcp(&config, command).await,
        Command::Events { instance, tree } => events(&config, &instance, tree),
    }
}

fn open_store(config: &Config) -> Result<Arc<Store>> {
    Ok(Arc::new(Store::open(config.database_path()?)?))
}

async fn build_multiplexer(config: &Config) -> Result<Arc<McpMultiplexer>> {
    let mux = Arc::new(McpMultiplexer::new());
    for server in &config.mcp.servers {
        if !server.is_active {
            continue;
        }
        if let Err(e) = mux.add_server(server.clone()).await {
            eprintln!("warning: MCP server '{}' not added: {}", server.id, e);
        }
    }
    Ok(mux)
}

#[allow(clippy::too_many_arguments)]
async fn run_agent(
    config: &Config,
    template: &str,
    goal: &str,
    sandbox: Option<PathBuf>,
    trust: bool,
    principal_id: &str,
    role: &str,
) -> Result<()> {
    let store = open_store(config)?;
    let spawner = Arc::new(Spawner::new(
        store.clone(),
        SpawnPolicy {
            max_depth: config.policy.max_depth,
            max_total_instances: config.policy.max_total_instances,
        },
    ));

    let search_backend = (!config.tools.search_api_key.is_empty()).then(|| {
        Arc::new(BraveSearchBackend::new(config.tools.search_api_key.clone()))
            as Arc<dyn crate::tools::web::SearchBackend>
    });
    let build_ctx = ToolBuildContext {
        search_backend,
        rag_backend: None,
        spawner: Some(spawner.clone()),
    };
    let sessions = Arc::new(SessionManager::new(build_ctx, config.pending_ttl()));

    let principal = Principal::new(principal_id, Role::parse(role));
    let sandbox_path = match sandbox {
        Some(path) => path,
        None => std::env::current_dir().context("could not determine current directory")?,
    };
    sessions
        .set_sandbox(
            principal_id,
            sandbox_path.to_str().context("sandbox path is not UTF-8")?,
        )
        .await?;
    if trust {
        sessions.set_mode(principal_id, ApprovalMode::TrustMode).await;
    }

    let provider: Arc<dyn ChatProvider> = Arc::new(OpenAiProvider::new(
        config.provider.api_key.clone(),
        config.provider.model.clone(),
        config.provider.base_url.clone(),
    ));
    let mux = build_multiplexer(config).await?;

    let instance = spawner.spawn(&principal, template, goal, None, None)?;
    println!("spawned instance {}", instance.id);

    let runner = AgentRunner::new(provider, sessions, mux, store, RunConfig::default());
    let outcome = runner
        .run_instance(&principal, &instance.id, &StdinApprovalDriver)
        .await?;

    match &outcome.status {
        RunStatus::Completed => println!("\n{}", outcome.content),
        RunStatus::MaxStepsReached => {
            println!("\n[stopped: step budget reached]\n{}", outcome.content);
        }
        RunStatus::BudgetExhausted => {
            println!("\n[stopped: token budget exhausted]\n{}", outcome.content);
        }
        RunStatus::AwaitingApproval { call_id, safety } => {
            println!(
                "\n[suspended: call {} awaiting approval (safety: {})]",
                call_id, safety
            );
        }
        RunStatus::Cancelled => println!("\n[cancelled]"),
    }
    println!(
        "\nsteps: {}  tokens: {}",
        outcome.steps, outcome.tokens_used
    );
    Ok(())
}

fn templates(config: &Config, command: TemplatesCommand) -> Result<()> {
    let store = open_store(config)?;
    match command {
        TemplatesCommand::List => {
            for template in store.list_templates()? {
                println!(
                    "{}  v{}  [{}]  {}",
                    template.id,
                    template.version,
                    template.scope.as_str(),
                    template.spec.objective
                );
            }
        }
        TemplatesCommand::Create { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let template: crate::spawner::Template = serde_json::from_str(&content)
                .with_context(|| format!("failed to parse template from {}", file.display()))?;
            let saved = store.save_template(&template)?;
            println!("saved template {} v{}", saved.id, saved.version);
        }
    }
    Ok(())
}

async fn mcp(config: &Config, command: McpCommand) -> Result<()> {
    match command {
        McpCommand::List => {
            let mux = build_multiplexer(config).await?;
            for server in mux.list_servers().await {
                let transport = match &server.transport {
                    TransportConfig::Stdio { command, .. } => format!("stdio ({})", command),
                    TransportConfig::Http { url } => format!("http ({})", url),
                    TransportConfig::Builtin => "builtin".to_string(),
                };
                let state = if server.is_active { "active" } else { "inactive" };
                println!("{}  {}  {}", server.id, transport, state);
                for tool in mux.tools_for_server(&server.id).await {
                    println!("    {}", tool.name);
                }
            }
        }
        McpCommand::Remove { id } => {
            // Server definitions live in the config file; removal here only
            // verifies the id and reminds where to edit.
            let known = config.mcp.servers.iter().any(|s| s.id == id);
            if known {
                println!("remove '{}' from the mcp.servers section of config.json", id);
            } else {
                println!("no server '{}' in config", id);
            }
        }
    }
    Ok(())
}

fn events(config: &Config, instance: &str, tree: bool) -> Result<()> {
    let store = open_store(config)?;
    let events = if tree {
        store.events_for_root(instance)?
    } else {
        store.events_for_instance(instance)?
    };
    for event in events {
        println!(
            "{}  {}  {}  {}",
            event.timestamp.to_rfc3339(),
            event.instance_id,
            event.event_type.as_str(),
            event.payload
        );
    }
    Ok(())
}
