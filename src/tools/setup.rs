use crate::sandbox::Sandbox;
use crate::spawner::Spawner;
use crate::tools::exec::{RunCommandTool, RunPythonTool};
use crate::tools::filesystem::{ListDirTool, ReadFileTool, SearchFilesTool, WriteFileTool};
use crate::tools::planning::{PlanTaskTool, ThinkTool};
use crate::tools::registry::ToolRegistry;
use crate::tools::spawn::SpawnAgentTool;
use crate::tools::web::{RagBackend, RagQueryTool, SearchBackend, WebSearchTool};
use std::sync::Arc;
use tracing::debug;

/// Everything needed to assemble a session's tool registry.
#[derive(Clone, Default)]
pub struct ToolBuildContext {
    pub search_backend: Option<Arc<dyn SearchBackend>>,
    pub rag_backend: Option<Arc<dyn RagBackend>>,
    pub spawner: Option<Arc<Spawner>>,
}

/// A tool registry bound to one sandbox root. Created when a session sets
/// its sandbox and replaced wholesale when the sandbox changes; a session
/// without a sandbox has no tool handle at all.
pub struct SandboxedTools {
    sandbox: Arc<Sandbox>,
    registry: ToolRegistry,
}

impl SandboxedTools {
    pub fn build(sandbox: Arc<Sandbox>, ctx: &ToolBuildContext) -> Self {
        let mut registry = ToolRegistry::new();

        registry.register(Arc::new(ReadFileTool::new(sandbox.clone())));
        registry.register(Arc::new(WriteFileTool::new(sandbox.clone())));
        registry.register(Arc::new(ListDirTool::new(sandbox.clone())));
        registry.register(Arc::new(SearchFilesTool::new(sandbox.clone())));
        registry.register(Arc::new(RunCommandTool::new(sandbox.clone())));
        registry.register(Arc::new(RunPythonTool::new(sandbox.clone())));
        registry.register(Arc::new(WebSearchTool::new(ctx.search_backend.clone())));
        registry.register(Arc::new(RagQueryTool::new(ctx.rag_backend.clone())));
        registry.register(Arc::new(ThinkTool));
        registry.register(Arc::new(PlanTaskTool));
        if let Some(spawner) = &ctx.spawner {
            registry.register(Arc::new(SpawnAgentTool::new(spawner.clone())));
        }

        debug!(
            root = %sandbox.root().display(),
            tools = registry.tool_names().join(", "),
            "built sandboxed tool registry"
        );
        Self { sandbox, registry }
    }

    pub fn sandbox(&self) -> &Arc<Sandbox> {
        &self.sandbox
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }
}
