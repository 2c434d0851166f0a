use crate::approval::{ApprovalMode, PendingSet};
use crate::errors::DroverResult;
use crate::sandbox::Sandbox;
use crate::tools::setup::{SandboxedTools, ToolBuildContext};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

/// Per-principal runtime state: sandbox, approval mode, pending calls, and
/// the sandbox-bound tool handle.
///
/// Invariant: `tools` is `Some` exactly when `sandbox` is; the handle is
/// built from the sandbox and replaced with it.
pub struct Session {
    pub principal_id: String,
    pub mode: ApprovalMode,
    pub pending: PendingSet,
    sandbox: Option<Arc<Sandbox>>,
    tools: Option<Arc<SandboxedTools>>,
}

impl Session {
    fn new(principal_id: &str, pending_ttl: Duration) -> Self {
        Self {
            principal_id: principal_id.to_string(),
            mode: ApprovalMode::default(),
            pending: PendingSet::with_ttl(pending_ttl),
            sandbox: None,
            tools: None,
        }
    }

    pub fn sandbox(&self) -> Option<&Arc<Sandbox>> {
        self.sandbox.as_ref()
    }

    pub fn tools(&self) -> Option<&Arc<SandboxedTools>> {
        self.tools.as_ref()
    }

    /// Point the session at a sandbox root, rebuilding the tool handle.
    /// An invalid path fails the operation and leaves the current handle
    /// untouched.
    pub fn set_sandbox(&mut self, path: &str, build_ctx: &ToolBuildContext) -> DroverResult<()> {
        let sandbox = Arc::new(Sandbox::new(path)?);
        let tools = Arc::new(SandboxedTools::build(sandbox.clone(), build_ctx));
        info!(
            principal = %self.principal_id,
            root = %sandbox.root().display(),
            "session sandbox set"
        );
        self.sandbox = Some(sandbox);
        self.tools = Some(tools);
        Ok(())
    }

    pub fn set_mode(&mut self, mode: ApprovalMode) {
        self.mode = mode;
    }
}

/// Process-local `principal_id -> Session` map. Sessions are created
/// lazily; pending calls and tool handles are never shared across
/// sessions.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<Mutex<Session>>>>,
    build_ctx: ToolBuildContext,
    pending_ttl: Duration,
}

impl SessionManager {
    pub fn new(build_ctx: ToolBuildContext, pending_ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            build_ctx,
            pending_ttl,
        }
    }

    pub fn build_ctx(&self) -> &ToolBuildContext {
        &self.build_ctx
    }

    pub async fn get_or_create(&self, principal_id: &str) -> Arc<Mutex<Session>> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(principal_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Session::new(principal_id, self.pending_ttl)))
            })
            .clone()
    }

    /// Convenience wrapper: set the sandbox for a principal's session.
    pub async fn set_sandbox(&self, principal_id: &str, path: &str) -> DroverResult<()> {
        let session = self.get_or_create(principal_id).await;
        let mut session = session.lock().await;
        session.set_sandbox(path, &self.build_ctx)
    }

    pub async fn set_mode(&self, principal_id: &str, mode: ApprovalMode) {
        let session = self.get_or_create(principal_id).await;
        session.lock().await.set_mode(mode);
    }
}
