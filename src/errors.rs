use thiserror::Error;

/// Typed error hierarchy for drover.
///
/// Use at module boundaries (sandbox resolution, approval gating, MCP
/// dispatch, spawning, provider calls). Internal/leaf functions can continue
/// using `anyhow::Result` — the `Internal` variant allows seamless conversion
/// via the `?` operator.
///
/// Tool-level failures are never raised through the agent loop; they are
/// reified into tool-result messages. Governance failures (RBAC, spawn
/// limits) abort the operation and surface one of these variants.
#[derive(Debug, Error)]
pub enum DroverError {
    // Path / sandbox
    #[error("path escapes sandbox: {0}")]
    PathEscape(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("not a file: {0}")]
    NotAFile(String),

    // Command safety
    #[error("command blocked by dangerous pattern '{pattern}': {command}")]
    BlockedDangerousPattern { pattern: String, command: String },

    // Approval
    #[error("no pending call with id {0}")]
    PendingNotFound(String),

    #[error("pending call {0} expired")]
    PendingExpired(String),

    // RBAC
    #[error("insufficient role: requires {required}, current {current}")]
    InsufficientRole { required: String, current: String },

    #[error("tool '{0}' is not allowed for this agent")]
    ToolNotAllowed(String),

    #[error("MCP server '{0}' is not visible to this role")]
    ServerNotVisible(String),

    // Spawning
    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("spawn limit exceeded: {0}")]
    SpawnLimitExceeded(String),

    #[error("spawn depth limit ({0}) exceeded")]
    SpawnDepthExceeded(u32),

    #[error("circular ancestry detected at instance {0}")]
    SpawnCircular(String),

    // Execution
    #[error("tool '{tool}' timed out after {seconds}s")]
    ToolTimeout { tool: String, seconds: u64 },

    #[error("tool '{tool}' failed: {message}")]
    ToolRuntime { tool: String, message: String },

    #[error("model unavailable after retries: {0}")]
    ModelUnavailable(String),

    // Transport
    #[error("MCP server not found: {0}")]
    ServerNotFound(String),

    #[error("MCP server '{server}' unavailable: {message}")]
    ServerUnavailable { server: String, message: String },

    #[error("bad tool name: {0}")]
    BadToolName(String),

    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Convenience alias for results using `DroverError`.
pub type DroverResult<T> = std::result::Result<T, DroverError>;

impl DroverError {
    /// Whether this error should be handed back to the model as a
    /// tool-result instead of aborting the loop. Governance failures
    /// (RBAC, spawning) and provider death are the only loop-terminating
    /// kinds.
    pub fn is_tool_level(&self) -> bool {
        matches!(
            self,
            DroverError::PathEscape(_)
                | DroverError::NotADirectory(_)
                | DroverError::NotAFile(_)
                | DroverError::BlockedDangerousPattern { .. }
                | DroverError::ToolTimeout { .. }
                | DroverError::ToolRuntime { .. }
                | DroverError::ServerNotFound(_)
                | DroverError::ServerUnavailable { .. }
                | DroverError::BadToolName(_)
                | DroverError::SchemaViolation(_)
        )
    }

    /// Short machine-readable kind tag, used in tool-result payloads and
    /// event log entries.
    pub fn kind(&self) -> &'static str {
        match self {
            DroverError::PathEscape(_) => "path_escape",
            DroverError::NotADirectory(_) => "not_a_directory",
            DroverError::NotAFile(_) => "not_a_file",
            DroverError::BlockedDangerousPattern { .. } => "blocked_dangerous_pattern",
            DroverError::PendingNotFound(_) => "pending_not_found",
            DroverError::PendingExpired(_) => "pending_expired",
            DroverError::InsufficientRole { .. } => "insufficient_role",
            DroverError::ToolNotAllowed(_) => "tool_not_allowed",
            DroverError::ServerNotVisible(_) => "server_not_visible",
            DroverError::TemplateNotFound(_) => "template_not_found",
            DroverError::SpawnLimitExceeded(_) => "spawn_limit_exceeded",
            DroverError::SpawnDepthExceeded(_) => "spawn_depth_exceeded",
            DroverError::SpawnCircular(_) => "spawn_circular",
            DroverError::ToolTimeout { .. } => "tool_timeout",
            DroverError::ToolRuntime { .. } => "tool_runtime_error",
            DroverError::ModelUnavailable(_) => "model_unavailable",
            DroverError::ServerNotFound(_) => "server_not_found",
            DroverError::ServerUnavailable { .. } => "server_unavailable",
            DroverError::BadToolName(_) => "bad_tool_name",
            DroverError::SchemaViolation(_) => "schema_violation",
            DroverError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_escape_display() {
        let err = DroverError::PathEscape("../etc/passwd".into());
        assert_eq!(err.to_string(), "path escapes sandbox: ../etc/passwd");
        assert_eq!(err.kind(), "path_escape");
        assert!(err.is_tool_level());
    }

    #[test]
    fn governance_errors_are_not_tool_level() {
        let err = DroverError::InsufficientRole {
            required: "admin".into(),
            current: "user".into(),
        };
        assert!(!err.is_tool_level());
        assert_eq!(err.kind(), "insufficient_role");

        let err = DroverError::SpawnDepthExceeded(3);
        assert!(!err.is_tool_level());
    }

    #[test]
    fn timeout_display_names_tool_and_duration() {
        let err = DroverError::ToolTimeout {
            tool: "run_command".into(),
            seconds: 30,
        };
        assert_eq!(err.to_string(), "tool 'run_command' timed out after 30s");
    }

    #[test]
    fn internal_from_anyhow() {
        let anyhow_err = anyhow::anyhow!("something broke");
        let err: DroverError = anyhow_err.into();
        assert!(matches!(err, DroverError::Internal(_)));
        assert_eq!(err.kind(), "internal");
    }
}
