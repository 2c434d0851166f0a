use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rbac::Role;

/// How the agent loop drives the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One model call; emitted tool calls are ignored (with a warning).
    Single,
    /// ReAct loop until no tool calls or the step budget runs out.
    #[default]
    MultiStep,
    /// Same loop, but the first turn asks for an explicit plan.
    Planner,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Single => "single",
            ExecutionMode::MultiStep => "multi_step",
            ExecutionMode::Planner => "planner",
        }
    }
}

/// Serializable execution policy for an agent: what it can do and how it
/// should behave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    /// The primary goal or persona description.
    pub objective: String,
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default)]
    pub summarization: Value,
    #[serde(default)]
    pub output_constraints: Value,
}

fn default_max_steps() -> u32 {
    10
}

impl Default for AgentSpec {
    fn default() -> Self {
        Self {
            objective: "a helpful AI assistant".to_string(),
            allowed_models: vec![],
            allowed_tools: vec![],
            execution_mode: ExecutionMode::default(),
            max_steps: default_max_steps(),
            summarization: Value::Null,
            output_constraints: Value::Null,
        }
    }
}

/// Template visibility scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateScope {
    /// Only the owner.
    Personal,
    /// Members of the same org; admin proxy while user/org membership
    /// tables live outside this core.
    Org,
    /// Anyone.
    Global,
}

impl TemplateScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateScope::Personal => "personal",
            TemplateScope::Org => "org",
            TemplateScope::Global => "global",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "personal" => Some(TemplateScope::Personal),
            "org" => Some(TemplateScope::Org),
            "global" => Some(TemplateScope::Global),
            _ => None,
        }
    }
}

/// A stored agent template. The spec is immutable per `(id, version)`;
/// updates bump `version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub scope: TemplateScope,
    pub required_roles: Vec<Role>,
    pub spec: AgentSpec,
    pub version: u32,
    /// Hard cap on the tools this template may ever grant. Empty means no
    /// additional cap beyond the spec's own allow list.
    pub max_template_tools: Vec<String>,
    pub is_active: bool,
}

/// The capability set actually exposed to an instance. Derived at spawn
/// time, never stored raw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectivePermissions {
    pub tools: Vec<String>,
    pub models: Vec<String>,
    pub max_steps: u32,
    pub token_budget: u64,
}

/// Instance lifecycle states. `status` is monotone: only the edges
/// accepted by [`InstanceStatus::can_transition_to`] are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Queued,
    Running,
    AwaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Queued => "queued",
            InstanceStatus::Running => "running",
            InstanceStatus::AwaitingApproval => "awaiting_approval",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(InstanceStatus::Queued),
            "running" => Some(InstanceStatus::Running),
            "awaiting_approval" => Some(InstanceStatus::AwaitingApproval),
            "completed" => Some(InstanceStatus::Completed),
            "failed" => Some(InstanceStatus::Failed),
            "cancelled" => Some(InstanceStatus::Cancelled),
            _ => None,
        }
    }

    /// Whether this state still counts against the concurrent-instance cap.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Queued | InstanceStatus::Running | InstanceStatus::AwaitingApproval
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Running, AwaitingApproval)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (AwaitingApproval, Running)
                | (AwaitingApproval, Cancelled)
                | (AwaitingApproval, Failed)
        )
    }
}

/// A spawned agent instance with its ancestry links.
///
/// Invariants: `root_instance_id == id` and `depth == 0` when there is no
/// parent; `depth == parent.depth + 1` otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub template_id: String,
    pub template_version: u32,
    pub spawned_by_user_id: String,
    pub parent_instance_id: Option<String>,
    pub root_instance_id: String,
    pub depth: u32,
    pub status: InstanceStatus,
    pub current_state: String,
    pub step: u32,
    pub task: String,
    pub context: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub tokens_used: u64,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use InstanceStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(AwaitingApproval));
        assert!(Running.can_transition_to(Completed));
        assert!(AwaitingApproval.can_transition_to(Running));
        assert!(AwaitingApproval.can_transition_to(Cancelled));

        // No resurrection, no skipping
        assert!(!Completed.can_transition_to(Running));
        assert!(!Queued.can_transition_to(Completed));
        assert!(!Cancelled.can_transition_to(Running));
        assert!(!AwaitingApproval.can_transition_to(Completed));
    }

    #[test]
    fn test_status_classes() {
        assert!(InstanceStatus::Queued.is_active());
        assert!(InstanceStatus::AwaitingApproval.is_active());
        assert!(!InstanceStatus::Completed.is_active());
        assert!(InstanceStatus::Failed.is_terminal());
        assert!(!InstanceStatus::Running.is_terminal());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            InstanceStatus::Queued,
            InstanceStatus::Running,
            InstanceStatus::AwaitingApproval,
            InstanceStatus::Completed,
            InstanceStatus::Failed,
            InstanceStatus::Cancelled,
        ] {
            assert_eq!(InstanceStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(InstanceStatus::parse("zombie"), None);
    }

    #[test]
    fn test_agent_spec_defaults() {
        let spec: AgentSpec = serde_json::from_str(r#"{"objective": "a test agent"}"#).unwrap();
        assert_eq!(spec.max_steps, 10);
        assert_eq!(spec.execution_mode, ExecutionMode::MultiStep);
        assert!(spec.allowed_tools.is_empty());
    }

    #[test]
    fn test_execution_mode_serde() {
        let mode: ExecutionMode = serde_json::from_str("\"planner\"").unwrap();
        assert_eq!(mode, ExecutionMode::Planner);
        assert_eq!(serde_json::to_string(&mode).unwrap(), "\"planner\"");
    }
}
