pub mod types;

use crate::errors::{DroverError, DroverResult};
use crate::events::{Event, EventType};
use crate::rbac::{Principal, Role, role_max_steps, role_token_budget, role_tools};
use crate::store::Store;
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub use types::{
    AgentSpec, EffectivePermissions, ExecutionMode, Instance, InstanceStatus, Template,
    TemplateScope,
};

/// Spawn governance limits. The depth cap is exclusive: a spawn whose
/// depth equals `max_depth` is rejected.
#[derive(Debug, Clone)]
pub struct SpawnPolicy {
    pub max_depth: u32,
    pub max_total_instances: u32,
}

impl Default for SpawnPolicy {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_total_instances: 50,
        }
    }
}

/// Bound on the ancestor walk; a chain longer than this without repeating
/// an id is already corrupt.
const MAX_ANCESTRY_WALK: u32 = 64;

/// RBAC-governed instance creation: template visibility, role checks,
/// permission intersection, depth/concurrency caps, ancestry tracking.
pub struct Spawner {
    store: Arc<Store>,
    policy: SpawnPolicy,
}

impl Spawner {
    pub fn new(store: Arc<Store>, policy: SpawnPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &SpawnPolicy {
        &self.policy
    }

    /// Spawn a new instance from a template. The concurrent-instance cap is
    /// enforced inside the store's insert transaction.
    pub fn spawn(
        &self,
        principal: &Principal,
        template_id: &str,
        task: &str,
        context: Option<&Value>,
        parent_instance_id: Option<&str>,
    ) -> DroverResult<Instance> {
        // 1. Load template (newest active version).
        let template = self
            .store
            .get_template(template_id)?
            .filter(|t| t.is_active)
            .ok_or_else(|| DroverError::TemplateNotFound(template_id.to_string()))?;

        // 2. Visibility. An invisible template reads as missing so its
        // existence is not leaked.
        if !can_access_template(principal, &template) {
            warn!(
                principal = %principal.id,
                template = %template_id,
                "template access denied by scope"
            );
            return Err(DroverError::TemplateNotFound(template_id.to_string()));
        }

        // 3. Role requirements.
        if !principal.role.has_any_role(&template.required_roles) {
            return Err(DroverError::InsufficientRole {
                required: template
                    .required_roles
                    .iter()
                    .map(|r| r.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
                current: principal.role.as_str().to_string(),
            });
        }

        // 4. Ancestry: depth, root, and a cycle check over the parent chain.
        let (depth, root_instance_id, parent_id) = match parent_instance_id {
            Some(pid) => {
                let parent = self
                    .store
                    .get_instance(pid)?
                    .ok_or_else(|| anyhow::anyhow!("parent instance {} not found", pid))?;
                self.check_ancestry(&parent)?;
                (
                    parent.depth + 1,
                    parent.root_instance_id.clone(),
                    Some(pid.to_string()),
                )
            }
            None => (0, String::new(), None),
        };

        // 5. Depth cap (exclusive).
        if depth >= self.policy.max_depth {
            return Err(DroverError::SpawnDepthExceeded(self.policy.max_depth));
        }

        // 6. Permission intersection.
        let perms = compute_effective_permissions(&template, principal.role);

        // 7. Deep-copied context with the derived permissions injected.
        // Sibling spawns must never share structure; the value clone here
        // is a full copy of the tree.
        let mut context = context.cloned().unwrap_or_else(|| json!({}));
        if !context.is_object() {
            return Err(DroverError::SchemaViolation(
                "spawn context must be a JSON object".to_string(),
            ));
        }
        context["_effective_permissions"] = serde_json::to_value(&perms)
            .map_err(anyhow::Error::from)?;

        let id = Uuid::new_v4().to_string();
        let root_instance_id = if root_instance_id.is_empty() {
            id.clone()
        } else {
            root_instance_id
        };
        let now = Utc::now();
        let instance = Instance {
            id: id.clone(),
            template_id: template.id.clone(),
            template_version: template.version,
            spawned_by_user_id: principal.id.clone(),
            parent_instance_id: parent_id,
            root_instance_id,
            depth,
            status: InstanceStatus::Queued,
            current_state: "init".to_string(),
            step: 0,
            task: task.to_string(),
            context,
            result: None,
            error: None,
            tokens_used: 0,
            cost: 0.0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        // 8. Concurrency cap + insert, one transaction.
        self.store
            .insert_instance_checked(&instance, self.policy.max_total_instances)?;

        // 9. Spawn event.
        self.store.append_event(&Event::new(
            &instance.id,
            EventType::Spawned,
            json!({
                "template_id": template.id,
                "template_name": template.name,
                "effective_tools": perms.tools,
                "effective_models": perms.models,
                "depth": depth,
            }),
        ))?;

        info!(
            instance = %instance.id,
            template = %template.name,
            principal = %principal.id,
            depth,
            "spawned agent instance"
        );
        Ok(instance)
    }

    /// Walk the parent chain to the root, rejecting repeated ids. A healthy
    /// chain terminates quickly; a repeat or an unbounded walk means the
    /// tree is corrupt.
    fn check_ancestry(&self, parent: &Instance) -> DroverResult<()> {
        let mut seen: HashSet<String> = HashSet::new();
        seen.insert(parent.id.clone());

        let mut cursor = parent.parent_instance_id.clone();
        let mut hops = 0u32;
        while let Some(current_id) = cursor {
            if !seen.insert(current_id.clone()) {
                return Err(DroverError::SpawnCircular(current_id));
            }
            hops += 1;
            if hops > MAX_ANCESTRY_WALK {
                return Err(DroverError::SpawnCircular(current_id));
            }
            cursor = self
                .store
                .get_instance(&current_id)?
                .and_then(|i| i.parent_instance_id);
        }
        Ok(())
    }
}

/// Visibility by scope: personal templates belong to their owner; org
/// templates use an admin proxy until org membership lives here; global
/// templates are visible to anyone.
fn can_access_template(principal: &Principal, template: &Template) -> bool {
    match template.scope {
        TemplateScope::Personal => principal.id == template.owner_id,
        TemplateScope::Org => principal.role.has_min_role(Role::Admin),
        TemplateScope::Global => true,
    }
}

/// effective = template ∩ role ∩ platform.
///
/// The owner role has no platform tool table (all tools), so its
/// intersection resolves to the template's own set. An empty
/// `max_template_tools` means the template carries no extra cap.
pub fn compute_effective_permissions(template: &Template, role: Role) -> EffectivePermissions {
    let role_set: Option<HashSet<&str>> =
        role_tools(role).map(|tools| tools.iter().copied().collect());
    let cap_set: Option<HashSet<&str>> = if template.max_template_tools.is_empty() {
        None
    } else {
        Some(
            template
                .max_template_tools
                .iter()
                .map(String::as_str)
                .collect(),
        )
    };

    let tools: Vec<String> = template
        .spec
        .allowed_tools
        .iter()
        .filter(|t| role_set.as_ref().is_none_or(|s| s.contains(t.as_str())))
        .filter(|t| cap_set.as_ref().is_none_or(|s| s.contains(t.as_str())))
        .cloned()
        .collect();

    EffectivePermissions {
        tools,
        models: template.spec.allowed_models.clone(),
        max_steps: template.spec.max_steps.min(role_max_steps(role)),
        token_budget: role_token_budget(role),
    }
}
