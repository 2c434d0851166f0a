use serde::{Deserialize, Serialize};

/// Principal roles, ordered by privilege. The ordering derives directly
/// from the declaration order, so `has_min_role` is a plain comparison.
///
/// Hierarchy: user < rag_user < agent_user < agent_developer < admin < owner
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    User,
    RagUser,
    AgentUser,
    AgentDeveloper,
    Admin,
    Owner,
}

impl Role {
    /// Parse a role string. Unknown roles fall back to the lowest level,
    /// matching the backend convention of defaulting unrecognized rows
    /// to `user`.
    pub fn parse(s: &str) -> Role {
        match s {
            "rag_user" => Role::RagUser,
            "agent_user" => Role::AgentUser,
            "agent_developer" => Role::AgentDeveloper,
            "admin" => Role::Admin,
            "owner" => Role::Owner,
            _ => Role::User,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::RagUser => "rag_user",
            Role::AgentUser => "agent_user",
            Role::AgentDeveloper => "agent_developer",
            Role::Admin => "admin",
            Role::Owner => "owner",
        }
    }

    /// True when this role is at or above `min`.
    pub fn has_min_role(&self, min: Role) -> bool {
        *self >= min
    }

    /// True when this role satisfies any of the listed requirements:
    /// either an exact match, or at/above the weakest listed role.
    /// An empty requirement list is satisfied by everyone.
    pub fn has_any_role(&self, roles: &[Role]) -> bool {
        if roles.is_empty() {
            return true;
        }
        if roles.contains(self) {
            return true;
        }
        roles.iter().min().is_some_and(|min| *self >= *min)
    }
}

/// An authenticated principal, as handed over by the (out-of-scope)
/// transport layer. The core never authenticates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub role: Role,
}

impl Principal {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
}

/// Platform-level tool restrictions by role, over the built-in tool set
/// the registry actually exposes. Grants are cumulative up the hierarchy:
/// the bottom tiers get knowledge-base access and the record tools,
/// agent_user adds search and code execution, agent_developer adds
/// read-only filesystem access, admin adds writes, shell commands, and
/// sub-agent spawning.
///
/// The owner wildcard is handled in the effective-permission intersection
/// (resolves to the template's own tool set), so `Owner` returns `None`
/// here.
pub fn role_tools(role: Role) -> Option<&'static [&'static str]> {
    match role {
        Role::User => Some(&["rag_query", "think"]),
        Role::RagUser => Some(&["rag_query", "think", "plan_task"]),
        Role::AgentUser => Some(&[
            "rag_query",
            "think",
            "plan_task",
            "web_search",
            "run_python",
        ]),
        Role::AgentDeveloper => Some(&[
            "rag_query",
            "think",
            "plan_task",
            "web_search",
            "run_python",
            "read_file",
            "list_dir",
            "search_files",
        ]),
        Role::Admin => Some(&[
            "rag_query",
            "think",
            "plan_task",
            "web_search",
            "run_python",
            "read_file",
            "list_dir",
            "search_files",
            "write_file",
            "run_command",
            "spawn_agent",
        ]),
        Role::Owner => None, // all tools
    }
}

/// Per-role cap on agent loop steps.
pub fn role_max_steps(role: Role) -> u32 {
    if role.has_min_role(Role::Admin) { 20 } else { 10 }
}

/// Per-role token budget for a single instance.
pub fn role_token_budget(role: Role) -> u64 {
    match role {
        Role::User => 50_000,
        Role::RagUser => 100_000,
        Role::AgentUser => 200_000,
        Role::AgentDeveloper => 300_000,
        Role::Admin => 500_000,
        Role::Owner => 1_000_000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hierarchy_ordering() {
        assert!(Role::Owner > Role::Admin);
        assert!(Role::Admin > Role::AgentDeveloper);
        assert!(Role::AgentDeveloper > Role::AgentUser);
        assert!(Role::AgentUser > Role::RagUser);
        assert!(Role::RagUser > Role::User);
    }

    #[test]
    fn parse_known_and_unknown() {
        assert_eq!(Role::parse("agent_user"), Role::AgentUser);
        assert_eq!(Role::parse("owner"), Role::Owner);
        assert_eq!(Role::parse("wizard"), Role::User);
        assert_eq!(Role::parse(""), Role::User);
    }

    #[test]
    fn min_role_checks() {
        assert!(Role::Admin.has_min_role(Role::AgentUser));
        assert!(Role::AgentUser.has_min_role(Role::AgentUser));
        assert!(!Role::RagUser.has_min_role(Role::AgentUser));
    }

    #[test]
    fn any_role_exact_or_above_weakest() {
        // Exact match
        assert!(Role::RagUser.has_any_role(&[Role::RagUser, Role::Admin]));
        // Above the weakest listed role
        assert!(Role::Owner.has_any_role(&[Role::AgentUser]));
        // Below every listed role
        assert!(!Role::User.has_any_role(&[Role::AgentUser, Role::Admin]));
        // Empty requirement is open
        assert!(Role::User.has_any_role(&[]));
    }

    #[test]
    fn role_tables() {
        assert!(role_tools(Role::User).unwrap().contains(&"rag_query"));
        assert!(!role_tools(Role::User).unwrap().contains(&"run_python"));
        assert!(role_tools(Role::AgentUser).unwrap().contains(&"web_search"));
        assert!(!role_tools(Role::AgentUser).unwrap().contains(&"read_file"));
        assert!(role_tools(Role::AgentDeveloper).unwrap().contains(&"read_file"));
        assert!(!role_tools(Role::AgentDeveloper).unwrap().contains(&"write_file"));
        assert!(role_tools(Role::Admin).unwrap().contains(&"write_file"));
        assert!(role_tools(Role::Admin).unwrap().contains(&"run_command"));
        assert!(role_tools(Role::Owner).is_none());

        assert_eq!(role_max_steps(Role::AgentUser), 10);
        assert_eq!(role_max_steps(Role::Admin), 20);
        assert_eq!(role_token_budget(Role::User), 50_000);
        assert_eq!(role_token_budget(Role::Owner), 1_000_000);
    }

    #[test]
    fn role_tables_grow_monotonically_and_name_real_tools() {
        // Every granted name must exist in the built-in registry
        // vocabulary, and each tier must contain the one below it.
        let builtins = [
            "read_file",
            "write_file",
            "list_dir",
            "search_files",
            "run_command",
            "run_python",
            "web_search",
            "rag_query",
            "think",
            "plan_task",
            "spawn_agent",
        ];
        let tiers = [
            Role::User,
            Role::RagUser,
            Role::AgentUser,
            Role::AgentDeveloper,
            Role::Admin,
        ];
        for pair in tiers.windows(2) {
            let lower = role_tools(pair[0]).unwrap();
            let upper = role_tools(pair[1]).unwrap();
            for tool in lower {
                assert!(upper.contains(tool), "{} missing from {:?}", tool, pair[1]);
            }
        }
        for role in tiers {
            for tool in role_tools(role).unwrap() {
                assert!(builtins.contains(tool), "unknown tool '{}' granted", tool);
            }
        }
    }

    #[test]
    fn role_serde_round_trip() {
        let json = serde_json::to_string(&Role::AgentDeveloper).unwrap();
        assert_eq!(json, "\"agent_developer\"");
        let back: Role = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Role::AgentDeveloper);
    }
}
