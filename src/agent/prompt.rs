use crate::spawner::types::{AgentSpec, ExecutionMode};

/// Compile an agent spec into its system prompt: objective, strategy,
/// capability list, and output constraints.
pub fn build_system_prompt(spec: &AgentSpec, effective_tools: &[String]) -> String {
    let mut parts = vec![
        format!("You are {}.", spec.objective),
        format!(
            "Your execution strategy is: {}.",
            spec.execution_mode.as_str()
        ),
    ];

    if effective_tools.is_empty() {
        parts.push("You have no tools available; answer from your own knowledge.".to_string());
    } else {
        parts.push(format!(
            "You have access to the following tools: {}.",
            effective_tools.join(", ")
        ));
    }

    let format = spec.output_constraints["format"].as_str().unwrap_or("markdown");
    parts.push(format!("Output format: {}.", format));

    if spec.output_constraints["citations"].as_bool() == Some(true) {
        parts.push("You MUST provide citations for all facts.".to_string());
    }

    if spec.execution_mode == ExecutionMode::Planner {
        parts.push(
            "Before calling any tool, lay out an explicit numbered plan for the task, \
             then execute it step by step."
                .to_string(),
        );
    }

    parts.join(" ")
}
