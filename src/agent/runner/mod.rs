use crate::agent::prompt::build_system_prompt;
use crate::approval::{GateDecision, PendingCall, gate};
use crate::errors::{DroverError, DroverResult};
use crate::events::{Event, EventType};
use crate::mcp::{BUILTIN_SERVER_ID, McpMultiplexer, demangle, flight_key, is_mangled};
use crate::providers::base::{
    ChatProvider, ChatRequest, Message, RetryConfig, ToolCallRequest, ToolDefinition,
};
use crate::rbac::Principal;
use crate::sandbox::{SafetyLevel, classify_command};
use crate::session::{Session, SessionManager};
use crate::spawner::types::{EffectivePermissions, ExecutionMode, Instance, InstanceStatus};
use crate::spawner::compute_effective_permissions;
use crate::store::Store;
use crate::tools::base::{ExecutionContext, ToolResult};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Per-runner model parameters. Tool-driving loops run cold for
/// determinism.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub retry: RetryConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model: None,
            temperature: 0.0,
            max_tokens: 4096,
            retry: RetryConfig::default(),
        }
    }
}

/// How a run ended. Provider death is the only `Err` path out of the
/// runner; everything here is a defined outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    Completed,
    MaxStepsReached,
    BudgetExhausted,
    AwaitingApproval { call_id: String, safety: SafetyLevel },
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// Final assistant content, or the last partial content on early
    /// termination.
    pub content: String,
    pub steps: u32,
    pub tokens_used: u64,
    /// Full transcript, for drivers that resume after approval.
    pub messages: Vec<Message>,
}

/// The driving caller's side of the approval gate. The loop itself never
/// sleeps waiting on humans: when a call parks, the driver decides.
#[async_trait]
pub trait ApprovalDriver: Send + Sync {
    /// `Some(true)` approve, `Some(false)` reject, `None` surrender the
    /// loop with an `AwaitingApproval` outcome.
    async fn decide(&self, call: &PendingCall) -> Option<bool>;
}

/// Driver that never blocks: every parked call surrenders the loop.
pub struct SurrenderDriver;

#[async_trait]
impl ApprovalDriver for SurrenderDriver {
    async fn decide(&self, _call: &PendingCall) -> Option<bool> {
        None
    }
}

enum CallOutcome {
    Message(Message),
    Surrender { call_id: String, safety: SafetyLevel },
}

/// Drives one instance through its execution mode: seeds the
/// conversation, resolves the tool schema, and loops reason → act →
/// observe under the step and token budgets.
pub struct AgentRunner {
    provider: Arc<dyn ChatProvider>,
    sessions: Arc<SessionManager>,
    mcp: Arc<McpMultiplexer>,
    store: Arc<Store>,
    config: RunConfig,
}

impl AgentRunner {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        sessions: Arc<SessionManager>,
        mcp: Arc<McpMultiplexer>,
        store: Arc<Store>,
        config: RunConfig,
    ) -> Self {
        Self {
            provider,
            sessions,
            mcp,
            store,
            config,
        }
    }

    /// Run a queued instance to a terminal outcome (or an approval
    /// surrender). Governance failures and provider death are the only
    /// errors; tool failures feed back into the conversation.
    pub async fn run_instance(
        &self,
        principal: &Principal,
        instance_id: &str,
        driver: &dyn ApprovalDriver,
    ) -> DroverResult<RunOutcome> {
        let instance = self
            .store
            .get_instance(instance_id)?
            .ok_or_else(|| anyhow::anyhow!("instance {} not found", instance_id))?;
        let template = self
            .store
            .get_template(&instance.template_id)?
            .ok_or_else(|| DroverError::TemplateNotFound(instance.template_id.clone()))?;

        // Effective permissions were frozen into the context at spawn
        // time; recompute only if a legacy row lacks them.
        let perms: EffectivePermissions = instance
            .context
            .get("_effective_permissions")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_else(|| compute_effective_permissions(&template, principal.role));

        self.store
            .update_instance_status(instance_id, InstanceStatus::Running)?;

        let session = self.sessions.get_or_create(&principal.id).await;
        let tool_defs = self.resolve_tool_schema(principal, &session, &perms).await;

        let system = build_system_prompt(&template.spec, &perms.tools);
        let mut messages = vec![Message::system(system), Message::user(&instance.task)];

        let model = self
            .config
            .model
            .clone()
            .or_else(|| template.spec.allowed_models.first().cloned())
            .unwrap_or_else(|| self.provider.default_model().to_string());

        info!(
            instance = %instance_id,
            mode = template.spec.execution_mode.as_str(),
            model = %model,
            tools = tool_defs.len(),
            "starting agent run"
        );

        match template.spec.execution_mode {
            ExecutionMode::Single => {
                self.run_single(&instance, &model, &tool_defs, &mut messages)
                    .await
            }
            ExecutionMode::MultiStep | ExecutionMode::Planner => {
                self.run_loop(
                    principal, &instance, &perms, &session, driver, &model, &tool_defs, messages,
                )
                .await
            }
        }
    }

    /// The combined schema handed to the model: built-in descriptors plus
    /// MCP-visible mangled descriptors, both filtered down to the
    /// instance's effective tool set.
    async fn resolve_tool_schema(
        &self,
        principal: &Principal,
        session: &Arc<Mutex<Session>>,
        perms: &EffectivePermissions,
    ) -> Vec<ToolDefinition> {
        let allowed = |tool: &str| perms.tools.iter().any(|t| t == tool);

        let mut defs: Vec<ToolDefinition> = {
            let guard = session.lock().await;
            guard
                .tools()
                .map(|t| t.registry().definitions())
                .unwrap_or_default()
                .into_iter()
                .filter(|d| allowed(&d.name))
                .collect()
        };

        for def in self.mcp.visible_tool_definitions(principal.role).await {
            let Ok((_, tool)) = demangle(&def.name) else {
                continue;
            };
            if allowed(&tool) {
                defs.push(def);
            }
        }
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    async fn chat_turn(
        &self,
        instance_id: &str,
        model: &str,
        tool_defs: &[ToolDefinition],
        messages: &[Message],
    ) -> DroverResult<crate::providers::base::ChatResponse> {
        let request = ChatRequest {
            messages: messages.to_vec(),
            tools: (!tool_defs.is_empty()).then(|| tool_defs.to_vec()),
            model: Some(model),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };
        match self
            .provider
            .chat_with_retry(request, &self.config.retry)
            .await
        {
            Ok(response) => Ok(response),
            Err(e) => {
                // Third failure: the loop terminates and the instance fails.
                self.store
                    .set_instance_result(instance_id, None, Some("model_unavailable"))?;
                let _ = self
                    .store
                    .update_instance_status(instance_id, InstanceStatus::Failed);
                self.store.append_event(&Event::new(
                    instance_id,
                    EventType::Failed,
                    json!({"error": "model_unavailable", "detail": e.to_string()}),
                ))?;
                Err(DroverError::ModelUnavailable(e.to_string()))
            }
        }
    }

    /// Single mode: one model call. Tool calls in the reply are ignored,
    /// with an observable warning appended.
    async fn run_single(
        &self,
        instance: &Instance,
        model: &str,
        tool_defs: &[ToolDefinition],
        messages: &mut Vec<Message>,
    ) -> DroverResult<RunOutcome> {
        let started = Instant::now();
        let response = self
            .chat_turn(&instance.id, model, tool_defs, messages)
            .await?;
        let tokens_used = instance.tokens_used + response.usage.turn_total();

        self.store.append_event(
            &Event::new(
                &instance.id,
                EventType::ModelTurn,
                json!({"step": 1, "tool_calls": response.tool_calls.len()}),
            )
            .with_tokens(response.usage.turn_total())
            .with_latency(started.elapsed().as_millis() as u64),
        )?;

        let mut content = response.content.clone().unwrap_or_default();
        if response.has_tool_calls() {
            warn!(
                instance = %instance.id,
                count = response.tool_calls.len(),
                "single-step mode ignored tool calls"
            );
            content.push_str(&format!(
                "\n\n[warning: {} tool call(s) ignored in single-step mode]",
                response.tool_calls.len()
            ));
        }
        messages.push(Message::assistant(content.clone(), None));

        self.store
            .update_instance_progress(&instance.id, 1, tokens_used, "done")?;
        self.finish(&instance.id, &content, 1, tokens_used, "completed")?;

        Ok(RunOutcome {
            status: RunStatus::Completed,
            content,
            steps: 1,
            tokens_used,
            messages: std::mem::take(messages),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_loop(
        &self,
        principal: &Principal,
        instance: &Instance,
        perms: &EffectivePermissions,
        session: &Arc<Mutex<Session>>,
        driver: &dyn ApprovalDriver,
        model: &str,
        tool_defs: &[ToolDefinition],
        mut messages: Vec<Message>,
    ) -> DroverResult<RunOutcome> {
        let max_steps = perms.max_steps;
        let budget = perms.token_budget;
        let mut tokens_used = instance.tokens_used;
        let mut step = 0u32;
        let mut last_content = String::new();

        while step < max_steps {
            step += 1;

            // Cancellation refuses further steps; anything in flight from
            // the previous turn is already appended or discarded.
            if let Some(current) = self.store.get_instance(&instance.id)? {
                if current.status == InstanceStatus::Cancelled {
                    self.store.append_event(&Event::new(
                        &instance.id,
                        EventType::Cancelled,
                        json!({"step": step}),
                    ))?;
                    return Ok(RunOutcome {
                        status: RunStatus::Cancelled,
                        content: last_content,
                        steps: step - 1,
                        tokens_used,
                        messages,
                    });
                }
            }

            self.store.append_event(&Event::new(
                &instance.id,
                EventType::StepStarted,
                json!({"step": step}),
            ))?;

            let started = Instant::now();
            let response = self
                .chat_turn(&instance.id, model, tool_defs, &messages)
                .await?;
            tokens_used += response.usage.turn_total();

            self.store.append_event(
                &Event::new(
                    &instance.id,
                    EventType::ModelTurn,
                    json!({"step": step, "tool_calls": response.tool_calls.len()}),
                )
                .with_tokens(response.usage.turn_total())
                .with_latency(started.elapsed().as_millis() as u64),
            )?;
            self.store
                .update_instance_progress(&instance.id, step, tokens_used, "executing")?;

            if !response.has_tool_calls() {
                let content = response.content.unwrap_or_default();
                messages.push(Message::assistant(content.clone(), None));
                self.finish(&instance.id, &content, step, tokens_used, "completed")?;
                return Ok(RunOutcome {
                    status: RunStatus::Completed,
                    content,
                    steps: step,
                    tokens_used,
                    messages,
                });
            }

            last_content = response.content.clone().unwrap_or_default();
            messages.push(Message::assistant(
                last_content.clone(),
                Some(response.tool_calls.clone()),
            ));

            // Tool results append in emission order; duplicate calls in
            // the same turn are single-flighted through this cache.
            let mut flights: HashMap<String, ToolResult> = HashMap::new();

            for call in &response.tool_calls {
                match self
                    .process_tool_call(principal, instance, perms, session, driver, &mut flights, call)
                    .await?
                {
                    CallOutcome::Message(msg) => messages.push(msg),
                    CallOutcome::Surrender { call_id, safety } => {
                        self.store
                            .update_instance_status(&instance.id, InstanceStatus::AwaitingApproval)?;
                        self.store
                            .update_instance_progress(&instance.id, step, tokens_used, "awaiting_approval")?;
                        return Ok(RunOutcome {
                            status: RunStatus::AwaitingApproval { call_id, safety },
                            content: last_content,
                            steps: step,
                            tokens_used,
                            messages,
                        });
                    }
                }
            }

            // Budget is checked between turns, so a single turn may
            // overshoot it before termination.
            if tokens_used > budget {
                self.store
                    .set_instance_result(&instance.id, None, Some("budget_exhausted"))?;
                self.store
                    .update_instance_status(&instance.id, InstanceStatus::Failed)?;
                self.store.append_event(&Event::new(
                    &instance.id,
                    EventType::Failed,
                    json!({"error": "budget_exhausted", "tokens_used": tokens_used, "budget": budget}),
                ))?;
                return Ok(RunOutcome {
                    status: RunStatus::BudgetExhausted,
                    content: last_content,
                    steps: step,
                    tokens_used,
                    messages,
                });
            }
        }

        // Step cap exhausted: the last assistant message is the partial
        // result.
        self.store.set_instance_result(
            &instance.id,
            Some(&json!({"status": "max_steps_reached", "content": last_content})),
            None,
        )?;
        self.store
            .update_instance_status(&instance.id, InstanceStatus::Completed)?;
        self.store.append_event(&Event::new(
            &instance.id,
            EventType::Completed,
            json!({"reason": "max_steps_reached", "steps": max_steps}),
        ))?;
        Ok(RunOutcome {
            status: RunStatus::MaxStepsReached,
            content: last_content,
            steps: max_steps,
            tokens_used,
            messages,
        })
    }

    async fn process_tool_call(
        &self,
        principal: &Principal,
        instance: &Instance,
        perms: &EffectivePermissions,
        session: &Arc<Mutex<Session>>,
        driver: &dyn ApprovalDriver,
        flights: &mut HashMap<String, ToolResult>,
        call: &ToolCallRequest,
    ) -> DroverResult<CallOutcome> {
        let name = call.name.as_str();

        // Resolve the bare tool name for policy checks. A malformed
        // mangled name is reported back to the model, not raised.
        let bare = if is_mangled(name) {
            match demangle(name) {
                Ok((_, tool)) => tool,
                Err(e) => {
                    return Ok(CallOutcome::Message(self.reify_error(
                        instance,
                        call,
                        &format!("error: {}: {}", e.kind(), e),
                    )?));
                }
            }
        } else {
            name.to_string()
        };

        // Allowed-set enforcement: the model cannot reach outside the
        // effective permission set.
        if !perms.tools.iter().any(|t| t == &bare) {
            return Ok(CallOutcome::Message(self.reify_error(
                instance,
                call,
                &format!(
                    "error: tool_not_allowed: tool '{}' is not allowed for this agent",
                    name
                ),
            )?));
        }

        let (safety, exempt) = self.classify_call(session, name, &bare, &call.arguments).await;

        let decision = {
            let mut guard = session.lock().await;
            let mode = guard.mode;
            gate(
                &mut guard.pending,
                mode,
                name,
                &bare,
                exempt,
                safety,
                &call.arguments,
                false,
            )
        };

        self.store.append_event(&Event::new(
            &instance.id,
            EventType::ToolCallIssued,
            json!({
                "tool": name,
                "call_id": call.id,
                "safety": safety.as_str(),
                "pending": matches!(&decision, GateDecision::Pending { .. }),
            }),
        ))?;

        match decision {
            GateDecision::Proceed => {
                let result = self
                    .execute_flighted(principal, session, flights, name, &call.arguments, &instance.id)
                    .await;
                Ok(CallOutcome::Message(self.result_message(instance, call, &result)?))
            }
            GateDecision::Pending { call_id, safety } => {
                let pending_call = {
                    let guard = session.lock().await;
                    guard.pending.get(&call_id).cloned()
                };
                let Some(pending_call) = pending_call else {
                    // Swept or expired between gate and lookup.
                    return Ok(CallOutcome::Message(self.reify_error(
                        instance,
                        call,
                        "error: pending_not_found",
                    )?));
                };

                match driver.decide(&pending_call).await {
                    None => Ok(CallOutcome::Surrender { call_id, safety }),
                    Some(true) => {
                        {
                            let mut guard = session.lock().await;
                            guard.pending.approve(&call_id)?;
                        }
                        self.store.append_event(&Event::new(
                            &instance.id,
                            EventType::ToolCallApproved,
                            json!({"tool": name, "approval_id": call_id}),
                        ))?;
                        let result = self
                            .execute_flighted(
                                principal, session, flights, name, &call.arguments, &instance.id,
                            )
                            .await;
                        Ok(CallOutcome::Message(self.result_message(instance, call, &result)?))
                    }
                    Some(false) => {
                        {
                            let mut guard = session.lock().await;
                            guard.pending.reject(&call_id)?;
                        }
                        self.store.append_event(&Event::new(
                            &instance.id,
                            EventType::ToolCallRejected,
                            json!({"tool": name, "approval_id": call_id}),
                        ))?;
                        Ok(CallOutcome::Message(self.reify_error(
                            instance,
                            call,
                            &format!("error: tool call '{}' was rejected by the user", name),
                        )?))
                    }
                }
            }
        }
    }

    /// Safety classification: `run_command` derives from its command line;
    /// built-in targets use their descriptor default; external MCP tools
    /// default to moderate. Approval exemption only ever applies to
    /// built-in record tools.
    async fn classify_call(
        &self,
        session: &Arc<Mutex<Session>>,
        dispatch_name: &str,
        bare: &str,
        args: &Value,
    ) -> (SafetyLevel, bool) {
        if bare == "run_command" {
            let cmd = args["cmd"].as_str().unwrap_or("");
            let (level, _) = classify_command(cmd);
            return (level, false);
        }

        let builtin_target = !is_mangled(dispatch_name)
            || matches!(demangle(dispatch_name), Ok((server, _)) if server == BUILTIN_SERVER_ID);
        if builtin_target {
            let guard = session.lock().await;
            if let Some(tools) = guard.tools() {
                if let Some(tool) = tools.registry().get(bare) {
                    return (tool.safety_default(), tool.approval_exempt());
                }
            }
        }
        (SafetyLevel::Moderate, false)
    }

    /// Execute with per-turn single-flight: duplicate `(target, args)`
    /// pairs in one step run once and share the result.
    async fn execute_flighted(
        &self,
        principal: &Principal,
        session: &Arc<Mutex<Session>>,
        flights: &mut HashMap<String, ToolResult>,
        name: &str,
        args: &Value,
        instance_id: &str,
    ) -> ToolResult {
        let key = flight_key(name, args);
        if let Some(cached) = flights.get(&key) {
            return cached.clone();
        }
        let result = self.dispatch(principal, session, name, args, instance_id).await;
        flights.insert(key, result.clone());
        result
    }

    /// Route to the multiplexer (mangled names) or the session's built-in
    /// registry. Every failure is reified into an error result.
    async fn dispatch(
        &self,
        principal: &Principal,
        session: &Arc<Mutex<Session>>,
        name: &str,
        args: &Value,
        instance_id: &str,
    ) -> ToolResult {
        let ctx = ExecutionContext {
            principal: principal.clone(),
            instance_id: Some(instance_id.to_string()),
        };

        if is_mangled(name) {
            match self.mcp.call_mangled(principal.role, name, args, &ctx).await {
                Ok(result) => result,
                Err(e) => ToolResult::error(format!("error: {}: {}", e.kind(), e)),
            }
        } else {
            let tools = {
                let guard = session.lock().await;
                guard.tools().cloned()
            };
            match tools {
                Some(tools) => match tools.registry().execute(name, args.clone(), &ctx).await {
                    Ok(result) => result,
                    Err(e) => {
                        ToolResult::error(format!("error: tool_runtime_error: {}", e))
                    }
                },
                None => ToolResult::error(
                    "error: no sandbox configured for this session".to_string(),
                ),
            }
        }
    }

    fn result_message(
        &self,
        instance: &Instance,
        call: &ToolCallRequest,
        result: &ToolResult,
    ) -> DroverResult<Message> {
        let (text, images) = result.render();
        self.store.append_event(&Event::new(
            &instance.id,
            EventType::ToolCallResult,
            json!({
                "tool": call.name,
                "call_id": call.id,
                "is_error": result.is_error(),
                "chars": text.len(),
                "images": images.len(),
            }),
        ))?;
        Ok(Message::tool_result_with_images(
            call.id.clone(),
            text,
            images,
            result.is_error(),
        ))
    }

    fn reify_error(
        &self,
        instance: &Instance,
        call: &ToolCallRequest,
        message: &str,
    ) -> DroverResult<Message> {
        self.store.append_event(&Event::new(
            &instance.id,
            EventType::ToolCallResult,
            json!({
                "tool": call.name,
                "call_id": call.id,
                "is_error": true,
                "detail": message,
            }),
        ))?;
        Ok(Message::tool_result(call.id.clone(), message, true))
    }

    fn finish(
        &self,
        instance_id: &str,
        content: &str,
        steps: u32,
        tokens_used: u64,
        reason: &str,
    ) -> DroverResult<()> {
        self.store.set_instance_result(
            instance_id,
            Some(&json!({"content": content})),
            None,
        )?;
        self.store
            .update_instance_status(instance_id, InstanceStatus::Completed)?;
        self.store.append_event(
            &Event::new(
                instance_id,
                EventType::Completed,
                json!({"reason": reason, "steps": steps}),
            )
            .with_tokens(tokens_used),
        )?;
        Ok(())
    }

    /// Approve a parked call out-of-band: the pending entry is consumed
    /// and the call re-dispatched with approval in hand.
    pub async fn approve_pending(
        &self,
        principal: &Principal,
        call_id: &str,
    ) -> DroverResult<ToolResult> {
        let session = self.sessions.get_or_create(&principal.id).await;
        let call = {
            let mut guard = session.lock().await;
            guard.pending.approve(call_id)?
        };
        Ok(self
            .dispatch(principal, &session, &call.tool_name, &call.arguments, "")
            .await)
    }

    /// Reject a parked call out-of-band.
    pub async fn reject_pending(&self, principal: &Principal, call_id: &str) -> DroverResult<()> {
        let session = self.sessions.get_or_create(&principal.id).await;
        let mut guard = session.lock().await;
        guard.pending.reject(call_id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
