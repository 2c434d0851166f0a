use super::*;
use crate::approval::ApprovalMode;
use crate::mcp::McpMultiplexer;
use crate::providers::base::{ChatResponse, Usage};
use crate::rbac::Role;
use crate::session::SessionManager;
use crate::spawner::types::{AgentSpec, Template, TemplateScope};
use crate::spawner::{SpawnPolicy, Spawner};
use crate::store::Store;
use crate::tools::setup::ToolBuildContext;
use std::collections::VecDeque;
use std::fs;
use tempfile::TempDir;

struct MockProvider {
    responses: std::sync::Mutex<VecDeque<ChatResponse>>,
}

impl MockProvider {
    fn scripted(responses: Vec<ChatResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: std::sync::Mutex::new(responses.into()),
        })
    }
}

#[async_trait]
impl ChatProvider for MockProvider {
    async fn chat(&self, _req: ChatRequest<'_>) -> anyhow::Result<ChatResponse> {
        let mut responses = self.responses.lock().unwrap();
        Ok(responses
            .pop_front()
            .unwrap_or_else(|| text_response("done", 10)))
    }

    fn default_model(&self) -> &str {
        "mock-model"
    }
}

fn text_response(content: &str, tokens: u64) -> ChatResponse {
    ChatResponse {
        content: Some(content.to_string()),
        tool_calls: vec![],
        model: "mock-model".to_string(),
        usage: Usage {
            prompt_tokens: tokens / 2,
            completion_tokens: tokens - tokens / 2,
            total_tokens: tokens,
        },
    }
}

fn tool_call_response(id: &str, name: &str, args: Value, tokens: u64) -> ChatResponse {
    ChatResponse {
        content: None,
        tool_calls: vec![ToolCallRequest {
            id: id.to_string(),
            name: name.to_string(),
            arguments: args,
        }],
        model: "mock-model".to_string(),
        usage: Usage {
            prompt_tokens: tokens / 2,
            completion_tokens: tokens - tokens / 2,
            total_tokens: tokens,
        },
    }
}

struct Fixture {
    _dir: TempDir,
    store: Arc<Store>,
    sessions: Arc<SessionManager>,
    spawner: Spawner,
    principal: Principal,
}

impl Fixture {
    async fn new(role: Role, mode: ExecutionMode, max_steps: u32, tools: &[&str]) -> Self {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("notes.txt"), "first line\nsecond line\n").unwrap();

        let store = Arc::new(Store::in_memory().unwrap());
        store
            .save_template(&Template {
                id: "tester".to_string(),
                name: "tester".to_string(),
                owner_id: "alice".to_string(),
                scope: TemplateScope::Global,
                required_roles: vec![],
                spec: AgentSpec {
                    objective: "a test agent".to_string(),
                    allowed_tools: tools.iter().map(ToString::to_string).collect(),
                    execution_mode: mode,
                    max_steps,
                    ..AgentSpec::default()
                },
                version: 0,
                max_template_tools: vec![],
                is_active: true,
            })
            .unwrap();

        let sessions = Arc::new(SessionManager::new(
            ToolBuildContext::default(),
            std::time::Duration::from_secs(600),
        ));
        let principal = Principal::new("alice", role);
        sessions
            .set_sandbox("alice", dir.path().to_str().unwrap())
            .await
            .unwrap();

        let spawner = Spawner::new(store.clone(), SpawnPolicy::default());
        Self {
            _dir: dir,
            store,
            sessions,
            spawner,
            principal,
        }
    }

    fn spawn(&self, task: &str) -> Instance {
        self.spawner
            .spawn(&self.principal, "tester", task, None, None)
            .unwrap()
    }

    fn runner(&self, provider: Arc<MockProvider>) -> AgentRunner {
        AgentRunner::new(
            provider,
            self.sessions.clone(),
            Arc::new(McpMultiplexer::new()),
            self.store.clone(),
            RunConfig::default(),
        )
    }

    async fn set_trust_mode(&self) {
        self.sessions
            .set_mode(&self.principal.id, ApprovalMode::TrustMode)
            .await;
    }
}

#[tokio::test]
async fn test_read_file_in_trust_mode_completes() {
    let fx = Fixture::new(Role::Admin, ExecutionMode::MultiStep, 10, &["read_file"]).await;
    fx.set_trust_mode().await;
    let instance = fx.spawn("show the first line of notes.txt");

    let provider = MockProvider::scripted(vec![
        tool_call_response("call_1", "read_file", json!({"path": "notes.txt"}), 100),
        text_response("The first line is: first line", 50),
    ]);
    let runner = fx.runner(provider);

    let outcome = runner
        .run_instance(&fx.principal, &instance.id, &SurrenderDriver)
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.content, "The first line is: first line");
    assert_eq!(outcome.steps, 2);
    assert_eq!(outcome.tokens_used, 150);

    // The tool result message carries the file content and the emitted id.
    let tool_msg = outcome
        .messages
        .iter()
        .find(|m| m.role == "tool")
        .expect("tool result message");
    assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_1"));
    assert!(tool_msg.content.contains("first line"));

    // No pending entries were created by the trust-mode bypass.
    let session = fx.sessions.get_or_create("alice").await;
    assert!(session.lock().await.pending.is_empty());

    let stored = fx.store.get_instance(&instance.id).unwrap().unwrap();
    assert_eq!(stored.status, InstanceStatus::Completed);
    assert_eq!(stored.tokens_used, 150);

    // spawned first, terminal completed last.
    let events = fx.store.events_for_instance(&instance.id).unwrap();
    assert_eq!(events.first().unwrap().event_type, EventType::Spawned);
    assert_eq!(events.last().unwrap().event_type, EventType::Completed);
    assert!(events.iter().any(|e| e.event_type == EventType::ToolCallResult));
}

#[tokio::test]
async fn test_path_escape_becomes_tool_result_and_loop_continues() {
    let fx = Fixture::new(Role::Admin, ExecutionMode::MultiStep, 10, &["read_file"]).await;
    fx.set_trust_mode().await;
    let instance = fx.spawn("read something");

    let provider = MockProvider::scripted(vec![
        tool_call_response("call_1", "read_file", json!({"path": "../etc/passwd"}), 100),
        text_response("that path is outside the sandbox", 40),
    ]);
    let runner = fx.runner(provider);

    let outcome = runner
        .run_instance(&fx.principal, &instance.id, &SurrenderDriver)
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    let tool_msg = outcome.messages.iter().find(|m| m.role == "tool").unwrap();
    assert!(tool_msg.is_error);
    assert!(tool_msg.content.contains("escapes sandbox"));
}

#[tokio::test]
async fn test_dangerous_command_parks_even_in_trust_mode() {
    let fx = Fixture::new(Role::Owner, ExecutionMode::MultiStep, 10, &["run_command"]).await;
    fx.set_trust_mode().await;
    let instance = fx.spawn("clean up");

    let provider = MockProvider::scripted(vec![tool_call_response(
        "call_1",
        "run_command",
        json!({"cmd": "rm -rf /"}),
        100,
    )]);
    let runner = fx.runner(provider);

    let outcome = runner
        .run_instance(&fx.principal, &instance.id, &SurrenderDriver)
        .await
        .unwrap();

    let RunStatus::AwaitingApproval { call_id, safety } = outcome.status else {
        panic!("expected AwaitingApproval, got {:?}", outcome.status);
    };
    assert_eq!(safety, SafetyLevel::Dangerous);

    let stored = fx.store.get_instance(&instance.id).unwrap().unwrap();
    assert_eq!(stored.status, InstanceStatus::AwaitingApproval);

    // Reject removes the entry; a later approve finds nothing.
    runner.reject_pending(&fx.principal, &call_id).await.unwrap();
    let err = runner
        .approve_pending(&fx.principal, &call_id)
        .await
        .unwrap_err();
    assert!(matches!(err, DroverError::PendingNotFound(_)));
}

#[tokio::test]
async fn test_tool_not_allowed_is_reified_not_raised() {
    let fx = Fixture::new(Role::Admin, ExecutionMode::MultiStep, 10, &["read_file"]).await;
    fx.set_trust_mode().await;
    let instance = fx.spawn("write something");

    let provider = MockProvider::scripted(vec![
        tool_call_response(
            "call_1",
            "write_file",
            json!({"path": "out.txt", "content": "hi"}),
            100,
        ),
        text_response("understood, I cannot write files", 40),
    ]);
    let runner = fx.runner(provider);

    let outcome = runner
        .run_instance(&fx.principal, &instance.id, &SurrenderDriver)
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    let tool_msg = outcome.messages.iter().find(|m| m.role == "tool").unwrap();
    assert!(tool_msg.is_error);
    assert!(tool_msg.content.contains("tool_not_allowed"));
}

#[tokio::test]
async fn test_step_cap_returns_max_steps_reached() {
    // max_steps = 1 with a model that always emits a tool call: exactly
    // one model turn and one tool execution, then max_steps_reached.
    let fx = Fixture::new(Role::Admin, ExecutionMode::MultiStep, 1, &["list_dir"]).await;
    fx.set_trust_mode().await;
    let instance = fx.spawn("explore");

    let provider = MockProvider::scripted(vec![
        tool_call_response("call_1", "list_dir", json!({"path": "."}), 100),
        tool_call_response("call_2", "list_dir", json!({"path": "."}), 100),
    ]);
    let runner = fx.runner(provider);

    let outcome = runner
        .run_instance(&fx.principal, &instance.id, &SurrenderDriver)
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::MaxStepsReached);
    assert_eq!(outcome.steps, 1);
    // One assistant turn, one tool result.
    assert_eq!(
        outcome.messages.iter().filter(|m| m.role == "assistant").count(),
        1
    );
    assert_eq!(
        outcome.messages.iter().filter(|m| m.role == "tool").count(),
        1
    );
    assert_eq!(outcome.tokens_used, 100);
}

#[tokio::test]
async fn test_budget_exhaustion_terminates_after_one_overshoot_turn() {
    let fx = Fixture::new(Role::Owner, ExecutionMode::MultiStep, 10, &["list_dir"]).await;
    fx.set_trust_mode().await;
    let instance = fx.spawn("explore");

    // Owner budget is 1M tokens; one giant turn overshoots it.
    let provider = MockProvider::scripted(vec![
        tool_call_response("call_1", "list_dir", json!({"path": "."}), 1_500_000),
        text_response("never reached", 10),
    ]);
    let runner = fx.runner(provider);

    let outcome = runner
        .run_instance(&fx.principal, &instance.id, &SurrenderDriver)
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::BudgetExhausted);
    assert_eq!(outcome.steps, 1);

    let stored = fx.store.get_instance(&instance.id).unwrap().unwrap();
    assert_eq!(stored.status, InstanceStatus::Failed);
    assert_eq!(stored.error.as_deref(), Some("budget_exhausted"));
    let events = fx.store.events_for_instance(&instance.id).unwrap();
    assert_eq!(events.last().unwrap().event_type, EventType::Failed);
}

#[tokio::test]
async fn test_single_mode_ignores_tool_calls_with_warning() {
    let fx = Fixture::new(Role::Admin, ExecutionMode::Single, 10, &["read_file"]).await;
    let instance = fx.spawn("hello");

    let provider = MockProvider::scripted(vec![ChatResponse {
        content: Some("hi there".to_string()),
        tool_calls: vec![ToolCallRequest {
            id: "call_1".to_string(),
            name: "read_file".to_string(),
            arguments: json!({"path": "notes.txt"}),
        }],
        model: "mock-model".to_string(),
        usage: Usage {
            prompt_tokens: 10,
            completion_tokens: 10,
            total_tokens: 20,
        },
    }]);
    let runner = fx.runner(provider);

    let outcome = runner
        .run_instance(&fx.principal, &instance.id, &SurrenderDriver)
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert!(outcome.content.starts_with("hi there"));
    assert!(outcome.content.contains("ignored in single-step mode"));
    // The ignored call never executed, so there is no tool message.
    assert!(!outcome.messages.iter().any(|m| m.role == "tool"));
}

struct RejectingDriver;

#[async_trait]
impl ApprovalDriver for RejectingDriver {
    async fn decide(&self, _call: &PendingCall) -> Option<bool> {
        Some(false)
    }
}

struct ApprovingDriver;

#[async_trait]
impl ApprovalDriver for ApprovingDriver {
    async fn decide(&self, _call: &PendingCall) -> Option<bool> {
        Some(true)
    }
}

#[tokio::test]
async fn test_rejecting_driver_feeds_rejection_to_model() {
    let fx = Fixture::new(Role::Owner, ExecutionMode::MultiStep, 10, &["run_command"]).await;
    let instance = fx.spawn("build it");

    let provider = MockProvider::scripted(vec![
        tool_call_response("call_1", "run_command", json!({"cmd": "make install"}), 100),
        text_response("okay, not running that", 40),
    ]);
    let runner = fx.runner(provider);

    let outcome = runner
        .run_instance(&fx.principal, &instance.id, &RejectingDriver)
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    let tool_msg = outcome.messages.iter().find(|m| m.role == "tool").unwrap();
    assert!(tool_msg.is_error);
    assert!(tool_msg.content.contains("rejected"));

    let events = fx.store.events_for_instance(&instance.id).unwrap();
    assert!(events.iter().any(|e| e.event_type == EventType::ToolCallRejected));
    // The pending entry was consumed by the rejection.
    let session = fx.sessions.get_or_create("alice").await;
    assert!(session.lock().await.pending.is_empty());
}

#[tokio::test]
async fn test_approving_driver_executes_parked_call() {
    let fx = Fixture::new(Role::Owner, ExecutionMode::MultiStep, 10, &["run_command"]).await;
    let instance = fx.spawn("what's here?");

    let provider = MockProvider::scripted(vec![
        tool_call_response("call_1", "run_command", json!({"cmd": "echo hello-drover"}), 100),
        text_response("it printed hello-drover", 40),
    ]);
    let runner = fx.runner(provider);

    let outcome = runner
        .run_instance(&fx.principal, &instance.id, &ApprovingDriver)
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    let tool_msg = outcome.messages.iter().find(|m| m.role == "tool").unwrap();
    assert!(!tool_msg.is_error, "got: {}", tool_msg.content);
    assert!(tool_msg.content.contains("hello-drover"));

    let events = fx.store.events_for_instance(&instance.id).unwrap();
    assert!(events.iter().any(|e| e.event_type == EventType::ToolCallApproved));
}

#[tokio::test]
async fn test_duplicate_calls_in_one_turn_are_single_flighted() {
    let fx = Fixture::new(Role::Admin, ExecutionMode::MultiStep, 10, &["write_file"]).await;
    fx.set_trust_mode().await;
    let instance = fx.spawn("log twice");

    // Two identical calls in one turn: both get results, execution runs
    // once (the second append would otherwise error or duplicate work).
    let provider = MockProvider::scripted(vec![
        ChatResponse {
            content: None,
            tool_calls: vec![
                ToolCallRequest {
                    id: "call_1".to_string(),
                    name: "write_file".to_string(),
                    arguments: json!({"path": "log.txt", "content": "entry"}),
                },
                ToolCallRequest {
                    id: "call_2".to_string(),
                    name: "write_file".to_string(),
                    arguments: json!({"content": "entry", "path": "log.txt"}),
                },
            ],
            model: "mock-model".to_string(),
            usage: Usage {
                prompt_tokens: 50,
                completion_tokens: 50,
                total_tokens: 100,
            },
        },
        text_response("logged", 20),
    ]);
    let runner = fx.runner(provider);

    let outcome = runner
        .run_instance(&fx.principal, &instance.id, &SurrenderDriver)
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    let tool_msgs: Vec<_> = outcome
        .messages
        .iter()
        .filter(|m| m.role == "tool")
        .collect();
    assert_eq!(tool_msgs.len(), 2);
    // Emission order preserved, identical shared result.
    assert_eq!(tool_msgs[0].tool_call_id.as_deref(), Some("call_1"));
    assert_eq!(tool_msgs[1].tool_call_id.as_deref(), Some("call_2"));
    assert_eq!(tool_msgs[0].content, tool_msgs[1].content);
}

#[tokio::test]
async fn test_provider_failure_surfaces_model_unavailable() {
    struct DeadProvider;

    #[async_trait]
    impl ChatProvider for DeadProvider {
        async fn chat(&self, _req: ChatRequest<'_>) -> anyhow::Result<ChatResponse> {
            anyhow::bail!("connection refused")
        }
        fn default_model(&self) -> &str {
            "dead"
        }
    }

    let fx = Fixture::new(Role::Admin, ExecutionMode::MultiStep, 10, &["read_file"]).await;
    let instance = fx.spawn("anything");

    let runner = AgentRunner::new(
        Arc::new(DeadProvider),
        fx.sessions.clone(),
        Arc::new(McpMultiplexer::new()),
        fx.store.clone(),
        RunConfig::default(),
    );

    let err = runner
        .run_instance(&fx.principal, &instance.id, &SurrenderDriver)
        .await
        .unwrap_err();
    assert!(matches!(err, DroverError::ModelUnavailable(_)));

    let stored = fx.store.get_instance(&instance.id).unwrap().unwrap();
    assert_eq!(stored.status, InstanceStatus::Failed);
    let events = fx.store.events_for_instance(&instance.id).unwrap();
    assert_eq!(events.last().unwrap().event_type, EventType::Failed);
}

#[tokio::test]
async fn test_cancelled_instance_refuses_further_steps() {
    let fx = Fixture::new(Role::Admin, ExecutionMode::MultiStep, 10, &["list_dir"]).await;
    fx.set_trust_mode().await;
    let instance = fx.spawn("explore");

    // Cancel after spawn but before the run begins its second step: mark
    // running -> cancelled out-of-band, then drive a loop that would
    // otherwise keep going.
    let provider = MockProvider::scripted(vec![
        tool_call_response("call_1", "list_dir", json!({"path": "."}), 50),
        tool_call_response("call_2", "list_dir", json!({"path": "."}), 50),
        text_response("never reached", 10),
    ]);

    // Wrap a driver that cancels the instance when the first tool call
    // completes; the loop must notice at the next step boundary.
    let store = fx.store.clone();
    let instance_id = instance.id.clone();
    struct CancellingProvider {
        inner: Arc<MockProvider>,
        store: Arc<Store>,
        instance_id: String,
        fired: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl ChatProvider for CancellingProvider {
        async fn chat(&self, req: ChatRequest<'_>) -> anyhow::Result<ChatResponse> {
            let response = self.inner.chat(req).await?;
            if !self.fired.swap(true, std::sync::atomic::Ordering::SeqCst) {
                // After the first turn is delivered, cancel the instance.
                self.store
                    .update_instance_status(&self.instance_id, InstanceStatus::Cancelled)
                    .unwrap();
            }
            Ok(response)
        }
        fn default_model(&self) -> &str {
            "mock-model"
        }
    }

    let runner = AgentRunner::new(
        Arc::new(CancellingProvider {
            inner: provider,
            store,
            instance_id,
            fired: std::sync::atomic::AtomicBool::new(false),
        }),
        fx.sessions.clone(),
        Arc::new(McpMultiplexer::new()),
        fx.store.clone(),
        RunConfig::default(),
    );

    let outcome = runner
        .run_instance(&fx.principal, &instance.id, &SurrenderDriver)
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Cancelled);
    let stored = fx.store.get_instance(&instance.id).unwrap().unwrap();
    assert_eq!(stored.status, InstanceStatus::Cancelled);
    let events = fx.store.events_for_instance(&instance.id).unwrap();
    assert_eq!(events.last().unwrap().event_type, EventType::Cancelled);
}
