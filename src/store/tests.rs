use super::*;
use crate::events::{Event, EventType};
use crate::rbac::Role;
use crate::spawner::types::{AgentSpec, Instance, InstanceStatus, Template, TemplateScope};
use serde_json::json;

fn template(id: &str) -> Template {
    Template {
        id: id.to_string(),
        name: format!("{} template", id),
        owner_id: "alice".to_string(),
        scope: TemplateScope::Global,
        required_roles: vec![Role::AgentUser],
        spec: AgentSpec {
            objective: "a test agent".to_string(),
            allowed_tools: vec!["read_file".to_string()],
            ..AgentSpec::default()
        },
        version: 0,
        max_template_tools: vec![],
        is_active: true,
    }
}

fn instance(id: &str, user: &str) -> Instance {
    let now = chrono::Utc::now();
    Instance {
        id: id.to_string(),
        template_id: "tpl".to_string(),
        template_version: 1,
        spawned_by_user_id: user.to_string(),
        parent_instance_id: None,
        root_instance_id: id.to_string(),
        depth: 0,
        status: InstanceStatus::Queued,
        current_state: "init".to_string(),
        step: 0,
        task: "do something".to_string(),
        context: json!({}),
        result: None,
        error: None,
        tokens_used: 0,
        cost: 0.0,
        created_at: now,
        updated_at: now,
        completed_at: None,
    }
}

#[test]
fn test_save_template_bumps_version() {
    let store = Store::in_memory().unwrap();
    let first = store.save_template(&template("tpl")).unwrap();
    assert_eq!(first.version, 1);

    let second = store.save_template(&template("tpl")).unwrap();
    assert_eq!(second.version, 2);

    // Lookup resolves to the newest version.
    let loaded = store.get_template("tpl").unwrap().unwrap();
    assert_eq!(loaded.version, 2);
}

#[test]
fn test_template_round_trip() {
    let store = Store::in_memory().unwrap();
    store.save_template(&template("tpl")).unwrap();
    let loaded = store.get_template("tpl").unwrap().unwrap();
    assert_eq!(loaded.name, "tpl template");
    assert_eq!(loaded.scope, TemplateScope::Global);
    assert_eq!(loaded.required_roles, vec![Role::AgentUser]);
    assert_eq!(loaded.spec.allowed_tools, vec!["read_file"]);
    assert!(loaded.is_active);
}

#[test]
fn test_get_missing_template() {
    let store = Store::in_memory().unwrap();
    assert!(store.get_template("ghost").unwrap().is_none());
}

#[test]
fn test_insert_instance_and_load() {
    let store = Store::in_memory().unwrap();
    store
        .insert_instance_checked(&instance("inst-1", "alice"), 50)
        .unwrap();
    let loaded = store.get_instance("inst-1").unwrap().unwrap();
    assert_eq!(loaded.status, InstanceStatus::Queued);
    assert_eq!(loaded.root_instance_id, "inst-1");
    assert_eq!(loaded.depth, 0);
    assert!(loaded.parent_instance_id.is_none());
}

#[test]
fn test_concurrent_instance_cap_enforced_in_transaction() {
    let store = Store::in_memory().unwrap();
    store
        .insert_instance_checked(&instance("inst-1", "alice"), 2)
        .unwrap();
    store
        .insert_instance_checked(&instance("inst-2", "alice"), 2)
        .unwrap();
    let err = store
        .insert_instance_checked(&instance("inst-3", "alice"), 2)
        .unwrap_err();
    assert!(matches!(err, DroverError::SpawnLimitExceeded(_)));

    // Other principals are not affected.
    store
        .insert_instance_checked(&instance("inst-4", "bob"), 2)
        .unwrap();
}

#[test]
fn test_terminal_instances_free_capacity() {
    let store = Store::in_memory().unwrap();
    store
        .insert_instance_checked(&instance("inst-1", "alice"), 1)
        .unwrap();
    store
        .update_instance_status("inst-1", InstanceStatus::Running)
        .unwrap();
    store
        .update_instance_status("inst-1", InstanceStatus::Completed)
        .unwrap();
    assert_eq!(store.count_active_instances("alice").unwrap(), 0);
    store
        .insert_instance_checked(&instance("inst-2", "alice"), 1)
        .unwrap();
}

#[test]
fn test_status_transition_rules_enforced() {
    let store = Store::in_memory().unwrap();
    store
        .insert_instance_checked(&instance("inst-1", "alice"), 50)
        .unwrap();

    // queued -> completed is illegal
    assert!(
        store
            .update_instance_status("inst-1", InstanceStatus::Completed)
            .is_err()
    );

    store
        .update_instance_status("inst-1", InstanceStatus::Running)
        .unwrap();
    store
        .update_instance_status("inst-1", InstanceStatus::AwaitingApproval)
        .unwrap();
    store
        .update_instance_status("inst-1", InstanceStatus::Running)
        .unwrap();
    store
        .update_instance_status("inst-1", InstanceStatus::Completed)
        .unwrap();

    // No resurrection.
    assert!(
        store
            .update_instance_status("inst-1", InstanceStatus::Running)
            .is_err()
    );

    let loaded = store.get_instance("inst-1").unwrap().unwrap();
    assert_eq!(loaded.status, InstanceStatus::Completed);
    assert!(loaded.completed_at.is_some());
}

#[test]
fn test_progress_and_result_updates() {
    let store = Store::in_memory().unwrap();
    store
        .insert_instance_checked(&instance("inst-1", "alice"), 50)
        .unwrap();
    store
        .update_instance_progress("inst-1", 3, 4500, "executing")
        .unwrap();
    store
        .set_instance_result("inst-1", Some(&json!({"answer": 42})), None)
        .unwrap();

    let loaded = store.get_instance("inst-1").unwrap().unwrap();
    assert_eq!(loaded.step, 3);
    assert_eq!(loaded.tokens_used, 4500);
    assert_eq!(loaded.current_state, "executing");
    assert_eq!(loaded.result.unwrap()["answer"], 42);
    assert!(loaded.error.is_none());
}

#[test]
fn test_event_log_append_and_read_in_order() {
    let store = Store::in_memory().unwrap();
    store
        .insert_instance_checked(&instance("inst-1", "alice"), 50)
        .unwrap();

    store
        .append_event(&Event::new("inst-1", EventType::Spawned, json!({"depth": 0})))
        .unwrap();
    store
        .append_event(
            &Event::new("inst-1", EventType::ModelTurn, json!({"step": 1})).with_tokens(120),
        )
        .unwrap();
    store
        .append_event(&Event::new("inst-1", EventType::Completed, json!({})))
        .unwrap();

    let events = store.events_for_instance("inst-1").unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].event_type, EventType::Spawned);
    assert_eq!(events[1].tokens_used, 120);
    assert_eq!(events[2].event_type, EventType::Completed);
    assert!(events.last().unwrap().event_type.is_terminal());
}

#[test]
fn test_events_for_root_spans_ancestry() {
    let store = Store::in_memory().unwrap();
    let parent = instance("root-1", "alice");
    let mut child = instance("child-1", "alice");
    child.parent_instance_id = Some("root-1".to_string());
    child.root_instance_id = "root-1".to_string();
    child.depth = 1;

    store.insert_instance_checked(&parent, 50).unwrap();
    store.insert_instance_checked(&child, 50).unwrap();

    store
        .append_event(&Event::new("root-1", EventType::Spawned, json!({})))
        .unwrap();
    store
        .append_event(&Event::new("child-1", EventType::Spawned, json!({})))
        .unwrap();

    let tree = store.events_for_root("root-1").unwrap();
    assert_eq!(tree.len(), 2);
    let only_child = store.events_for_instance("child-1").unwrap();
    assert_eq!(only_child.len(), 1);
}
