use super::*;
use serde_json::json;

fn park(pending: &mut PendingSet) -> String {
    pending.insert("run_command", json!({"cmd": "make"}), SafetyLevel::Moderate)
}

#[test]
fn test_approve_removes_entry() {
    let mut pending = PendingSet::default();
    let id = park(&mut pending);
    assert_eq!(pending.len(), 1);

    let call = pending.approve(&id).unwrap();
    assert_eq!(call.tool_name, "run_command");
    assert!(pending.is_empty());
}

#[test]
fn test_double_approve_is_not_found() {
    let mut pending = PendingSet::default();
    let id = park(&mut pending);
    pending.approve(&id).unwrap();
    let err = pending.approve(&id).unwrap_err();
    assert!(matches!(err, DroverError::PendingNotFound(_)));
}

#[test]
fn test_reject_then_approve_is_not_found() {
    let mut pending = PendingSet::default();
    let id = park(&mut pending);
    pending.reject(&id).unwrap();
    let err = pending.approve(&id).unwrap_err();
    assert!(matches!(err, DroverError::PendingNotFound(_)));
}

#[test]
fn test_unknown_id_not_found() {
    let mut pending = PendingSet::default();
    assert!(matches!(
        pending.approve("nope").unwrap_err(),
        DroverError::PendingNotFound(_)
    ));
    assert!(matches!(
        pending.reject("nope").unwrap_err(),
        DroverError::PendingNotFound(_)
    ));
}

#[test]
fn test_expired_entry_refuses_late_approval() {
    let mut pending = PendingSet::with_ttl(Duration::from_secs(0));
    let id = park(&mut pending);
    let err = pending.approve(&id).unwrap_err();
    assert!(matches!(err, DroverError::PendingExpired(_)));
    // Expiry is terminal: the entry is gone.
    assert!(pending.is_empty());
    assert!(matches!(
        pending.approve(&id).unwrap_err(),
        DroverError::PendingNotFound(_)
    ));
}

#[test]
fn test_sweep_expired() {
    let mut pending = PendingSet::with_ttl(Duration::from_secs(0));
    let a = park(&mut pending);
    let b = park(&mut pending);
    let mut swept = pending.sweep_expired();
    swept.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(swept, expected);
    assert!(pending.is_empty());
}

#[test]
fn test_fresh_entries_survive_sweep() {
    let mut pending = PendingSet::with_ttl(Duration::from_secs(600));
    let _id = park(&mut pending);
    assert!(pending.sweep_expired().is_empty());
    assert_eq!(pending.len(), 1);
}

// --- gating rules ---

#[test]
fn test_gate_sweeps_expired_entries() {
    let mut pending = PendingSet::with_ttl(Duration::from_secs(0));
    let stale = park(&mut pending);
    assert_eq!(pending.len(), 1);

    // The next gating pass drops the stale entry before parking the new
    // call, so only the fresh one remains.
    let decision = gate(
        &mut pending,
        ApprovalMode::RequireApproval,
        "write_file",
        "write_file",
        false,
        SafetyLevel::Moderate,
        &json!({"path": "a.txt"}),
        false,
    );
    assert!(matches!(decision, GateDecision::Pending { .. }));
    assert_eq!(pending.len(), 1);
    assert!(pending.get(&stale).is_none());
}

#[test]
fn test_gate_approved_call_proceeds() {
    let mut pending = PendingSet::default();
    let decision = gate(
        &mut pending,
        ApprovalMode::RequireApproval,
        "run_command",
        "run_command",
        false,
        SafetyLevel::Dangerous,
        &json!({"cmd": "rm -rf /"}),
        true,
    );
    assert_eq!(decision, GateDecision::Proceed);
    assert!(pending.is_empty());
}

#[test]
fn test_gate_exempt_tools_never_park() {
    let mut pending = PendingSet::default();
    for tool in ["think", "plan_task"] {
        let decision = gate(
            &mut pending,
            ApprovalMode::RequireApproval,
            tool,
            tool,
            true,
            SafetyLevel::Safe,
            &json!({}),
            false,
        );
        assert_eq!(decision, GateDecision::Proceed);
    }
    assert!(pending.is_empty());
}

#[test]
fn test_gate_require_approval_parks_safe_calls() {
    let mut pending = PendingSet::default();
    let decision = gate(
        &mut pending,
        ApprovalMode::RequireApproval,
        "read_file",
        "read_file",
        false,
        SafetyLevel::Safe,
        &json!({"path": "a.txt"}),
        false,
    );
    match decision {
        GateDecision::Pending { safety, .. } => assert_eq!(safety, SafetyLevel::Safe),
        GateDecision::Proceed => panic!("expected pending"),
    }
    assert_eq!(pending.len(), 1);
}

#[test]
fn test_gate_trust_mode_bypasses_safe_and_moderate() {
    let mut pending = PendingSet::default();
    for (tool, safety) in [
        ("read_file", SafetyLevel::Safe),
        ("write_file", SafetyLevel::Moderate),
    ] {
        let decision = gate(
            &mut pending,
            ApprovalMode::TrustMode,
            tool,
            tool,
            false,
            safety,
            &json!({}),
            false,
        );
        assert_eq!(decision, GateDecision::Proceed, "tool {}", tool);
    }
    // Bypass never creates pending entries.
    assert!(pending.is_empty());
}

#[test]
fn test_gate_trust_mode_still_parks_run_command() {
    let mut pending = PendingSet::default();
    let decision = gate(
        &mut pending,
        ApprovalMode::TrustMode,
        "run_command",
        "run_command",
        false,
        SafetyLevel::Safe,
        &json!({"cmd": "ls"}),
        false,
    );
    assert!(matches!(decision, GateDecision::Pending { .. }));
}

#[test]
fn test_gate_mangled_run_command_cannot_bypass_trust_mode() {
    // The rule applies to the bare name even when the call dispatches
    // through a mangled MCP name.
    let mut pending = PendingSet::default();
    let decision = gate(
        &mut pending,
        ApprovalMode::TrustMode,
        "mcp_drover-tools_run_command",
        "run_command",
        false,
        SafetyLevel::Safe,
        &json!({"cmd": "ls"}),
        false,
    );
    assert!(matches!(decision, GateDecision::Pending { .. }));
    // The pending entry carries the dispatch name for re-dispatch.
    let call = pending.iter().next().unwrap();
    assert_eq!(call.tool_name, "mcp_drover-tools_run_command");
}

#[test]
fn test_gate_dangerous_always_parks_even_in_trust_mode() {
    // run_python is dangerous; trust mode must not let it slip through.
    let mut pending = PendingSet::default();
    let decision = gate(
        &mut pending,
        ApprovalMode::TrustMode,
        "run_python",
        "run_python",
        false,
        SafetyLevel::Dangerous,
        &json!({"code": "print(1)"}),
        false,
    );
    match decision {
        GateDecision::Pending { safety, .. } => assert_eq!(safety, SafetyLevel::Dangerous),
        GateDecision::Proceed => panic!("dangerous call bypassed approval"),
    }
}
