use crate::errors::{DroverError, DroverResult};
use crate::sandbox::SafetyLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Default lifetime of a pending call before late approvals are refused.
pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(600);

/// Per-session approval posture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// Every gated call parks as a pending entry until a human decides.
    #[default]
    RequireApproval,
    /// Safe and moderate calls pass; `run_command` and anything dangerous
    /// still require approval.
    TrustMode,
}

/// A tool call parked for human review. Lives in its session's pending set
/// from `proposed` until the first terminal transition (approve, reject,
/// or expiry), which removes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub safety: SafetyLevel,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl PendingCall {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.created_at);
        age.num_seconds() >= self.ttl_secs as i64
    }
}

/// Outcome of gating one tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// Execute now: already approved, exempt, or bypassed by trust mode.
    Proceed,
    /// Parked; the driver decides whether to block, surrender, or time out.
    Pending { call_id: String, safety: SafetyLevel },
}

/// The pending-call set owned by one session. Mutations happen under the
/// session's own lock; nothing here is shared across sessions.
#[derive(Debug, Default)]
pub struct PendingSet {
    entries: HashMap<String, PendingCall>,
    ttl: Option<Duration>,
}

impl PendingSet {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl: Some(ttl),
        }
    }

    fn ttl_secs(&self) -> u64 {
        self.ttl.unwrap_or(DEFAULT_PENDING_TTL).as_secs()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, call_id: &str) -> Option<&PendingCall> {
        self.entries.get(call_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingCall> {
        self.entries.values()
    }

    /// Park a call as `proposed` under a fresh id.
    pub fn insert(&mut self, tool_name: &str, arguments: Value, safety: SafetyLevel) -> String {
        let call_id = Uuid::new_v4().to_string();
        let call = PendingCall {
            call_id: call_id.clone(),
            tool_name: tool_name.to_string(),
            arguments,
            safety,
            created_at: Utc::now(),
            ttl_secs: self.ttl_secs(),
        };
        info!(
            call_id = %call_id,
            tool = tool_name,
            safety = %safety,
            "tool call pending approval"
        );
        self.entries.insert(call_id.clone(), call);
        call_id
    }

    /// Approve: the terminal `approved` transition. The entry is removed;
    /// the returned call is re-dispatched by the caller with approval set.
    /// A second approval of the same id finds nothing.
    pub fn approve(&mut self, call_id: &str) -> DroverResult<PendingCall> {
        let call = self
            .entries
            .remove(call_id)
            .ok_or_else(|| DroverError::PendingNotFound(call_id.to_string()))?;
        if call.is_expired_at(Utc::now()) {
            debug!(call_id = %call_id, "late approval of expired pending call");
            return Err(DroverError::PendingExpired(call_id.to_string()));
        }
        Ok(call)
    }

    /// Reject: terminal, removes the entry.
    pub fn reject(&mut self, call_id: &str) -> DroverResult<PendingCall> {
        self.entries
            .remove(call_id)
            .ok_or_else(|| DroverError::PendingNotFound(call_id.to_string()))
    }

    /// Drop every expired entry, returning the ids that vanished.
    pub fn sweep_expired(&mut self) -> Vec<String> {
        let now = Utc::now();
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|c| c.is_expired_at(now))
            .map(|c| c.call_id.clone())
            .collect();
        for id in &expired {
            self.entries.remove(id);
        }
        expired
    }
}

/// Decide whether a classified tool call may execute now or must park.
///
/// `dispatch_name` is the name the call is routed by (possibly mangled);
/// `bare_name` is the underlying tool name the rules apply to, so a
/// mangled `run_command` cannot slip past the trust-mode exception.
///
/// Rules, in order:
/// 1. an already-approved call (an approve() re-dispatch) proceeds;
/// 2. record-only tools (`think`, `plan_task`) are exempt;
/// 3. dangerous calls always park, whatever the mode;
/// 4. trust mode passes everything else except `run_command`;
/// 5. otherwise park.
#[allow(clippy::too_many_arguments)]
pub fn gate(
    pending: &mut PendingSet,
    mode: ApprovalMode,
    dispatch_name: &str,
    bare_name: &str,
    approval_exempt: bool,
    safety: SafetyLevel,
    arguments: &Value,
    approved: bool,
) -> GateDecision {
    // Expired entries vanish at every gating pass, so the pending set
    // never accumulates stale calls. approve() keeps its own expiry check
    // for entries that lapse between sweeps.
    let swept = pending.sweep_expired();
    if !swept.is_empty() {
        debug!("swept {} expired pending call(s)", swept.len());
    }

    if approved || approval_exempt {
        return GateDecision::Proceed;
    }

    if safety != SafetyLevel::Dangerous
        && mode == ApprovalMode::TrustMode
        && bare_name != "run_command"
    {
        return GateDecision::Proceed;
    }

    let call_id = pending.insert(dispatch_name, arguments.clone(), safety);
    GateDecision::Pending { call_id, safety }
}

#[cfg(test)]
mod tests;
