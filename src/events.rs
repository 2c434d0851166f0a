use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Externally meaningful transitions recorded in the append-only log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Spawned,
    StepStarted,
    ToolCallIssued,
    ToolCallApproved,
    ToolCallRejected,
    ToolCallResult,
    ModelTurn,
    Completed,
    Failed,
    Cancelled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Spawned => "spawned",
            EventType::StepStarted => "step_started",
            EventType::ToolCallIssued => "tool_call_issued",
            EventType::ToolCallApproved => "tool_call_approved",
            EventType::ToolCallRejected => "tool_call_rejected",
            EventType::ToolCallResult => "tool_call_result",
            EventType::ModelTurn => "model_turn",
            EventType::Completed => "completed",
            EventType::Failed => "failed",
            EventType::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "spawned" => Some(EventType::Spawned),
            "step_started" => Some(EventType::StepStarted),
            "tool_call_issued" => Some(EventType::ToolCallIssued),
            "tool_call_approved" => Some(EventType::ToolCallApproved),
            "tool_call_rejected" => Some(EventType::ToolCallRejected),
            "tool_call_result" => Some(EventType::ToolCallResult),
            "model_turn" => Some(EventType::ModelTurn),
            "completed" => Some(EventType::Completed),
            "failed" => Some(EventType::Failed),
            "cancelled" => Some(EventType::Cancelled),
            _ => None,
        }
    }

    /// Terminal events close an instance's log.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventType::Completed | EventType::Failed | EventType::Cancelled
        )
    }
}

/// One append-only log record, attributed to an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Assigned by the store on append; zero before persistence.
    pub id: i64,
    pub instance_id: String,
    pub event_type: EventType,
    pub payload: Value,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub tokens_used: u64,
    pub latency_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(instance_id: impl Into<String>, event_type: EventType, payload: Value) -> Self {
        Self {
            id: 0,
            instance_id: instance_id.into(),
            event_type,
            payload,
            trace_id: None,
            span_id: None,
            tokens_used: 0,
            latency_ms: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_type_round_trip() {
        for et in [
            EventType::Spawned,
            EventType::StepStarted,
            EventType::ToolCallIssued,
            EventType::ToolCallApproved,
            EventType::ToolCallRejected,
            EventType::ToolCallResult,
            EventType::ModelTurn,
            EventType::Completed,
            EventType::Failed,
            EventType::Cancelled,
        ] {
            assert_eq!(EventType::parse(et.as_str()), Some(et));
        }
    }

    #[test]
    fn test_terminal_classification() {
        assert!(EventType::Completed.is_terminal());
        assert!(EventType::Cancelled.is_terminal());
        assert!(!EventType::ModelTurn.is_terminal());
        assert!(!EventType::Spawned.is_terminal());
    }

    #[test]
    fn test_builder_helpers() {
        let event = Event::new("inst-1", EventType::ModelTurn, json!({"step": 2}))
            .with_tokens(250)
            .with_latency(1200);
        assert_eq!(event.tokens_used, 250);
        assert_eq!(event.latency_ms, Some(1200));
        assert_eq!(event.payload["step"], 2);
    }
}
