use serde::{Deserialize, Serialize};

use crate::payload::NormalizedPayload;
use crate::session::{OperationId, SessionId};

/// One unit of the normalized output stream.
///
/// Invariants enforced by every adapter, not by this type: every event
/// carries `session_id`; events within one operation carry its
/// `operation_id`; events are observed in the order the adapter produced
/// them; `Complete`/`Error` are terminal for an operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentEvent {
    pub session_id: SessionId,
    pub operation_id: OperationId,
    pub kind: AgentEventKind,
}

impl AgentEvent {
    pub fn new(session_id: SessionId, operation_id: OperationId, kind: AgentEventKind) -> Self {
        Self {
            session_id,
            operation_id,
            kind,
        }
    }

    /// True for the two terminal kinds (`complete`, `error`) that end an operation.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, AgentEventKind::Complete { .. } | AgentEventKind::Error { .. })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    New,
    Resumed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Running,
    Complete,
    Error,
    PendingPermission,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanEntry {
    pub content: String,
    pub status: PlanStatus,
    pub priority: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct ContextWindow {
    pub tokens_used: u64,
    pub context_window: Option<u64>,
}

/// Carried on the `complete` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CompleteData {
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub num_turns: Option<u64>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEventKind {
    SessionStatus {
        status: SessionStatus,
    },
    AvailableCommands {
        commands: Vec<String>,
    },
    MessageChunk {
        text: String,
    },
    Reasoning {
        text: String,
    },
    ToolCall {
        tool_call_id: String,
        title: String,
        payload: NormalizedPayload,
        status: ToolStatus,
    },
    ToolUpdate {
        tool_call_id: String,
        payload: NormalizedPayload,
        status: ToolStatus,
    },
    Plan {
        entries: Vec<PlanEntry>,
    },
    PermissionRequest {
        pending_id: String,
    },
    PermissionCancelled {
        pending_id: String,
    },
    ContextWindow(ContextWindow),
    RateLimit {
        message: String,
    },
    Complete {
        data: CompleteData,
        is_error: bool,
    },
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_and_error_are_terminal() {
        let sid = SessionId::from_upstream("s1");
        let oid = OperationId::new();
        let complete = AgentEvent::new(
            sid.clone(),
            oid.clone(),
            AgentEventKind::Complete {
                data: CompleteData::default(),
                is_error: false,
            },
        );
        let error = AgentEvent::new(
            sid.clone(),
            oid.clone(),
            AgentEventKind::Error {
                message: "boom".into(),
            },
        );
        let chunk = AgentEvent::new(
            sid,
            oid,
            AgentEventKind::MessageChunk { text: "hi".into() },
        );
        assert!(complete.is_terminal());
        assert!(error.is_terminal());
        assert!(!chunk.is_terminal());
    }
}
