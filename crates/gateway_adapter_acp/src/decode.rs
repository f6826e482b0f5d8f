use std::collections::HashMap;

use gateway_core::{
    AgentEvent, AgentEventKind, NormalizedPayload, OperationId, PlanEntry, PlanStatus, SessionId,
    ToolStatus,
};
use serde_json::{json, Value};
use tracing::debug;

/// Per-session decoder state for the ACP wire. ACP has no turn id of
/// its own, so every event this adapter emits carries [`OperationId::empty`].
pub struct TurnState {
    pub session_id: SessionId,
    pending_tools: HashMap<String, NormalizedPayload>,
}

impl TurnState {
    pub fn new(session_id: SessionId) -> Self {
        Self { session_id, pending_tools: HashMap::new() }
    }

    fn emit(&self, kind: AgentEventKind) -> AgentEvent {
        AgentEvent::new(self.session_id.clone(), OperationId::empty(), kind)
    }
}

/// Dispatches one `session/update` notification payload (the `update` object,
/// already unwrapped from its `sessionId` envelope) into normalized events.
pub fn handle_session_update(state: &mut TurnState, update: &Value) -> Vec<AgentEvent> {
    match update.get("sessionUpdate").and_then(Value::as_str) {
        Some("agent_message_chunk") => {
            let Some(text) = chunk_text(update) else { return Vec::new() };
            vec![state.emit(AgentEventKind::MessageChunk { text })]
        }
        Some("agent_thought_chunk") => {
            let Some(text) = chunk_text(update) else { return Vec::new() };
            vec![state.emit(AgentEventKind::Reasoning { text })]
        }
        Some("tool_call") => handle_tool_call(state, update),
        Some("tool_call_update") => handle_tool_call_update(state, update),
        Some("plan") => {
            let entries = update
                .get("entries")
                .and_then(Value::as_array)
                .map(|items| plan_entries(items))
                .unwrap_or_default();
            vec![state.emit(AgentEventKind::Plan { entries })]
        }
        other => {
            debug!(kind = ?other, "unrecognized acp session/update kind, skipping");
            Vec::new()
        }
    }
}

fn chunk_text(update: &Value) -> Option<String> {
    update.get("content")?.get("text")?.as_str().map(str::to_string)
}

fn plan_entries(items: &[Value]) -> Vec<PlanEntry> {
    items
        .iter()
        .filter_map(|item| {
            let content = item.get("content").and_then(Value::as_str)?;
            let status = match item.get("status").and_then(Value::as_str) {
                Some("in_progress") => PlanStatus::InProgress,
                Some("completed") => PlanStatus::Completed,
                _ => PlanStatus::Pending,
            };
            Some(PlanEntry {
                content: content.to_string(),
                status,
                priority: item.get("priority").and_then(Value::as_str).map(str::to_string),
            })
        })
        .collect()
}

/// Builds the [`NormalizedPayload`] for an ACP `tool_call` update. ACP tools
/// carry no per-tool schema of their own, so the payload is always
/// [`NormalizedPayload::Generic`] keyed by the tool's `kind`, with `args`
/// hydrated from `locations[]` and `rawInput`.
fn tool_call_payload(update: &Value) -> NormalizedPayload {
    let kind = update.get("kind").and_then(Value::as_str).unwrap_or("other").to_string();
    let locations = update.get("locations").cloned().unwrap_or(Value::Array(Vec::new()));
    let raw_input = update.get("rawInput").cloned().unwrap_or(Value::Null);
    NormalizedPayload::Generic {
        name: kind,
        args: json!({ "locations": locations, "raw_input": raw_input }),
        output: None,
    }
}

fn tool_title(update: &Value) -> String {
    update
        .get("title")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| update.get("kind").and_then(Value::as_str).unwrap_or("tool").to_string())
}

fn handle_tool_call(state: &mut TurnState, update: &Value) -> Vec<AgentEvent> {
    let Some(tool_call_id) = update.get("toolCallId").and_then(Value::as_str) else {
        return Vec::new();
    };
    let tool_call_id = tool_call_id.to_string();
    let payload = tool_call_payload(update);
    let status = status_from(update.get("status").and_then(Value::as_str));
    state.pending_tools.insert(tool_call_id.clone(), payload.clone());
    vec![state.emit(AgentEventKind::ToolCall {
        tool_call_id,
        title: tool_title(update),
        payload,
        status,
    })]
}

fn handle_tool_call_update(state: &mut TurnState, update: &Value) -> Vec<AgentEvent> {
    let Some(tool_call_id) = update.get("toolCallId").and_then(Value::as_str) else {
        return Vec::new();
    };
    let tool_call_id = tool_call_id.to_string();
    let status = status_from(update.get("status").and_then(Value::as_str));

    let payload = match state.pending_tools.remove(&tool_call_id) {
        Some(NormalizedPayload::Generic { name, args, .. }) => {
            let output = update
                .get("content")
                .cloned()
                .or_else(|| update.get("rawOutput").cloned());
            NormalizedPayload::Generic { name, args, output }
        }
        Some(other) => other,
        None => tool_call_payload(update),
    };

    if matches!(status, ToolStatus::Running | ToolStatus::PendingPermission) {
        state.pending_tools.insert(tool_call_id.clone(), payload.clone());
    }

    vec![state.emit(AgentEventKind::ToolUpdate { tool_call_id, payload, status })]
}

/// Marks a tool call as awaiting permission, without dropping whatever
/// payload the decoder has already built for it (used by the synthetic
/// `pending_permission` event the adapter emits alongside `requestPermission`).
pub fn mark_pending_permission(state: &mut TurnState, tool_call_id: &str, fallback_title: &str) -> AgentEvent {
    let payload = state
        .pending_tools
        .get(tool_call_id)
        .cloned()
        .unwrap_or_else(|| NormalizedPayload::Generic {
            name: fallback_title.to_string(),
            args: Value::Null,
            output: None,
        });
    state.emit(AgentEventKind::ToolCall {
        tool_call_id: tool_call_id.to_string(),
        title: fallback_title.to_string(),
        payload,
        status: ToolStatus::PendingPermission,
    })
}

fn status_from(status: Option<&str>) -> ToolStatus {
    match status {
        Some("completed") | Some("complete") => ToolStatus::Complete,
        Some("failed") | Some("error") => ToolStatus::Error,
        Some("pending_permission") => ToolStatus::PendingPermission,
        _ => ToolStatus::Running,
    }
}

/// Maps ACP's `kind` field on a `requestPermission` option
/// (`allow_once|allow_always|reject_once|reject_always`) into the canonical
/// [`gateway_core::OptionKind`].
pub fn acp_option_kind(kind: &str) -> Option<gateway_core::OptionKind> {
    match kind {
        "allow_once" => Some(gateway_core::OptionKind::AllowOnce),
        "allow_always" => Some(gateway_core::OptionKind::AllowAlways),
        "reject_once" | "reject_always" => Some(gateway_core::OptionKind::RejectOnce),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_state() -> TurnState {
        TurnState::new(SessionId::placeholder())
    }

    #[test]
    fn agent_message_chunk_emits_message_chunk() {
        let mut state = fresh_state();
        let events = handle_session_update(
            &mut state,
            &json!({"sessionUpdate": "agent_message_chunk", "content": {"text": "hi"}}),
        );
        assert!(matches!(&events[0].kind, AgentEventKind::MessageChunk { text } if text == "hi"));
    }

    #[test]
    fn tool_call_then_update_preserves_generic_kind() {
        let mut state = fresh_state();
        let started = handle_session_update(
            &mut state,
            &json!({
                "sessionUpdate": "tool_call",
                "toolCallId": "t1",
                "title": "Read file",
                "kind": "read",
                "locations": [{"path": "a.rs", "line": 3}],
                "rawInput": {"path": "a.rs"},
            }),
        );
        let AgentEventKind::ToolCall { payload, status, .. } = &started[0].kind else {
            panic!("expected tool_call")
        };
        assert_eq!(payload.kind_name(), "generic");
        assert_eq!(*status, ToolStatus::Running);

        let updated = handle_session_update(
            &mut state,
            &json!({"sessionUpdate": "tool_call_update", "toolCallId": "t1", "status": "completed", "content": "done"}),
        );
        let AgentEventKind::ToolUpdate { payload, status, .. } = &updated[0].kind else {
            panic!("expected tool_update")
        };
        assert_eq!(payload.kind_name(), "generic");
        assert_eq!(*status, ToolStatus::Complete);
    }

    #[test]
    fn plan_maps_entries() {
        let mut state = fresh_state();
        let events = handle_session_update(
            &mut state,
            &json!({"sessionUpdate": "plan", "entries": [{"content": "step 1", "status": "in_progress"}]}),
        );
        let AgentEventKind::Plan { entries } = &events[0].kind else { panic!("expected plan") };
        assert_eq!(entries[0].content, "step 1");
        assert_eq!(entries[0].status, PlanStatus::InProgress);
    }

    #[test]
    fn option_kind_mapping() {
        assert_eq!(acp_option_kind("allow_once"), Some(gateway_core::OptionKind::AllowOnce));
        assert_eq!(acp_option_kind("reject_always"), Some(gateway_core::OptionKind::RejectOnce));
        assert_eq!(acp_option_kind("bogus"), None);
    }
}
