use std::collections::HashMap;

use gateway_core::{
    AgentEvent, AgentEventKind, CompleteData, ContextWindow, NormalizedPayload, PlanEntry,
    PlanStatus, ShellOutput, ToolStatus,
};
use gateway_core::{OperationId, SessionId};
use serde_json::Value;
use tracing::{debug, warn};

/// Per-operation decoder state for the Codex JSON-RPC wire.
pub struct TurnState {
    pub session_id: SessionId,
    pub operation_id: OperationId,
    pub thread_id: Option<String>,
    pub turn_id: Option<String>,
    pending_tools: HashMap<String, NormalizedPayload>,
    pub message_buffer: String,
}

impl TurnState {
    pub fn new(session_id: SessionId, operation_id: OperationId) -> Self {
        Self {
            session_id,
            operation_id,
            thread_id: None,
            turn_id: None,
            pending_tools: HashMap::new(),
            message_buffer: String::new(),
        }
    }

    pub fn begin_turn(&mut self, operation_id: OperationId) {
        self.operation_id = operation_id;
        self.message_buffer.clear();
    }

    fn emit(&self, kind: AgentEventKind) -> AgentEvent {
        AgentEvent::new(self.session_id.clone(), self.operation_id.clone(), kind)
    }
}

/// Outcome of dispatching one Codex notification: the normalized events it
/// produced, plus whether it signals the end of the in-flight turn.
pub struct Dispatched {
    pub events: Vec<AgentEvent>,
    pub turn_completed: Option<Result<(), String>>,
}

impl Dispatched {
    fn events(events: Vec<AgentEvent>) -> Self {
        Self { events, turn_completed: None }
    }
}

/// Dispatches one Codex notification (`method` + `params`) into normalized
/// events.
pub fn handle_notification(state: &mut TurnState, method: &str, params: &Value) -> Dispatched {
    match method {
        "item.agent_message.delta" => {
            let Some(text) = params.get("delta").and_then(Value::as_str) else {
                return Dispatched::events(Vec::new());
            };
            state.message_buffer.push_str(text);
            Dispatched::events(vec![state.emit(AgentEventKind::MessageChunk { text: text.to_string() })])
        }
        "item.reasoning_text.delta" | "item.reasoning_summary.delta" => {
            let Some(text) = params.get("delta").and_then(Value::as_str) else {
                return Dispatched::events(Vec::new());
            };
            Dispatched::events(vec![state.emit(AgentEventKind::Reasoning { text: text.to_string() })])
        }
        "turn/completed" => {
            let failure = params.get("error").and_then(Value::as_object);
            let is_error = failure.is_some();
            let mut events = Vec::new();
            for (tool_call_id, payload) in state.pending_tools.drain().collect::<Vec<_>>() {
                events.push(state.emit(AgentEventKind::ToolUpdate {
                    tool_call_id,
                    payload,
                    status: ToolStatus::Complete,
                }));
            }
            let data = CompleteData {
                cost_usd: None,
                duration_ms: params.get("duration_ms").and_then(Value::as_u64),
                num_turns: None,
                input_tokens: None,
                output_tokens: None,
            };
            events.push(state.emit(AgentEventKind::Complete { data, is_error }));
            let outcome = if is_error {
                let message = failure
                    .and_then(|f| f.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("turn failed")
                    .to_string();
                events.push(state.emit(AgentEventKind::Error { message: message.clone() }));
                Err(message)
            } else {
                Ok(())
            };
            Dispatched { events, turn_completed: Some(outcome) }
        }
        "turn/diff_updated" => {
            debug!("codex turn/diff_updated (no dedicated event, folded into tool_update diffs)");
            Dispatched::events(Vec::new())
        }
        "turn/plan_updated" => {
            let entries = params
                .get("plan")
                .and_then(Value::as_array)
                .map(|items| plan_entries(items))
                .unwrap_or_default();
            Dispatched::events(vec![state.emit(AgentEventKind::Plan { entries })])
        }
        "item.started" => Dispatched::events(handle_item_started(state, params)),
        "item.completed" => Dispatched::events(handle_item_completed(state, params)),
        "item.cmd_exec.output_delta" => Dispatched::events(handle_output_delta(state, params)),
        "thread/tokenUsage/updated" => {
            let Some(window) = token_usage_window(params) else {
                return Dispatched::events(Vec::new());
            };
            Dispatched::events(vec![state.emit(AgentEventKind::ContextWindow(window))])
        }
        "context.compacted" => {
            debug!("codex context.compacted");
            Dispatched::events(Vec::new())
        }
        other => {
            debug!(method = other, "unrecognized codex notification, skipping");
            Dispatched::events(Vec::new())
        }
    }
}

fn plan_entries(items: &[Value]) -> Vec<PlanEntry> {
    items
        .iter()
        .filter_map(|item| {
            let content = item.get("content").or_else(|| item.get("step")).and_then(Value::as_str)?;
            let status = match item.get("status").and_then(Value::as_str) {
                Some("in_progress") => PlanStatus::InProgress,
                Some("completed") | Some("complete") => PlanStatus::Completed,
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

fn item_kind(params: &Value) -> Option<&str> {
    params
        .get("item")
        .and_then(|i| i.get("type"))
        .or_else(|| params.get("type"))
        .and_then(Value::as_str)
}

fn item_id(params: &Value) -> Option<String> {
    params
        .get("item")
        .and_then(|i| i.get("id"))
        .or_else(|| params.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn handle_item_started(state: &mut TurnState, params: &Value) -> Vec<AgentEvent> {
    let Some(kind) = item_kind(params) else { return Vec::new() };
    let Some(id) = item_id(params) else { return Vec::new() };
    let item = params.get("item").unwrap_or(params);

    let (payload, title) = match kind {
        "commandExecution" => {
            let command = item.get("command").and_then(Value::as_str).unwrap_or_default().to_string();
            (
                NormalizedPayload::ShellExec {
                    command: command.clone(),
                    workdir: item.get("cwd").and_then(Value::as_str).map(str::to_string),
                    description: None,
                    timeout_ms: None,
                    background: false,
                    output: None,
                },
                command,
            )
        }
        "fileChange" => {
            let paths: Vec<String> = item
                .get("changes")
                .and_then(Value::as_array)
                .map(|changes| {
                    changes
                        .iter()
                        .filter_map(|c| c.get("path").and_then(Value::as_str))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            let title = match paths.split_first() {
                Some((first, rest)) if !rest.is_empty() => format!("{first} (+{} more)", rest.len()),
                Some((first, _)) => first.clone(),
                None => "file change".to_string(),
            };
            let file_path = paths.first().cloned().unwrap_or_default();
            (
                NormalizedPayload::ModifyFile { file_path, mutations: Vec::new(), output: None },
                title,
            )
        }
        _ => return Vec::new(),
    };

    state.pending_tools.insert(id.clone(), payload.clone());
    vec![state.emit(AgentEventKind::ToolCall {
        tool_call_id: id,
        title,
        payload,
        status: ToolStatus::Running,
    })]
}

fn handle_item_completed(state: &mut TurnState, params: &Value) -> Vec<AgentEvent> {
    let Some(kind) = item_kind(params) else { return Vec::new() };
    let Some(id) = item_id(params) else { return Vec::new() };
    let Some(payload) = state.pending_tools.remove(&id) else { return Vec::new() };
    let item = params.get("item").unwrap_or(params);

    let is_error = item.get("status").and_then(Value::as_str) == Some("failed")
        || item.get("exit_code").and_then(Value::as_i64).is_some_and(|c| c != 0);

    let enriched = match (kind, payload) {
        (
            "commandExecution",
            NormalizedPayload::ShellExec { command, workdir, description, timeout_ms, background, .. },
        ) => NormalizedPayload::ShellExec {
            command,
            workdir,
            description,
            timeout_ms,
            background,
            output: Some(ShellOutput {
                stdout: item.get("aggregatedOutput").and_then(Value::as_str).map(str::to_string),
                stderr: None,
                exit_code: item.get("exit_code").and_then(Value::as_i64).map(|c| c as i32),
            }),
        },
        ("fileChange", NormalizedPayload::ModifyFile { file_path, mutations, .. }) => {
            let mutations = item
                .get("changes")
                .and_then(Value::as_array)
                .map(|changes| {
                    changes
                        .iter()
                        .map(|c| gateway_core::FileMutation {
                            mutation_type: if c.get("kind").and_then(Value::as_str) == Some("add") {
                                gateway_core::FileMutationType::Create
                            } else {
                                gateway_core::FileMutationType::Patch
                            },
                            content: None,
                            old: None,
                            new: None,
                            diff: c.get("diff").and_then(Value::as_str).map(str::to_string),
                        })
                        .collect()
                })
                .unwrap_or(mutations);
            NormalizedPayload::ModifyFile {
                file_path,
                mutations,
                output: Some(gateway_core::ModifyFileOutput {
                    applied: !is_error,
                    error: if is_error {
                        item.get("error").and_then(Value::as_str).map(str::to_string)
                    } else {
                        None
                    },
                }),
            }
        }
        (_, other) => other,
    };

    vec![state.emit(AgentEventKind::ToolUpdate {
        tool_call_id: id,
        payload: enriched,
        status: if is_error { ToolStatus::Error } else { ToolStatus::Complete },
    })]
}

fn handle_output_delta(state: &mut TurnState, params: &Value) -> Vec<AgentEvent> {
    let Some(id) = item_id(params) else { return Vec::new() };
    let Some(delta) = params.get("delta").and_then(Value::as_str) else { return Vec::new() };
    let Some(payload) = state.pending_tools.get(&id).cloned() else { return Vec::new() };

    let updated = match payload {
        NormalizedPayload::ShellExec { command, workdir, description, timeout_ms, background, output } => {
            let mut stdout = output.and_then(|o| o.stdout).unwrap_or_default();
            stdout.push_str(delta);
            NormalizedPayload::ShellExec {
                command,
                workdir,
                description,
                timeout_ms,
                background,
                output: Some(ShellOutput { stdout: Some(stdout), stderr: None, exit_code: None }),
            }
        }
        other => other,
    };
    state.pending_tools.insert(id.clone(), updated.clone());

    vec![state.emit(AgentEventKind::ToolUpdate {
        tool_call_id: id,
        payload: updated,
        status: ToolStatus::Running,
    })]
}

fn token_usage_window(params: &Value) -> Option<ContextWindow> {
    let last = params.get("last")?;
    Some(ContextWindow {
        tokens_used: last.get("totalTokens").and_then(Value::as_u64).unwrap_or(0),
        context_window: params.get("modelContextWindow").and_then(Value::as_u64),
    })
}

/// Maps a Codex approval-request's own `options[]` (or the documented
/// defaults when empty) into normalized permission options.
pub fn approval_options(request_options: &[Value]) -> Vec<gateway_core::PermissionOption> {
    if request_options.is_empty() {
        return vec![
            gateway_core::PermissionOption {
                option_id: "approve".into(),
                name: "Approve".into(),
                kind: gateway_core::OptionKind::AllowOnce,
            },
            gateway_core::PermissionOption {
                option_id: "reject".into(),
                name: "Reject".into(),
                kind: gateway_core::OptionKind::RejectOnce,
            },
        ];
    }
    request_options
        .iter()
        .filter_map(Value::as_str)
        .filter_map(|literal| {
            gateway_core::OptionKind::from_option_id(literal).map(|kind| gateway_core::PermissionOption {
                option_id: literal.to_string(),
                name: literal.to_string(),
                kind,
            })
        })
        .collect()
}

/// Maps an arbitration decision back to Codex's `decision` vocabulary
/// (`accept | acceptForSession | decline | cancel`). A literal option id that
/// is already one of those four values passes through unchanged.
pub fn decision_for_response(response: &gateway_core::PermissionResponse) -> &'static str {
    if response.cancelled {
        return "cancel";
    }
    match response.option_id.as_deref() {
        Some("accept") | Some("approve") | Some("allow") => "accept",
        Some("acceptForSession") | Some("approveAlways") | Some("allowAlways") => "acceptForSession",
        Some("decline") | Some("reject") | Some("deny") => "decline",
        Some("cancel") => "cancel",
        _ => "decline",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fresh_state() -> TurnState {
        TurnState::new(SessionId::placeholder(), OperationId::new())
    }

    #[test]
    fn agent_message_delta_accumulates_buffer() {
        let mut state = fresh_state();
        let dispatched = handle_notification(&mut state, "item.agent_message.delta", &json!({"delta": "hel"}));
        assert_eq!(dispatched.events.len(), 1);
        let dispatched = handle_notification(&mut state, "item.agent_message.delta", &json!({"delta": "lo"}));
        assert_eq!(dispatched.events.len(), 1);
        assert_eq!(state.message_buffer, "hello");
    }

    #[test]
    fn item_started_then_completed_preserves_kind() {
        let mut state = fresh_state();
        let started = handle_notification(
            &mut state,
            "item.started",
            &json!({"item": {"id": "i1", "type": "commandExecution", "command": "ls"}}),
        );
        let AgentEventKind::ToolCall { payload, .. } = &started.events[0].kind else {
            panic!("expected tool_call");
        };
        assert_eq!(payload.kind_name(), "shell_exec");

        let completed = handle_notification(
            &mut state,
            "item.completed",
            &json!({"item": {"id": "i1", "type": "commandExecution", "exit_code": 0, "aggregatedOutput": "done"}}),
        );
        let AgentEventKind::ToolUpdate { payload, status, .. } = &completed.events[0].kind else {
            panic!("expected tool_update");
        };
        assert_eq!(payload.kind_name(), "shell_exec");
        assert_eq!(*status, ToolStatus::Complete);
    }

    #[test]
    fn turn_completed_auto_closes_pending_tools_and_signals() {
        let mut state = fresh_state();
        handle_notification(
            &mut state,
            "item.started",
            &json!({"item": {"id": "i1", "type": "commandExecution", "command": "ls"}}),
        );
        let dispatched = handle_notification(&mut state, "turn/completed", &json!({}));
        assert!(dispatched.events.iter().any(|e| matches!(&e.kind, AgentEventKind::ToolUpdate { tool_call_id, .. } if tool_call_id == "i1")));
        assert!(matches!(dispatched.events.last().unwrap().kind, AgentEventKind::Complete { is_error: false, .. }));
        assert_eq!(dispatched.turn_completed, Some(Ok(())));
    }

    #[test]
    fn turn_completed_with_error_emits_error_event() {
        let mut state = fresh_state();
        let dispatched = handle_notification(
            &mut state,
            "turn/completed",
            &json!({"error": {"message": "boom"}}),
        );
        assert!(dispatched.events.iter().any(|e| matches!(&e.kind, AgentEventKind::Error { message } if message == "boom")));
        assert_eq!(dispatched.turn_completed, Some(Err("boom".to_string())));
    }

    #[test]
    fn approval_options_default_when_request_omits_them() {
        let opts = approval_options(&[]);
        assert_eq!(opts.len(), 2);
        assert_eq!(opts[0].option_id, "approve");
    }

    #[test]
    fn approval_options_from_literal_values() {
        let opts = approval_options(&[json!("approve"), json!("approveAlways"), json!("reject")]);
        assert_eq!(opts.len(), 3);
        assert_eq!(opts[1].kind, gateway_core::OptionKind::AllowAlways);
    }

    #[test]
    fn decision_mapping_prefers_literal_session_values() {
        let response = gateway_core::PermissionResponse::allow("acceptForSession");
        assert_eq!(decision_for_response(&response), "acceptForSession");
        let cancelled = gateway_core::PermissionResponse::cancelled();
        assert_eq!(decision_for_response(&cancelled), "cancel");
    }
}
