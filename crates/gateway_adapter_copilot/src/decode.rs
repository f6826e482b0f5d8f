use std::collections::HashMap;

use gateway_core::{
    AgentEvent, AgentEventKind, CompleteData, ContextWindow, FileMutation, FileMutationType,
    NormalizedPayload, OperationId, ReadFileOutput, SessionId, ShellOutput, TodoItem, TodoStatus,
    ToolStatus,
};
use serde_json::Value;
use tracing::debug;

use crate::protocol::EventNames;

/// Per-operation decoder state for the Copilot (and OpenCode) TCP wire.
/// `message_deltas_received`/`reasoning_deltas_received` implement
/// streaming-vs-full reconciliation: the full non-delta event is only
/// surfaced when no delta for that stream arrived.
pub struct TurnState {
    pub session_id: SessionId,
    pub operation_id: OperationId,
    pending_tools: HashMap<String, NormalizedPayload>,
    message_deltas_received: bool,
    reasoning_deltas_received: bool,
    pub complete_sent: bool,
}

impl TurnState {
    pub fn new(session_id: SessionId, operation_id: OperationId) -> Self {
        Self {
            session_id,
            operation_id,
            pending_tools: HashMap::new(),
            message_deltas_received: false,
            reasoning_deltas_received: false,
            complete_sent: false,
        }
    }

    pub fn begin_turn(&mut self, operation_id: OperationId) {
        self.operation_id = operation_id;
        self.message_deltas_received = false;
        self.reasoning_deltas_received = false;
        self.complete_sent = false;
    }

    fn emit(&self, kind: AgentEventKind) -> AgentEvent {
        AgentEvent::new(self.session_id.clone(), self.operation_id.clone(), kind)
    }

    /// Looks up the pending payload for a tool call, used by the adapter's
    /// permission-request path.
    pub fn pending_tool(&self, tool_call_id: &str) -> Option<&NormalizedPayload> {
        self.pending_tools.get(tool_call_id)
    }
}

fn todo_item_from_value(item: &Value) -> Option<TodoItem> {
    Some(TodoItem {
        id: item.get("id").and_then(Value::as_str)?.to_string(),
        description: item
            .get("content")
            .or_else(|| item.get("description"))
            .and_then(Value::as_str)?
            .to_string(),
        status: match item.get("status").and_then(Value::as_str) {
            Some("in_progress") => TodoStatus::InProgress,
            Some("completed") => TodoStatus::Completed,
            _ => TodoStatus::Pending,
        },
        active_form: item.get("activeForm").and_then(Value::as_str).map(str::to_string),
    })
}

/// Builds the `mutations[]` list for `edit_file`/`write_file`/`create_file`
/// args, following the same `create`-vs-`patch` split as the other
/// protocol normalizers.
fn file_mutations(tool_name: &str, path: &str, args: &Value) -> Vec<FileMutation> {
    let get_str = |key: &str| args.get(key).and_then(Value::as_str).map(str::to_string);
    match tool_name {
        "write_file" | "create_file" => vec![FileMutation {
            mutation_type: FileMutationType::Create,
            content: get_str("content"),
            old: None,
            new: None,
            diff: None,
        }],
        "edit_file" => {
            let old = get_str("old_string").unwrap_or_default();
            let new = get_str("new_string").unwrap_or_default();
            let diff = if old.is_empty() || new.is_empty() {
                String::new()
            } else {
                gateway_core::unified_diff(path, &old, &new)
            };
            vec![FileMutation {
                mutation_type: FileMutationType::Patch,
                content: None,
                old: Some(old),
                new: Some(new),
                diff: Some(diff),
            }]
        }
        _ => Vec::new(),
    }
}

/// Maps a Copilot tool name to a [`NormalizedPayload`] variant. Aliases
/// `bash.command` alongside stream-json's `Bash.command` and Amp's
/// `Bash.cmd`.
pub fn normalize_call(tool_name: &str, args: &Value) -> NormalizedPayload {
    let get_str = |key: &str| args.get(key).and_then(Value::as_str).map(str::to_string);
    match tool_name {
        "bash" | "shell" | "execute" | "run" => NormalizedPayload::ShellExec {
            command: get_str("command").unwrap_or_default(),
            workdir: get_str("cwd"),
            description: get_str("description"),
            timeout_ms: args.get("timeout_ms").and_then(Value::as_u64),
            background: args.get("background").and_then(Value::as_bool).unwrap_or(false),
            output: None,
        },
        "read_file" | "read" => NormalizedPayload::ReadFile {
            file_path: get_str("path").or_else(|| get_str("file_path")).unwrap_or_default(),
            offset: args.get("offset").and_then(Value::as_u64),
            limit: args.get("limit").and_then(Value::as_u64),
            output: None,
        },
        "edit_file" | "write_file" | "create_file" => {
            let file_path = get_str("path").or_else(|| get_str("file_path")).unwrap_or_default();
            NormalizedPayload::ModifyFile {
                mutations: file_mutations(tool_name, &file_path, args),
                file_path,
                output: None,
            }
        }
        "grep" | "search" | "code_search" => NormalizedPayload::CodeSearch {
            query: get_str("query"),
            pattern: get_str("pattern"),
            path: get_str("path"),
            glob: get_str("glob"),
            output: None,
        },
        "fetch" | "http" | "web_fetch" => NormalizedPayload::HttpRequest {
            url: get_str("url").unwrap_or_default(),
            method: get_str("method").unwrap_or_else(|| "GET".to_string()),
            response: None,
            is_error: false,
        },
        "task" | "subagent" => NormalizedPayload::SubagentTask {
            description: get_str("description"),
            prompt: get_str("prompt"),
            subagent_type: get_str("subagent_type"),
            status: gateway_core::SubagentStatus::Running,
            agent_id: None,
            duration_ms: None,
            total_tokens: None,
            tool_use_count: None,
        },
        "todo" | "manage_todos" => NormalizedPayload::ManageTodos {
            operation: gateway_core::ManageTodosOp::Write,
            items: args
                .get("items")
                .or_else(|| args.get("todos"))
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(todo_item_from_value).collect())
                .unwrap_or_default(),
        },
        other => NormalizedPayload::Generic { name: other.to_string(), args: args.clone(), output: None },
    }
}

/// Fills the `output` field of a previously normalized payload from a
/// `tool.complete` result. Shell output strips Copilot's
/// `<exited with exit code N>` suffix.
pub fn enrich_result(payload: NormalizedPayload, result: &Value) -> NormalizedPayload {
    let text = result.get("output").and_then(Value::as_str).map(str::to_string).or_else(|| result.as_str().map(str::to_string));
    match payload {
        NormalizedPayload::ShellExec { command, workdir, description, timeout_ms, background, .. } => {
            let (stdout, exit_code) =
            text.as_deref().map(gateway_core::strip_exit_code_suffix).unwrap_or((String::new(), None));
            NormalizedPayload::ShellExec {
                command,
                workdir,
                description,
                timeout_ms,
                background,
                output: Some(ShellOutput { stdout: Some(stdout), stderr: None, exit_code }),
            }
        }
        NormalizedPayload::ReadFile { file_path, offset, limit, .. } => {
            NormalizedPayload::ReadFile { file_path, offset, limit, output: Some(ReadFileOutput { content: text }) }
        }
        NormalizedPayload::ModifyFile { file_path, mutations, .. } => {
            let is_error = result.get("is_error").and_then(Value::as_bool).unwrap_or(false);
            NormalizedPayload::ModifyFile {
                file_path,
                mutations,
                output: Some(gateway_core::ModifyFileOutput { applied: !is_error, error: if is_error { text } else { None } }),
            }
        }
        NormalizedPayload::Generic { name, args, .. } => {
            NormalizedPayload::Generic { name, args, output: Some(result.clone()) }
        }
        other => other,
    }
}

/// Dispatches one Copilot `session.event` notification's `(event_type,
/// data)` pair, resolving `event_type` against `events` rather than a
/// hardcoded literal so the same code serves OpenCode.
pub fn handle_event(state: &mut TurnState, events: &EventNames, event_type: &str, data: &Value) -> Vec<AgentEvent> {
    match event_type {
        t if t == events.message_delta => {
            let Some(text) = data.get("content").and_then(Value::as_str) else { return Vec::new() };
            state.message_deltas_received = true;
            vec![state.emit(AgentEventKind::MessageChunk { text: text.to_string() })]
        }
        t if t == events.message => {
            if state.message_deltas_received {
                return Vec::new();
            }
            let Some(text) = data.get("content").and_then(Value::as_str) else { return Vec::new() };
            vec![state.emit(AgentEventKind::MessageChunk { text: text.to_string() })]
        }
        t if t == events.reasoning_delta => {
            let Some(text) = data.get("content").and_then(Value::as_str) else { return Vec::new() };
            state.reasoning_deltas_received = true;
            vec![state.emit(AgentEventKind::Reasoning { text: text.to_string() })]
        }
        t if t == events.reasoning => {
            if state.reasoning_deltas_received {
                return Vec::new();
            }
            let Some(text) = data.get("content").and_then(Value::as_str) else { return Vec::new() };
            vec![state.emit(AgentEventKind::Reasoning { text: text.to_string() })]
        }
        t if t == events.tool_start => handle_tool_start(state, data),
        t if t == events.tool_progress => handle_tool_progress(state, data),
        t if t == events.tool_complete => handle_tool_complete(state, data),
        t if t == events.session_usage_info || t == events.assistant_usage => {
            let Some(window) = usage_window(data) else { return Vec::new() };
            vec![state.emit(AgentEventKind::ContextWindow(window))]
        }
        t if t == events.session_error => {
            let message = data.get("message").and_then(Value::as_str).unwrap_or("session error").to_string();
            vec![state.emit(AgentEventKind::Error { message })]
        }
        t if t == events.session_idle => handle_idle(state),
        t if t == events.turn_start || t == events.turn_end => {
            debug!(event_type, "copilot turn lifecycle event, no dedicated agent event");
            Vec::new()
        }
        t if t == events.session_start || t == events.session_resume || t == events.session_abort => {
            debug!(event_type, "copilot session lifecycle event, handled by the adapter directly");
            Vec::new()
        }
        other => {
            debug!(event_type = other, "unrecognized copilot event type, skipping");
            Vec::new()
        }
    }
}

fn handle_tool_start(state: &mut TurnState, data: &Value) -> Vec<AgentEvent> {
    let Some(tool_call_id) = data.get("tool_call_id").and_then(Value::as_str) else { return Vec::new() };
    let tool_call_id = tool_call_id.to_string();
    let tool_name = data.get("tool_name").and_then(Value::as_str).unwrap_or("tool");
    let args = data.get("args").cloned().unwrap_or(Value::Null);
    let payload = normalize_call(tool_name, &args);
    state.pending_tools.insert(tool_call_id.clone(), payload.clone());
    vec![state.emit(AgentEventKind::ToolCall {
        tool_call_id,
        title: tool_name.to_string(),
        payload,
        status: ToolStatus::Running,
    })]
}

fn handle_tool_progress(state: &mut TurnState, data: &Value) -> Vec<AgentEvent> {
    let Some(tool_call_id) = data.get("tool_call_id").and_then(Value::as_str) else { return Vec::new() };
    let tool_call_id = tool_call_id.to_string();
    let Some(delta) = data.get("delta").and_then(Value::as_str) else { return Vec::new() };
    let Some(payload) = state.pending_tools.get(&tool_call_id).cloned() else { return Vec::new() };

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
    state.pending_tools.insert(tool_call_id.clone(), updated.clone());

    vec![state.emit(AgentEventKind::ToolUpdate { tool_call_id, payload: updated, status: ToolStatus::Running })]
}

fn handle_tool_complete(state: &mut TurnState, data: &Value) -> Vec<AgentEvent> {
    let Some(tool_call_id) = data.get("tool_call_id").and_then(Value::as_str) else { return Vec::new() };
    let tool_call_id = tool_call_id.to_string();
    let Some(payload) = state.pending_tools.remove(&tool_call_id) else { return Vec::new() };
    let result = data.get("result").cloned().unwrap_or(Value::Null);
    let is_error = data.get("is_error").and_then(Value::as_bool).unwrap_or(false);
    let enriched = enrich_result(payload, &result);

    vec![state.emit(AgentEventKind::ToolUpdate {
        tool_call_id,
        payload: enriched,
        status: if is_error { ToolStatus::Error } else { ToolStatus::Complete },
    })]
}

fn usage_window(data: &Value) -> Option<ContextWindow> {
    let tokens_used = data.get("total_tokens").or_else(|| data.get("tokens_used")).and_then(Value::as_u64)?;
    Some(ContextWindow { tokens_used, context_window: data.get("context_window").and_then(Value::as_u64) })
}

/// `session.idle` ends the operation. Guarded by
/// `complete_sent` since the SDK may emit more than one idle event.
fn handle_idle(state: &mut TurnState) -> Vec<AgentEvent> {
    if state.complete_sent {
        return Vec::new();
    }
    state.complete_sent = true;

    let mut out: Vec<AgentEvent> = state
        .pending_tools
        .drain()
        .collect::<Vec<_>>()
        .into_iter()
        .map(|(tool_call_id, payload)| {
            state.emit(AgentEventKind::ToolUpdate { tool_call_id, payload, status: ToolStatus::Complete })
        })
        .collect();

    out.push(state.emit(AgentEventKind::Complete {
        data: CompleteData {
            cost_usd: None,
            duration_ms: None,
            num_turns: None,
            input_tokens: None,
            output_tokens: None,
        },
        is_error: false,
    }));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CopilotProtocol;
    use serde_json::json;

    fn fresh_state() -> TurnState {
        TurnState::new(SessionId::placeholder(), OperationId::new())
    }

    #[test]
    fn message_delta_then_full_message_is_ignored() {
        let mut state = fresh_state();
        let events = CopilotProtocol::copilot().events;
        let delta = handle_event(&mut state, &events, events.message_delta, &json!({"content": "hel"}));
        assert_eq!(delta.len(), 1);
        let full = handle_event(&mut state, &events, events.message, &json!({"content": "hello"}));
        assert!(full.is_empty());
    }

    #[test]
    fn full_message_surfaces_when_no_deltas_arrived() {
        let mut state = fresh_state();
        let events = CopilotProtocol::copilot().events;
        let full = handle_event(&mut state, &events, events.message, &json!({"content": "hello"}));
        assert_eq!(full.len(), 1);
    }

    #[test]
    fn edit_file_call_produces_patch_mutation_with_diff() {
        let payload = normalize_call(
            "edit_file",
            &json!({"path": "a.rs", "old_string": "foo", "new_string": "bar"}),
        );
        let NormalizedPayload::ModifyFile { mutations, .. } = payload else { panic!("expected modify_file") };
        assert_eq!(mutations.len(), 1);
        assert_eq!(mutations[0].mutation_type, gateway_core::FileMutationType::Patch);
        assert!(mutations[0].diff.as_deref().unwrap().contains("diff --git"));
    }

    #[test]
    fn tool_start_then_complete_strips_exit_code_suffix() {
        let mut state = fresh_state();
        let events = CopilotProtocol::copilot().events;
        handle_event(
            &mut state,
            &events,
            events.tool_start,
            &json!({"tool_call_id": "t1", "tool_name": "bash", "args": {"command": "ls"}}),
        );
        let completed = handle_event(
            &mut state,
            &events,
            events.tool_complete,
            &json!({"tool_call_id": "t1", "result": {"output": "a.rs\n<exited with exit code 0>"}}),
        );
        let AgentEventKind::ToolUpdate { payload, status, .. } = &completed[0].kind else {
            panic!("expected tool_update")
        };
        assert_eq!(*status, ToolStatus::Complete);
        let NormalizedPayload::ShellExec { output, .. } = payload else { panic!("expected shell_exec") };
        assert_eq!(output.as_ref().unwrap().exit_code, Some(0));
        assert_eq!(output.as_ref().unwrap().stdout.as_deref(), Some("a.rs"));
    }

    #[test]
    fn idle_is_idempotent() {
        let mut state = fresh_state();
        let events = CopilotProtocol::copilot().events;
        let first = handle_event(&mut state, &events, events.session_idle, &json!({}));
        assert!(first.iter().any(|e| matches!(e.kind, AgentEventKind::Complete { .. })));
        let second = handle_event(&mut state, &events, events.session_idle, &json!({}));
        assert!(second.is_empty());
    }
}
