use std::collections::HashMap;

use gateway_core::{
    AgentEvent, AgentEventKind, CompleteData, ContextWindow, FileMutation, FileMutationType,
    NormalizedPayload, PlanEntry, ReadFileOutput, ShellOutput, SubagentStatus, TodoItem,
    TodoStatus, ToolStatus,
};
use serde_json::Value;
use tracing::{debug, warn};

use gateway_core::{OperationId, SessionId};

/// Per-operation decoder state for the stream-json wire. One instance
/// lives for the duration of a single `prompt` call; `session_id` persists
/// across calls on the same adapter.
pub struct TurnState {
    pub session_id: SessionId,
    pub operation_id: OperationId,
    pub session_status_emitted: bool,
    pending_tools: HashMap<String, NormalizedPayload>,
    streaming_text_sent_this_turn: bool,
    pub model_name: Option<String>,
    pub complete_sent: bool,
    /// The most recently committed assistant message uuid, used by resume
    /// (`--resume-session-at`) to pick up after a specific message. Committed
    /// on the next structurally distinct assistant message or on `result`,
    /// never on a timer, since the decoder has no separate timer task.
    pub last_message_uuid: Option<String>,
    pending_assistant_uuid: Option<String>,
}

impl TurnState {
    pub fn new(session_id: SessionId, operation_id: OperationId) -> Self {
        Self {
            session_id,
            operation_id,
            session_status_emitted: false,
            pending_tools: HashMap::new(),
            streaming_text_sent_this_turn: false,
            model_name: None,
            complete_sent: false,
            last_message_uuid: None,
            pending_assistant_uuid: None,
        }
    }

    /// Commits `pending_assistant_uuid` into `last_message_uuid` if it has
    /// not already been committed.
    fn commit_pending_uuid(&mut self) {
        if let Some(uuid) = self.pending_assistant_uuid.take() {
            self.last_message_uuid = Some(uuid);
        }
    }

    /// Resets the per-turn accumulators a new `prompt` call must start with,
    /// keeping the session id and any not-yet-reconciled pending tools.
    pub fn begin_turn(&mut self, operation_id: OperationId) {
        self.operation_id = operation_id;
        self.streaming_text_sent_this_turn = false;
        self.complete_sent = false;
    }

    fn emit(&self, kind: AgentEventKind) -> AgentEvent {
        AgentEvent::new(self.session_id.clone(), self.operation_id.clone(), kind)
    }
}

/// Decodes one stream-json line into zero or more normalized events,
/// mutating `state` as a side effect (pending-tool map, session id,
/// streaming-text flag). Malformed content inside a known message shape is
/// skipped rather than failing the whole line.
pub fn handle_message(state: &mut TurnState, value: &Value) -> Vec<AgentEvent> {
    let Some(msg_type) = value.get("type").and_then(Value::as_str) else {
        warn!("stream-json message missing \"type\" field");
        return Vec::new();
    };

    if let Some(sid) = value.get("session_id").and_then(Value::as_str) {
        if sid != state.session_id.as_str() {
            debug!(old = %state.session_id, new = sid, "stream-json session id updated");
            state.session_id = SessionId::from_upstream(sid);
        }
    }

    match msg_type {
        "system" => handle_system(state, value),
        "assistant" => handle_assistant(state, value),
        "user" => handle_user(state, value),
        "rate_limit" => handle_rate_limit(state, value),
        "result" => handle_result(state, value),
        other => {
            debug!(msg_type = other, "unrecognized stream-json message type, skipping");
            Vec::new()
        }
    }
}

fn handle_system(state: &mut TurnState, value: &Value) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    let subtype = value.get("subtype").and_then(Value::as_str);
    if !state.session_status_emitted {
        let status = if subtype == Some("resumed") {
            gateway_core::SessionStatus::Resumed
        } else {
            gateway_core::SessionStatus::New
        };
        events.push(state.emit(AgentEventKind::SessionStatus { status }));
        state.session_status_emitted = true;
    }
    if let Some(commands) = value.get("slash_commands").and_then(Value::as_array) {
        let commands = commands
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
        events.push(state.emit(AgentEventKind::AvailableCommands { commands }));
    }
    events
}

fn handle_assistant(state: &mut TurnState, value: &Value) -> Vec<AgentEvent> {
    // Subagent output is excluded from top-level accounting.
    if value.get("parent_tool_use_id").is_some_and(|v| !v.is_null()) {
        return Vec::new();
    }

    // Each line is a structurally distinct assistant message; commit
    // whatever the previous one left pending before tracking this one.
    state.commit_pending_uuid();
    if let Some(uuid) = value.get("uuid").and_then(Value::as_str) {
        state.pending_assistant_uuid = Some(uuid.to_string());
    }

    let mut events = Vec::new();
    let message = value.get("message");

    if let Some(model) = message.and_then(|m| m.get("model")).and_then(Value::as_str) {
        state.model_name.get_or_insert_with(|| model.to_string());
    }

    if let Some(content) = message
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
    {
        for block in content {
            let Some(block_type) = block.get("type").and_then(Value::as_str) else {
                continue;
            };
            match block_type {
                "text" => {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        state.streaming_text_sent_this_turn = true;
                        events.push(state.emit(AgentEventKind::MessageChunk {
                            text: text.to_string(),
                        }));
                    }
                }
                "thinking" => {
                    if let Some(text) = block.get("thinking").and_then(Value::as_str) {
                        events.push(state.emit(AgentEventKind::Reasoning {
                            text: text.to_string(),
                        }));
                    }
                }
                "tool_use" => {
                    if let Some(event) = handle_tool_use(state, block) {
                        events.push(event);
                    }
                }
                _ => {}
            }
        }
    }

    if let Some(usage) = message.and_then(|m| m.get("usage")) {
        events.push(state.emit(AgentEventKind::ContextWindow(context_window_from_usage(usage))));
    }

    events
}

fn handle_tool_use(state: &mut TurnState, block: &Value) -> Option<AgentEvent> {
    let tool_use_id = block.get("id").and_then(Value::as_str)?.to_string();
    let name = block.get("name").and_then(Value::as_str).unwrap_or("");
    let args = block.get("input").cloned().unwrap_or(Value::Null);
    let payload = normalize_call(name, &args);
    state.pending_tools.insert(tool_use_id.clone(), payload.clone());
    let title = title_for(name, &args);
    Some(state.emit(AgentEventKind::ToolCall {
        tool_call_id: tool_use_id,
        title,
        payload,
        status: ToolStatus::Running,
    }))
}

fn handle_user(state: &mut TurnState, value: &Value) -> Vec<AgentEvent> {
    // A replayed historical message on resume. Not re-acted upon, but its
    // uuid still advances `last_message_uuid` so a later `--resume-session-at`
    // picks up from here.
    if value.get("isReplay").and_then(Value::as_bool).unwrap_or(false) {
        if let Some(uuid) = value.get("uuid").and_then(Value::as_str) {
            state.last_message_uuid = Some(uuid.to_string());
        }
        return Vec::new();
    }

    let message = value.get("message");
    let content = message.and_then(|m| m.get("content"));

    // Plain string content is an echoed prompt or slash-command stdout; the
    // `result` message carries the text for the caller instead.
    if content.is_some_and(Value::is_string) {
        return Vec::new();
    }

    let mut events = Vec::new();
    // A `Task` tool result is held back from emission until the top-level
    // `tool_use_result` (if any) has had a chance to enrich it, so only one
    // `tool_update` is ever produced per tool_call_id.
    let mut pending_subagent: Option<(String, NormalizedPayload, bool)> = None;
    if let Some(blocks) = content.and_then(Value::as_array) {
        for block in blocks {
            if block.get("type").and_then(Value::as_str) != Some("tool_result") {
                continue;
            }
            let Some(tool_use_id) = block.get("tool_use_id").and_then(Value::as_str) else {
                continue;
            };
            let Some(payload) = state.pending_tools.remove(tool_use_id) else {
                continue;
            };
            let is_error = block.get("is_error").and_then(Value::as_bool).unwrap_or(false);
            if matches!(payload, NormalizedPayload::SubagentTask { .. }) {
                pending_subagent = Some((tool_use_id.to_string(), payload, is_error));
                continue;
            }
            let enriched = enrich_result(payload, block.get("content").unwrap_or(&Value::Null));
            events.push(state.emit(AgentEventKind::ToolUpdate {
                tool_call_id: tool_use_id.to_string(),
                payload: enriched,
                status: if is_error { ToolStatus::Error } else { ToolStatus::Complete },
            }));
        }
    }

    if let Some(tool_use_result) = value.get("tool_use_result") {
        events.extend(handle_tool_use_result(state, tool_use_result, &mut pending_subagent));
    }

    if let Some((tool_call_id, payload, is_error)) = pending_subagent {
        events.push(state.emit(AgentEventKind::ToolUpdate {
            tool_call_id,
            payload,
            status: if is_error { ToolStatus::Error } else { ToolStatus::Complete },
        }));
    }

    events
}

fn handle_tool_use_result(
    state: &mut TurnState,
    result: &Value,
    pending_subagent: &mut Option<(String, NormalizedPayload, bool)>,
) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    if let Some(new_todos) = result.get("newTodos").and_then(Value::as_array) {
        events.push(state.emit(AgentEventKind::Plan {
            entries: plan_entries_from_todos(new_todos),
        }));
    }

    if let Some((_, payload, _)) = pending_subagent.as_mut() {
        if let NormalizedPayload::SubagentTask {
            status,
            agent_id,
            duration_ms,
            total_tokens,
            tool_use_count,
            ..
        } = payload
        {
            if let Some(s) = result.get("status").and_then(Value::as_str) {
                *status = match s {
                    "completed" | "complete" => SubagentStatus::Complete,
                    "error" | "failed" => SubagentStatus::Error,
                    _ => SubagentStatus::Running,
                };
            }
            if let Some(id) = result.get("agentId").and_then(Value::as_str) {
                *agent_id = Some(id.to_string());
            }
            if let Some(ms) = result.get("durationMs").and_then(Value::as_u64) {
                *duration_ms = Some(ms);
            }
            if let Some(tokens) = result.get("totalTokens").and_then(Value::as_u64) {
                *total_tokens = Some(tokens);
            }
            if let Some(count) = result.get("toolUseCount").and_then(Value::as_u64) {
                *tool_use_count = Some(count);
            }
        }
    }

    events
}

fn plan_entries_from_todos(items: &[Value]) -> Vec<PlanEntry> {
    items
        .iter()
        .filter_map(|item| {
            let content = item.get("content").and_then(Value::as_str)?.to_string();
            let status = match item.get("status").and_then(Value::as_str) {
                Some("in_progress") => gateway_core::PlanStatus::InProgress,
                Some("completed") => gateway_core::PlanStatus::Completed,
                _ => gateway_core::PlanStatus::Pending,
            };
            Some(PlanEntry {
                content,
                status,
                priority: item.get("priority").and_then(Value::as_str).map(str::to_string),
            })
        })
        .collect()
}

fn todo_item_from_value(item: &Value) -> Option<TodoItem> {
    Some(TodoItem {
        id: item.get("id").and_then(Value::as_str)?.to_string(),
        description: item.get("content").and_then(Value::as_str)?.to_string(),
        status: match item.get("status").and_then(Value::as_str) {
            Some("in_progress") => TodoStatus::InProgress,
            Some("completed") => TodoStatus::Completed,
            _ => TodoStatus::Pending,
        },
        active_form: item.get("activeForm").and_then(Value::as_str).map(str::to_string),
    })
}

fn handle_rate_limit(state: &mut TurnState, value: &Value) -> Vec<AgentEvent> {
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("rate limited")
        .to_string();
    vec![state.emit(AgentEventKind::RateLimit { message })]
}

fn handle_result(state: &mut TurnState, value: &Value) -> Vec<AgentEvent> {
    let mut events = Vec::new();

    // The turn is over; whatever assistant message was still pending is
    // now the last one seen.
    state.commit_pending_uuid();

    // Auto-close anything still open at turn end.
    for (tool_call_id, payload) in state.pending_tools.drain().collect::<Vec<_>>() {
        events.push(AgentEvent::new(
            state.session_id.clone(),
            state.operation_id.clone(),
            AgentEventKind::ToolUpdate {
                tool_call_id,
                payload,
                status: ToolStatus::Complete,
            },
        ));
    }

    if let Some(usage) = value.get("model_usage") {
        if let Some(window) = main_model_context_window(usage, state.model_name.as_deref()) {
            events.push(state.emit(AgentEventKind::ContextWindow(window)));
        }
    }

    if !state.streaming_text_sent_this_turn {
        if let Some(text) = result_text(value) {
            events.push(state.emit(AgentEventKind::MessageChunk { text }));
        }
    }

    let is_error = value.get("is_error").and_then(Value::as_bool).unwrap_or(false);
    let data = CompleteData {
        cost_usd: value.get("cost_usd").and_then(Value::as_f64),
        duration_ms: value.get("duration_ms").and_then(Value::as_u64),
        num_turns: value.get("num_turns").and_then(Value::as_u64),
        input_tokens: value
            .get("usage")
            .and_then(|u| u.get("input_tokens"))
            .and_then(Value::as_u64),
        output_tokens: value
            .get("usage")
            .and_then(|u| u.get("output_tokens"))
            .and_then(Value::as_u64),
    };
    events.push(state.emit(AgentEventKind::Complete { data, is_error }));
    state.complete_sent = true;

    if is_error {
        let message = best_error_message(value);
        events.push(state.emit(AgentEventKind::Error { message }));
    }

    events
}

fn result_text(value: &Value) -> Option<String> {
    match value.get("result") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Object(map)) => map.get("text").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn best_error_message(value: &Value) -> String {
    if let Some(errors) = value.get("errors").and_then(Value::as_array) {
        let joined: Vec<&str> = errors.iter().filter_map(Value::as_str).collect();
        if !joined.is_empty() {
            return joined.join("; ");
        }
    }
    if let Some(text) = result_text(value) {
        return text;
    }
    "prompt failed".to_string()
}

fn main_model_context_window(model_usage: &Value, model_name: Option<&str>) -> Option<ContextWindow> {
    let model_name = model_name?;
    let entry = model_usage.get(model_name)?;
    Some(ContextWindow {
        tokens_used: entry.get("contextTokensUsed").and_then(Value::as_u64).unwrap_or(0),
        context_window: entry.get("contextWindow").and_then(Value::as_u64),
    })
}

fn context_window_from_usage(usage: &Value) -> ContextWindow {
    let field = |name: &str| usage.get(name).and_then(Value::as_u64).unwrap_or(0);
    let tokens_used = field("input_tokens")
        + field("output_tokens")
        + field("cache_creation_input_tokens")
        + field("cache_read_input_tokens");
    ContextWindow {
        tokens_used,
        context_window: None,
    }
}

/// Builds the `mutations[]` list for `Edit`/`Write`/`MultiEdit` tool-use
/// args. `Write` is a single `create`; `Edit` is a single `patch` with
/// `old`/`new` strings and a generated unified diff; `MultiEdit` carries
/// one `patch` mutation per entry in its `edits` array.
fn file_mutations(name: &str, args: &Value) -> Vec<FileMutation> {
    let get_str = |v: &Value, key: &str| v.get(key).and_then(Value::as_str).map(str::to_string);
    let path = get_str(args, "file_path").unwrap_or_default();
    match name {
        "Write" => {
            let content = get_str(args, "content").unwrap_or_default();
            vec![FileMutation {
                mutation_type: FileMutationType::Create,
                content: Some(content),
                old: None,
                new: None,
                diff: None,
            }]
        }
        "Edit" => {
            let old = get_str(args, "old_string").unwrap_or_default();
            let new = get_str(args, "new_string").unwrap_or_default();
            let diff = if old.is_empty() || new.is_empty() {
                String::new()
            } else {
                gateway_core::unified_diff(&path, &old, &new)
            };
            vec![FileMutation {
                mutation_type: FileMutationType::Patch,
                content: None,
                old: Some(old),
                new: Some(new),
                diff: Some(diff),
            }]
        }
        "MultiEdit" => args
            .get("edits")
            .and_then(Value::as_array)
            .map(|edits| {
                edits
                    .iter()
                    .map(|edit| {
                        let old = get_str(edit, "old_string").unwrap_or_default();
                        let new = get_str(edit, "new_string").unwrap_or_default();
                        let diff = if old.is_empty() || new.is_empty() {
                            String::new()
                        } else {
                            gateway_core::unified_diff(&path, &old, &new)
                        };
                        FileMutation {
                            mutation_type: FileMutationType::Patch,
                            content: None,
                            old: Some(old),
                            new: Some(new),
                            diff: Some(diff),
                        }
                    })
                    .collect()
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// Maps a stream-json tool-use `(name, args)` pair to a [`NormalizedPayload`]
/// variant. Alias sets cover each protocol's documented tool-name
/// vocabulary.
pub fn normalize_call(name: &str, args: &Value) -> NormalizedPayload {
    let get_str = |key: &str| args.get(key).and_then(Value::as_str).map(str::to_string);
    match name {
        "Bash" | "Shell" | "Execute" | "Run" => NormalizedPayload::ShellExec {
            command: get_str("command").unwrap_or_default(),
            workdir: get_str("workdir"),
            description: get_str("description"),
            timeout_ms: args.get("timeout").and_then(Value::as_u64),
            background: args.get("run_in_background").and_then(Value::as_bool).unwrap_or(false),
            output: None,
        },
        "Read" => NormalizedPayload::ReadFile {
            file_path: get_str("file_path").unwrap_or_default(),
            offset: args.get("offset").and_then(Value::as_u64),
            limit: args.get("limit").and_then(Value::as_u64),
            output: None,
        },
        "Edit" | "Write" | "MultiEdit" => NormalizedPayload::ModifyFile {
            file_path: get_str("file_path").unwrap_or_default(),
            mutations: file_mutations(name, args),
            output: None,
        },
        "Grep" | "Glob" => NormalizedPayload::CodeSearch {
            query: get_str("query"),
            pattern: get_str("pattern"),
            path: get_str("path"),
            glob: get_str("glob"),
            output: None,
        },
        "WebFetch" | "WebSearch" => NormalizedPayload::HttpRequest {
            url: get_str("url").unwrap_or_default(),
            method: "GET".to_string(),
            response: None,
            is_error: false,
        },
        "Task" => NormalizedPayload::SubagentTask {
            description: get_str("description"),
            prompt: get_str("prompt"),
            subagent_type: get_str("subagent_type"),
            status: SubagentStatus::Running,
            agent_id: None,
            duration_ms: None,
            total_tokens: None,
            tool_use_count: None,
        },
        "TodoWrite" => NormalizedPayload::ManageTodos {
            operation: gateway_core::ManageTodosOp::Write,
            items: args
                .get("todos")
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(todo_item_from_value).collect())
                .unwrap_or_default(),
        },
        other => NormalizedPayload::Generic {
            name: other.to_string(),
            args: args.clone(),
            output: None,
        },
    }
}

fn enrich_result(payload: NormalizedPayload, result: &Value) -> NormalizedPayload {
    let text = result_block_text(result);
    match payload {
        NormalizedPayload::ShellExec { output: _, command, workdir, description, timeout_ms, background, .. } => {
            let (stdout, exit_code) = text
                .as_deref()
                .map(gateway_core::strip_exit_code_suffix)
                .unwrap_or((String::new(), None));
            NormalizedPayload::ShellExec {
                command,
                workdir,
                description,
                timeout_ms,
                background,
                output: Some(ShellOutput {
                    stdout: Some(stdout),
                    stderr: None,
                    exit_code,
                }),
            }
        }
        NormalizedPayload::ReadFile { file_path, offset, limit, .. } => NormalizedPayload::ReadFile {
            file_path,
            offset,
            limit,
            output: Some(ReadFileOutput { content: text }),
        },
        NormalizedPayload::ModifyFile { file_path, mutations, .. } => {
            let is_error = result
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            NormalizedPayload::ModifyFile {
                file_path,
                mutations,
                output: Some(gateway_core::ModifyFileOutput {
                    applied: !is_error,
                    error: if is_error { text } else { None },
                }),
            }
        }
        other => other,
    }
}

fn result_block_text(result: &Value) -> Option<String> {
    match result {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items
            .iter()
            .find_map(|item| item.get("text").and_then(Value::as_str))
            .map(str::to_string),
        _ => None,
    }
}

fn title_for(name: &str, args: &Value) -> String {
    match name {
        "Bash" | "Shell" => args
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or(name)
            .to_string(),
        "Read" | "Edit" | "Write" => args
            .get("file_path")
            .and_then(Value::as_str)
            .unwrap_or(name)
            .to_string(),
        _ => name.to_string(),
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
    fn simple_qa_round_trip() {
        let mut state = fresh_state();

        let system = json!({"type": "system", "session_id": "s1", "subtype": "init"});
        let events = handle_message(&mut state, &system);
        assert!(matches!(events[0].kind, AgentEventKind::SessionStatus { status: gateway_core::SessionStatus::New }));
        assert_eq!(state.session_id.as_str(), "s1");

        let assistant = json!({
            "type": "assistant",
            "session_id": "s1",
            "message": {"model": "claude-x", "content": [{"type": "text", "text": "pong"}]}
        });
        let events = handle_message(&mut state, &assistant);
        assert!(matches!(&events[0].kind, AgentEventKind::MessageChunk { text } if text == "pong"));
        assert!(state.streaming_text_sent_this_turn);

        let result = json!({
            "type": "result",
            "session_id": "s1",
            "is_error": false,
            "num_turns": 1,
            "cost_usd": 0.001
        });
        let events = handle_message(&mut state, &result);
        assert!(matches!(events.last().unwrap().kind, AgentEventKind::Complete { is_error: false, .. }));
        assert!(state.complete_sent);
    }

    #[test]
    fn result_fallback_text_only_without_streamed_chunk() {
        let mut state = fresh_state();
        handle_message(&mut state, &json!({"type": "system", "session_id": "s1"}));

        let result = json!({
            "type": "result",
            "session_id": "s1",
            "result": {"text": "...help text..."}
        });
        let events = handle_message(&mut state, &result);
        assert!(events.iter().any(|e| matches!(&e.kind, AgentEventKind::MessageChunk { text } if text == "...help text...")));
    }

    #[test]
    fn streamed_text_suppresses_result_fallback() {
        let mut state = fresh_state();
        handle_message(&mut state, &json!({"type": "system", "session_id": "s1"}));
        handle_message(
            &mut state,
            &json!({"type": "assistant", "session_id": "s1", "message": {"content": [{"type": "text", "text": "hi"}]}}),
        );
        let result = json!({"type": "result", "session_id": "s1", "result": "hi"});
        let events = handle_message(&mut state, &result);
        assert!(!events.iter().any(|e| matches!(e.kind, AgentEventKind::MessageChunk { .. })));
    }

    #[test]
    fn tool_call_then_update_preserves_kind() {
        let mut state = fresh_state();
        let assistant = json!({
            "type": "assistant",
            "session_id": "s1",
            "message": {"content": [{"type": "tool_use", "id": "t1", "name": "Bash", "input": {"command": "ls"}}]}
        });
        let events = handle_message(&mut state, &assistant);
        let AgentEventKind::ToolCall { payload, .. } = &events[0].kind else {
            panic!("expected tool_call");
        };
        assert_eq!(payload.kind_name(), "shell_exec");

        let user = json!({
            "type": "user",
            "session_id": "s1",
            "message": {"content": [{"type": "tool_result", "tool_use_id": "t1", "content": "total 0\n<exited with exit code 0>", "is_error": false}]}
        });
        let events = handle_message(&mut state, &user);
        let AgentEventKind::ToolUpdate { payload, status, .. } = &events[0].kind else {
            panic!("expected tool_update");
        };
        assert_eq!(payload.kind_name(), "shell_exec");
        assert_eq!(*status, ToolStatus::Complete);
    }

    #[test]
    fn edit_tool_use_produces_patch_mutation_with_diff() {
        let payload = normalize_call(
            "Edit",
            &json!({"file_path": "a.rs", "old_string": "foo", "new_string": "bar"}),
        );
        let NormalizedPayload::ModifyFile { mutations, .. } = payload else {
            panic!("expected modify_file");
        };
        assert_eq!(mutations.len(), 1);
        assert_eq!(mutations[0].mutation_type, gateway_core::FileMutationType::Patch);
        let diff = mutations[0].diff.as_deref().unwrap();
        assert!(diff.contains("diff --git"));
        assert!(diff.contains("-foo"));
        assert!(diff.contains("+bar"));
    }

    #[test]
    fn write_tool_use_produces_create_mutation() {
        let payload = normalize_call("Write", &json!({"file_path": "a.rs", "content": "hello"}));
        let NormalizedPayload::ModifyFile { mutations, .. } = payload else {
            panic!("expected modify_file");
        };
        assert_eq!(mutations.len(), 1);
        assert_eq!(mutations[0].mutation_type, gateway_core::FileMutationType::Create);
        assert_eq!(mutations[0].content.as_deref(), Some("hello"));
    }

    #[test]
    fn user_replay_string_content_is_dropped() {
        let mut state = fresh_state();
        let events = handle_message(
            &mut state,
            &json!({"type": "user", "session_id": "s1", "message": {"content": "/help"}}),
        );
        assert!(events.is_empty());
    }

    #[test]
    fn pending_tools_auto_close_at_result() {
        let mut state = fresh_state();
        handle_message(
            &mut state,
            &json!({"type": "assistant", "session_id": "s1", "message": {"content": [{"type": "tool_use", "id": "t1", "name": "Bash", "input": {"command": "ls"}}]}}),
        );
        let events = handle_message(&mut state, &json!({"type": "result", "session_id": "s1", "is_error": false}));
        assert!(events.iter().any(|e| matches!(&e.kind, AgentEventKind::ToolUpdate { tool_call_id, status, .. } if tool_call_id == "t1" && *status == ToolStatus::Complete)));
    }

    #[test]
    fn is_error_result_emits_error_event_too() {
        let mut state = fresh_state();
        let events = handle_message(
            &mut state,
            &json!({"type": "result", "session_id": "s1", "is_error": true, "errors": ["boom"]}),
        );
        assert!(events.iter().any(|e| matches!(&e.kind, AgentEventKind::Error { message } if message == "boom")));
    }

    #[test]
    fn replayed_user_message_is_dropped_but_advances_last_message_uuid() {
        let mut state = fresh_state();
        let events = handle_message(
            &mut state,
            &json!({
                "type": "user",
                "session_id": "s1",
                "isReplay": true,
                "uuid": "u1",
                "message": {"content": [{"type": "text", "text": "earlier turn"}]}
            }),
        );
        assert!(events.is_empty());
        assert_eq!(state.last_message_uuid.as_deref(), Some("u1"));
    }

    #[test]
    fn assistant_uuid_commits_on_next_distinct_message_and_on_result() {
        let mut state = fresh_state();
        handle_message(
            &mut state,
            &json!({"type": "assistant", "session_id": "s1", "uuid": "a1", "message": {"content": [{"type": "text", "text": "first"}]}}),
        );
        assert!(state.last_message_uuid.is_none());

        handle_message(
            &mut state,
            &json!({"type": "assistant", "session_id": "s1", "uuid": "a2", "message": {"content": [{"type": "text", "text": "second"}]}}),
        );
        assert_eq!(state.last_message_uuid.as_deref(), Some("a1"));

        handle_message(&mut state, &json!({"type": "result", "session_id": "s1", "is_error": false}));
        assert_eq!(state.last_message_uuid.as_deref(), Some("a2"));
    }

    #[test]
    fn task_tool_use_result_enriches_subagent_payload_in_single_update() {
        let mut state = fresh_state();
        handle_message(
            &mut state,
            &json!({
                "type": "assistant",
                "session_id": "s1",
                "message": {"content": [{"type": "tool_use", "id": "t1", "name": "Task", "input": {"description": "run tests", "subagent_type": "tester"}}]}
            }),
        );

        let user = json!({
            "type": "user",
            "session_id": "s1",
            "message": {"content": [{"type": "tool_result", "tool_use_id": "t1", "content": "done", "is_error": false}]},
            "tool_use_result": {
                "status": "completed",
                "agentId": "ba2ed465",
                "durationMs": 4200,
                "totalTokens": 1500,
                "toolUseCount": 3
            }
        });
        let events = handle_message(&mut state, &user);
        assert_eq!(events.len(), 1);
        let AgentEventKind::ToolUpdate { tool_call_id, payload, status } = &events[0].kind else {
            panic!("expected tool_update");
        };
        assert_eq!(tool_call_id, "t1");
        assert_eq!(*status, ToolStatus::Complete);
        let NormalizedPayload::SubagentTask {
            status: subagent_status,
            agent_id,
            duration_ms,
            total_tokens,
            tool_use_count,
            ..
        } = payload
        else {
            panic!("expected subagent_task");
        };
        assert_eq!(*subagent_status, SubagentStatus::Complete);
        assert_eq!(agent_id.as_deref(), Some("ba2ed465"));
        assert_eq!(*duration_ms, Some(4200));
        assert_eq!(*total_tokens, Some(1500));
        assert_eq!(*tool_use_count, Some(3));
    }
}
