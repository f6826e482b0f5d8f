use std::collections::HashMap;

use gateway_core::{
    AgentEvent, AgentEventKind, CompleteData, ContextWindow, FileMutation, FileMutationType,
    NormalizedPayload, PlanEntry, ReadFileOutput, ShellOutput, SubagentStatus, TodoItem,
    TodoStatus, ToolStatus,
};
use serde_json::Value;
use tracing::{debug, warn};

use gateway_core::{OperationId, SessionId};

/// Per-operation decoder state for Amp's stream-json superset. One
/// instance lives for the duration of a single `prompt` call.
pub struct TurnState {
    pub session_id: SessionId,
    pub operation_id: OperationId,
    pending_tools: HashMap<String, NormalizedPayload>,
    streaming_text_sent_this_turn: bool,
    model_name: Option<String>,
    /// Guards against emitting `complete` twice: Amp signals turn end via
    /// assistant `stop_reason=end_turn` *and/or* a trailing `result` message,
    /// and this decoder must only act on the first of whichever arrives;
    /// `result` wins when both arrive.
    pub complete_sent: bool,
    /// Real Amp thread ids carry a `T-` prefix; a locally generated
    /// placeholder never does. The adapter's one-shot subprocess mode uses
    /// this to decide whether `ContinueArgs` is safe to use.
    pub has_amp_thread_id: bool,
}

impl TurnState {
    pub fn new(session_id: SessionId, operation_id: OperationId) -> Self {
        let has_amp_thread_id = session_id.as_str().starts_with("T-");
        Self {
            session_id,
            operation_id,
            pending_tools: HashMap::new(),
            streaming_text_sent_this_turn: false,
            model_name: None,
            complete_sent: false,
            has_amp_thread_id,
        }
    }

    pub fn begin_turn(&mut self, operation_id: OperationId) {
        self.operation_id = operation_id;
        self.streaming_text_sent_this_turn = false;
        self.complete_sent = false;
    }

    fn emit(&self, kind: AgentEventKind) -> AgentEvent {
        AgentEvent::new(self.session_id.clone(), self.operation_id.clone(), kind)
    }

    fn adopt_session_id(&mut self, sid: &str) {
        if sid != self.session_id.as_str() {
            debug!(old = %self.session_id, new = sid, "amp session id updated");
            self.session_id = SessionId::from_upstream(sid);
            self.has_amp_thread_id = sid.starts_with("T-");
        }
    }
}

/// Decodes one Amp stream-json line into zero or more normalized events.
/// Shares the Claude Code stream-json message vocabulary with two
/// behavioral differences this function implements directly: tool aliases
/// (`cmd` as well as `command`) and the `end_turn`/`result` completion
/// dedup via `complete_sent`.
pub fn handle_message(state: &mut TurnState, value: &Value) -> Vec<AgentEvent> {
    let Some(msg_type) = value.get("type").and_then(Value::as_str) else {
        warn!("amp message missing \"type\" field");
        return Vec::new();
    };

    if let Some(sid) = value.get("session_id").and_then(Value::as_str) {
        state.adopt_session_id(sid);
    }

    match msg_type {
        "system" => Vec::new(),
        "assistant" => handle_assistant(state, value),
        "user" => handle_user(state, value),
        "rate_limit" => handle_rate_limit(state, value),
        "result" => handle_result(state, value),
        other => {
            debug!(msg_type = other, "unrecognized amp message type, skipping");
            Vec::new()
        }
    }
}

fn handle_assistant(state: &mut TurnState, value: &Value) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    let message = value.get("message");

    if let Some(model) = message.and_then(|m| m.get("model")).and_then(Value::as_str) {
        state.model_name.get_or_insert_with(|| model.to_string());
    }

    if let Some(content) = message.and_then(|m| m.get("content")).and_then(Value::as_array) {
        for block in content {
            let Some(block_type) = block.get("type").and_then(Value::as_str) else {
                continue;
            };
            match block_type {
                "text" => {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        state.streaming_text_sent_this_turn = true;
                        events.push(state.emit(AgentEventKind::MessageChunk { text: text.to_string() }));
                    }
                }
                "thinking" => {
                    if let Some(text) = block.get("thinking").and_then(Value::as_str) {
                        events.push(state.emit(AgentEventKind::Reasoning { text: text.to_string() }));
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

    if message.and_then(|m| m.get("stop_reason")).and_then(Value::as_str) == Some("end_turn")
        && !state.complete_sent
    {
        events.push(state.emit(AgentEventKind::Complete {
            data: CompleteData::default(),
            is_error: false,
        }));
        state.complete_sent = true;
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
    let content = value.get("message").and_then(|m| m.get("content"));
    if content.is_some_and(Value::is_string) {
        return Vec::new();
    }

    let mut events = Vec::new();
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
            let enriched = enrich_result(payload, block.get("content").unwrap_or(&Value::Null));
            events.push(state.emit(AgentEventKind::ToolUpdate {
                tool_call_id: tool_use_id.to_string(),
                payload: enriched,
                status: if is_error { ToolStatus::Error } else { ToolStatus::Complete },
            }));
        }
    }
    events
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

    for (tool_call_id, payload) in state.pending_tools.drain().collect::<Vec<_>>() {
        events.push(AgentEvent::new(
            state.session_id.clone(),
            state.operation_id.clone(),
            AgentEventKind::ToolUpdate { tool_call_id, payload, status: ToolStatus::Complete },
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

    // `result` wins over a prior `end_turn`: if `end_turn` already emitted
    // `complete` for this turn, this message only contributes cleanup
    // (pending-tool closure, context window), never a second `complete`.
    if !state.complete_sent {
        let is_error = value.get("is_error").and_then(Value::as_bool).unwrap_or(false);
        let data = CompleteData {
            cost_usd: value.get("cost_usd").and_then(Value::as_f64),
            duration_ms: value.get("duration_ms").and_then(Value::as_u64),
            num_turns: value.get("num_turns").and_then(Value::as_u64),
            input_tokens: value.get("usage").and_then(|u| u.get("input_tokens")).and_then(Value::as_u64),
            output_tokens: value.get("usage").and_then(|u| u.get("output_tokens")).and_then(Value::as_u64),
        };
        events.push(state.emit(AgentEventKind::Complete { data, is_error }));
        state.complete_sent = true;
        if is_error {
            events.push(state.emit(AgentEventKind::Error { message: best_error_message(value) }));
        }
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
    result_text(value).unwrap_or_else(|| "prompt failed".to_string())
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
    ContextWindow { tokens_used, context_window: None }
}

fn bash_command(args: &Value) -> String {
    args.get("cmd")
        .or_else(|| args.get("command"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
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

/// Builds the `mutations[]` list for a file-modifying tool-use. `Write`/
/// `create_file` is a single `create`; the rest are a single `patch` with
/// `old`/`new` strings and a generated unified diff (`MultiEdit` folds its
/// `edits` array into one mutation per entry).
fn file_mutations(name: &str, path: &str, args: &Value) -> Vec<FileMutation> {
    let get_str = |v: &Value, key: &str| v.get(key).and_then(Value::as_str).map(str::to_string);
    let patch_from = |old: String, new: String| {
        let diff = if old.is_empty() || new.is_empty() {
            String::new()
        } else {
            gateway_core::unified_diff(path, &old, &new)
        };
        FileMutation {
            mutation_type: FileMutationType::Patch,
            content: None,
            old: Some(old),
            new: Some(new),
            diff: Some(diff),
        }
    };
    match name {
        "Write" | "create_file" => vec![FileMutation {
            mutation_type: FileMutationType::Create,
            content: Some(get_str(args, "content").unwrap_or_default()),
            old: None,
            new: None,
            diff: None,
        }],
        "Edit" | "edit_file" => vec![patch_from(
            get_str(args, "old_string").unwrap_or_default(),
            get_str(args, "new_string").unwrap_or_default(),
        )],
        "MultiEdit" => args
            .get("edits")
            .and_then(Value::as_array)
            .map(|edits| {
                edits
                    .iter()
                    .map(|edit| {
                        patch_from(
                            get_str(edit, "old_string").unwrap_or_default(),
                            get_str(edit, "new_string").unwrap_or_default(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// Maps an Amp tool-use `(name, args)` pair to a [`NormalizedPayload`]
/// variant. `Bash` carries its command
/// under `cmd` in Amp and `command` in Claude Code; both are tried.
pub fn normalize_call(name: &str, args: &Value) -> NormalizedPayload {
    let get_str = |key: &str| args.get(key).and_then(Value::as_str).map(str::to_string);
    match name {
        "Bash" | "Shell" | "Execute" | "Run" => NormalizedPayload::ShellExec {
            command: bash_command(args),
            workdir: get_str("workdir"),
            description: get_str("description"),
            timeout_ms: args.get("timeout").and_then(Value::as_u64),
            background: args.get("run_in_background").and_then(Value::as_bool).unwrap_or(false),
            output: None,
        },
        "Read" | "read_file" => NormalizedPayload::ReadFile {
            file_path: get_str("file_path").or_else(|| get_str("path")).unwrap_or_default(),
            offset: args.get("offset").and_then(Value::as_u64),
            limit: args.get("limit").and_then(Value::as_u64),
            output: None,
        },
        "Edit" | "Write" | "MultiEdit" | "edit_file" | "create_file" => {
            let file_path = get_str("file_path").or_else(|| get_str("path")).unwrap_or_default();
            NormalizedPayload::ModifyFile {
                mutations: file_mutations(name, &file_path, args),
                file_path,
                output: None,
            }
        }
        "Grep" | "Glob" | "grep" | "glob" | "codebase_search" => NormalizedPayload::CodeSearch {
            query: get_str("query"),
            pattern: get_str("pattern"),
            path: get_str("path"),
            glob: get_str("glob"),
            output: None,
        },
        "WebFetch" | "WebSearch" | "web_fetch" | "web_search" => NormalizedPayload::HttpRequest {
            url: get_str("url").unwrap_or_default(),
            method: "GET".to_string(),
            response: None,
            is_error: false,
        },
        "Task" | "task" => NormalizedPayload::SubagentTask {
            description: get_str("description"),
            prompt: get_str("prompt"),
            subagent_type: get_str("subagent_type"),
            status: SubagentStatus::Running,
            agent_id: None,
            duration_ms: None,
            total_tokens: None,
            tool_use_count: None,
        },
        "todo_write" | "TodoWrite" => NormalizedPayload::ManageTodos {
            operation: gateway_core::ManageTodosOp::Write,
            items: args
                .get("todos")
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(todo_item_from_value).collect())
                .unwrap_or_default(),
        },
        other => NormalizedPayload::Generic { name: other.to_string(), args: args.clone(), output: None },
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
        other => other,
    }
}

fn result_block_text(result: &Value) -> Option<String> {
    match result {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.iter().find_map(|item| item.get("text").and_then(Value::as_str)).map(str::to_string),
        _ => None,
    }
}

fn title_for(name: &str, args: &Value) -> String {
    match name {
        "Bash" | "Shell" => {
            let command = bash_command(args);
            if command.is_empty() { name.to_string() } else { command }
        }
        "Read" | "Edit" | "Write" => args
            .get("file_path")
            .or_else(|| args.get("path"))
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
    fn amp_thread_id_prefix_detected() {
        let state = TurnState::new(SessionId::from_upstream("T-abc123"), OperationId::new());
        assert!(state.has_amp_thread_id);
        let state = TurnState::new(SessionId::placeholder(), OperationId::new());
        assert!(!state.has_amp_thread_id);
    }

    #[test]
    fn bash_cmd_alias_normalizes_to_shell_exec() {
        let payload = normalize_call("Bash", &json!({"cmd": "ls -la"}));
        let NormalizedPayload::ShellExec { command, .. } = payload else { panic!("expected shell_exec") };
        assert_eq!(command, "ls -la");
    }

    #[test]
    fn edit_file_alias_produces_patch_mutation_with_diff() {
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
    fn end_turn_emits_complete_once() {
        let mut state = fresh_state();
        let assistant = json!({
            "type": "assistant",
            "session_id": "s1",
            "message": {"content": [{"type": "text", "text": "done"}], "stop_reason": "end_turn"}
        });
        let events = handle_message(&mut state, &assistant);
        assert!(events.iter().any(|e| matches!(e.kind, AgentEventKind::Complete { .. })));
        assert!(state.complete_sent);

        // A trailing `result` for the same turn must not emit a second `complete`.
        let result = json!({"type": "result", "session_id": "s1", "is_error": false});
        let events = handle_message(&mut state, &result);
        assert!(!events.iter().any(|e| matches!(e.kind, AgentEventKind::Complete { .. })));
    }

    #[test]
    fn result_wins_when_both_end_turn_and_result_would_fire_independently() {
        let mut state = fresh_state();
        let result = json!({"type": "result", "session_id": "s1", "is_error": false, "cost_usd": 0.02});
        let events = handle_message(&mut state, &result);
        let complete = events.iter().find(|e| matches!(e.kind, AgentEventKind::Complete { .. })).unwrap();
        let AgentEventKind::Complete { data, .. } = &complete.kind else { unreachable!() };
        assert_eq!(data.cost_usd, Some(0.02));
    }

    #[test]
    fn session_id_adoption_tracks_thread_prefix() {
        let mut state = fresh_state();
        handle_message(&mut state, &json!({"type": "system", "session_id": "T-xyz"}));
        assert!(state.has_amp_thread_id);
    }
}
