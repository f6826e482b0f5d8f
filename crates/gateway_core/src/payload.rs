use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The canonical, protocol-agnostic representation of a tool invocation.
///
/// The variant chosen when the `tool_call` event is built is immutable for
/// the lifetime of that tool use: the matching `tool_update` only ever fills
/// in the `output`/result-shaped fields of the *same* variant. Each
/// per-protocol normalizer (`gateway_core::ToolNormalizer`) is responsible
/// for picking the right variant from that protocol's tool-name/argument
/// vocabulary; this type itself carries no protocol-specific knowledge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NormalizedPayload {
    ShellExec {
        command: String,
        workdir: Option<String>,
        description: Option<String>,
        timeout_ms: Option<u64>,
        background: bool,
        output: Option<ShellOutput>,
    },
    ReadFile {
        file_path: String,
        offset: Option<u64>,
        limit: Option<u64>,
        output: Option<ReadFileOutput>,
    },
    ModifyFile {
        file_path: String,
        mutations: Vec<FileMutation>,
        output: Option<ModifyFileOutput>,
    },
    CodeSearch {
        query: Option<String>,
        pattern: Option<String>,
        path: Option<String>,
        glob: Option<String>,
        output: Option<CodeSearchOutput>,
    },
    HttpRequest {
        url: String,
        method: String,
        response: Option<HttpOutput>,
        is_error: bool,
    },
    SubagentTask {
        description: Option<String>,
        prompt: Option<String>,
        subagent_type: Option<String>,
        status: SubagentStatus,
        agent_id: Option<String>,
        duration_ms: Option<u64>,
        total_tokens: Option<u64>,
        tool_use_count: Option<u64>,
    },
    CreateTask {
        title: String,
        description: Option<String>,
    },
    ManageTodos {
        operation: ManageTodosOp,
        items: Vec<TodoItem>,
    },
    Generic {
        name: String,
        args: Value,
        output: Option<Value>,
    },
}

impl NormalizedPayload {
    /// Stable discriminant string, used for logging and for asserting the
    /// "kind never changes on enrichment" invariant in tests.
    pub fn kind_name(&self) -> &'static str {
        match self {
            NormalizedPayload::ShellExec { .. } => "shell_exec",
            NormalizedPayload::ReadFile { .. } => "read_file",
            NormalizedPayload::ModifyFile { .. } => "modify_file",
            NormalizedPayload::CodeSearch { .. } => "code_search",
            NormalizedPayload::HttpRequest { .. } => "http_request",
            NormalizedPayload::SubagentTask { .. } => "subagent_task",
            NormalizedPayload::CreateTask { .. } => "create_task",
            NormalizedPayload::ManageTodos { .. } => "manage_todos",
            NormalizedPayload::Generic { .. } => "generic",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ShellOutput {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ReadFileOutput {
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileMutationType {
    Create,
    Patch,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileMutation {
    #[serde(rename = "type")]
    pub mutation_type: FileMutationType,
    pub content: Option<String>,
    pub old: Option<String>,
    pub new: Option<String>,
    pub diff: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ModifyFileOutput {
    pub applied: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CodeSearchOutput {
    pub files: Vec<String>,
    pub file_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HttpOutput {
    pub status: Option<u16>,
    pub body: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubagentStatus {
    #[default]
    Running,
    Complete,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ManageTodosOp {
    Write,
    Update,
    List,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TodoItem {
    pub id: String,
    pub description: String,
    pub status: TodoStatus,
    pub active_form: Option<String>,
}

/// `action_type` classification carried on a [`crate::PermissionRequest`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Command,
    FileRead,
    FileWrite,
    Network,
    Other,
}

impl ActionType {
    /// Best-effort classification from a [`NormalizedPayload`], used by
    /// adapters that must synthesize a `PermissionRequest.action_type` from
    /// the payload they already built for the same tool call.
    pub fn from_payload(payload: &NormalizedPayload) -> Self {
        match payload {
            NormalizedPayload::ShellExec { .. } => ActionType::Command,
            NormalizedPayload::ReadFile { .. } | NormalizedPayload::CodeSearch { .. } => {
                ActionType::FileRead
            }
            NormalizedPayload::ModifyFile { .. } => ActionType::FileWrite,
            NormalizedPayload::HttpRequest { .. } => ActionType::Network,
            _ => ActionType::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_name_is_stable_across_enrichment() {
        let mut payload = NormalizedPayload::ShellExec {
            command: "ls".into(),
            workdir: None,
            description: None,
            timeout_ms: None,
            background: false,
            output: None,
        };
        let kind_before = payload.kind_name();
        if let NormalizedPayload::ShellExec { output, .. } = &mut payload {
            *output = Some(ShellOutput {
                stdout: Some("a\nb\n".into()),
                stderr: None,
                exit_code: Some(0),
            });
        }
        assert_eq!(kind_before, payload.kind_name());
        assert_eq!(payload.kind_name(), "shell_exec");
    }

    #[test]
    fn action_type_classifies_shell_as_command() {
        let payload = NormalizedPayload::ShellExec {
            command: "rm -rf /tmp/x".into(),
            workdir: None,
            description: None,
            timeout_ms: None,
            background: false,
            output: None,
        };
        assert_eq!(ActionType::from_payload(&payload), ActionType::Command);
    }
}
