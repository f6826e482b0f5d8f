#![forbid(unsafe_code)]
//! Protocol-agnostic core of the agent-control gateway.
//!
//! This crate holds the pieces every per-protocol adapter shares: the normalized
//! [`AgentEvent`] stream, the [`NormalizedPayload`] tagged union tool calls are
//! translated into, the [`AgentAdapter`] lifecycle contract, permission
//! arbitration plumbing, and the session/operation identifiers that tie it all
//! together. It does not speak any wire protocol itself — see
//! `gateway_adapter_stream_json`, `gateway_adapter_codex`, `gateway_adapter_amp`,
//! `gateway_adapter_acp`, and `gateway_adapter_copilot` for those.

mod adapter;
mod channel;
mod config;
mod error;
mod event;
mod normalizer;
mod payload;
mod permission;
mod session;
pub mod transport;

pub use adapter::{AgentAdapter, AgentInfo, Attachment};
pub use channel::{event_channel, event_channel_with_capacity, EventReceiver, EventSender};
pub use config::{
    ApprovalPolicy, GatewayConfig, GatewayConfigBuilder, McpServerConfig, McpTransportConfig,
    OneShotConfig, PermissionPolicy,
};
pub use error::{AdapterError, AdapterErrorKind};
pub use event::{
    AgentEvent, AgentEventKind, CompleteData, ContextWindow, PlanEntry, PlanStatus, SessionStatus,
    ToolStatus,
};
pub use normalizer::{detect_language, strip_exit_code_suffix, unified_diff, ToolNormalizer};
pub use payload::{
    ActionType, CodeSearchOutput, FileMutation, FileMutationType, HttpOutput, ManageTodosOp,
    ModifyFileOutput, NormalizedPayload, ReadFileOutput, ShellOutput, SubagentStatus, TodoItem,
    TodoStatus,
};
pub use permission::{
    ArbitrationOutcome, NoHandlerPolicy, OptionKind, PermissionArbiter, PermissionHandler,
    PermissionOption, PermissionRequest, PermissionResponse,
};
pub use session::{OperationId, SessionId};
