use std::collections::BTreeMap;

use crate::channel::EventReceiver;
use crate::error::AdapterError;
use crate::permission::PermissionHandler;
use crate::session::SessionId;

/// Populated by `initialize` once the upstream handshake completes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentInfo {
    pub name: String,
    pub version: String,
}

/// One attachment accompanying a `prompt` call (e.g. stream-json image
/// attachments written under `.kandev/temp/images/`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// The uniform capability set every protocol adapter exposes.
///
/// Methods are invoked in the fixed lifecycle order documented on each one;
/// callers must not invoke `prompt` concurrently with another in-flight
/// `prompt` on the same adapter: exactly one operation is active per
/// session at any time.
#[async_trait::async_trait]
pub trait AgentAdapter: Send + Sync {
    /// Environment-variable overrides to apply before the collaborator
    /// subprocess starts (e.g. a server auth token). Pure, no I/O.
    fn prepare_environment(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Extra CLI arguments the collaborator subprocess should be launched
    /// with (e.g. stream-json's `--mcp-config`, Amp's continue-thread args).
    fn prepare_command_args(&self) -> Vec<String> {
        Vec::new()
    }

    /// Wires the adapter to its transport. Fails with
    /// [`AdapterError::AlreadyConnected`] if called twice. One-shot adapters
    /// (Amp) may no-op here and connect lazily inside `prompt`.
    async fn connect(
        &self,
        stdin: Box<dyn tokio::io::AsyncWrite + Send + Unpin>,
        stdout: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
    ) -> Result<(), AdapterError>;

    /// Performs the protocol handshake. Blocks until it completes or the
    /// adapter is closed.
    async fn initialize(&self) -> Result<AgentInfo, AdapterError>;

    /// Starts a brand new session, optionally announcing MCP servers to the
    /// upstream agent. Returns the canonical (possibly still placeholder)
    /// session id.
    async fn new_session(&self, mcp_servers: &[crate::config::McpServerConfig]) -> Result<SessionId, AdapterError>;

    /// Resumes a previously issued session id. Adapters that cannot resume
    /// (none currently modeled as unsupported, but kept for forward
    /// compatibility) return [`AdapterError::LoadSessionUnsupported`].
    async fn load_session(&self, session_id: SessionId) -> Result<SessionId, AdapterError>;

    /// Sends one prompt and blocks until the operation completes. Emits
    /// events on the channel returned by [`AgentAdapter::updates`] for the
    /// duration of the call.
    async fn prompt(&self, message: &str, attachments: &[Attachment]) -> Result<(), AdapterError>;

    /// Requests that the in-flight operation be interrupted. No-op if none
    /// is in flight.
    async fn cancel(&self) -> Result<(), AdapterError>;

    /// Hands back the adapter's event receiver. Adapters only ever expose
    /// this once; a second call returns `None`.
    fn updates(&self) -> Option<EventReceiver>;

    /// Registers the callback used to arbitrate permission requests. `None`
    /// falls back to each adapter's no-handler policy.
    fn set_permission_handler(&self, handler: Option<std::sync::Arc<dyn PermissionHandler>>);

    /// Idempotent teardown: cancels the adapter's internal context, stops
    /// its decoder task, and closes the event channel.
    async fn close(&self) -> Result<(), AdapterError>;

    /// Whether the collaborator subprocess must be explicitly killed
    /// (`true`: Copilot, OpenCode) rather than exiting when stdin closes
    /// (`false`: stream-json, Codex, Amp, ACP).
    fn requires_process_kill(&self) -> bool;
}
