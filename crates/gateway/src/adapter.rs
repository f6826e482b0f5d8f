use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use gateway_core::{
    AdapterError, AgentAdapter, AgentInfo, Attachment, EventReceiver, GatewayConfig,
    McpServerConfig, PermissionHandler, SessionId,
};
use gateway_adapter_acp::AcpAdapter;
use gateway_adapter_amp::AmpAdapter;
use gateway_adapter_codex::CodexAdapter;
use gateway_adapter_copilot::{CopilotAdapter, CopilotProtocol};
use gateway_adapter_stream_json::StreamJsonAdapter;

use crate::protocol::AgentProtocol;

/// Ties every per-protocol adapter crate into one type so a caller can hold
/// `Box<dyn AgentAdapter>` without knowing which protocol a given session
/// speaks.
pub enum AnyAgentAdapter {
    StreamJson(StreamJsonAdapter),
    Codex(CodexAdapter),
    Amp(AmpAdapter),
    Acp(AcpAdapter),
    Copilot(CopilotAdapter),
}

/// Builds the adapter for `protocol` from a shared [`GatewayConfig`].
/// `Copilot`/`OpenCode` differ only in which [`CopilotProtocol`]
/// constructor the shared adapter type is given.
pub fn build_adapter(protocol: AgentProtocol, config: GatewayConfig) -> AnyAgentAdapter {
    match protocol {
        AgentProtocol::StreamJson => AnyAgentAdapter::StreamJson(StreamJsonAdapter::new(config)),
        AgentProtocol::Codex => AnyAgentAdapter::Codex(CodexAdapter::new(config)),
        AgentProtocol::Amp => AnyAgentAdapter::Amp(AmpAdapter::new(config)),
        AgentProtocol::Acp => AnyAgentAdapter::Acp(AcpAdapter::new(config)),
        AgentProtocol::Copilot => {
            AnyAgentAdapter::Copilot(CopilotAdapter::new(config, CopilotProtocol::copilot()))
        }
        AgentProtocol::OpenCode => {
            AnyAgentAdapter::Copilot(CopilotAdapter::new(config, CopilotProtocol::opencode()))
        }
    }
}

// Each adapter crate's `async fn` desugars to its own anonymous future type,
// so a plain `match` producing a future and `.await`-ing the match as a
// whole would not type-check across variants. `dispatch!` awaits inside
// each arm instead; `dispatch_sync!` is for the plain (non-async) methods.
macro_rules! dispatch {
    ($self:ident, $method:ident($($arg:expr),*)) => {
        match $self {
            AnyAgentAdapter::StreamJson(a) => a.$method($($arg),*).await,
            AnyAgentAdapter::Codex(a) => a.$method($($arg),*).await,
            AnyAgentAdapter::Amp(a) => a.$method($($arg),*).await,
            AnyAgentAdapter::Acp(a) => a.$method($($arg),*).await,
            AnyAgentAdapter::Copilot(a) => a.$method($($arg),*).await,
        }
    };
}

macro_rules! dispatch_sync {
    ($self:ident, $method:ident($($arg:expr),*)) => {
        match $self {
            AnyAgentAdapter::StreamJson(a) => a.$method($($arg),*),
            AnyAgentAdapter::Codex(a) => a.$method($($arg),*),
            AnyAgentAdapter::Amp(a) => a.$method($($arg),*),
            AnyAgentAdapter::Acp(a) => a.$method($($arg),*),
            AnyAgentAdapter::Copilot(a) => a.$method($($arg),*),
        }
    };
}

#[async_trait]
impl AgentAdapter for AnyAgentAdapter {
    fn prepare_environment(&self) -> BTreeMap<String, String> {
        dispatch_sync!(self, prepare_environment())
    }

    fn prepare_command_args(&self) -> Vec<String> {
        dispatch_sync!(self, prepare_command_args())
    }

    async fn connect(
        &self,
        stdin: Box<dyn tokio::io::AsyncWrite + Send + Unpin>,
        stdout: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
    ) -> Result<(), AdapterError> {
        dispatch!(self, connect(stdin, stdout))
    }

    async fn initialize(&self) -> Result<AgentInfo, AdapterError> {
        dispatch!(self, initialize())
    }

    async fn new_session(&self, mcp_servers: &[McpServerConfig]) -> Result<SessionId, AdapterError> {
        dispatch!(self, new_session(mcp_servers))
    }

    async fn load_session(&self, session_id: SessionId) -> Result<SessionId, AdapterError> {
        dispatch!(self, load_session(session_id))
    }

    async fn prompt(&self, message: &str, attachments: &[Attachment]) -> Result<(), AdapterError> {
        dispatch!(self, prompt(message, attachments))
    }

    async fn cancel(&self) -> Result<(), AdapterError> {
        dispatch!(self, cancel())
    }

    fn updates(&self) -> Option<EventReceiver> {
        dispatch_sync!(self, updates())
    }

    fn set_permission_handler(&self, handler: Option<Arc<dyn PermissionHandler>>) {
        dispatch_sync!(self, set_permission_handler(handler))
    }

    async fn close(&self) -> Result<(), AdapterError> {
        dispatch!(self, close())
    }

    fn requires_process_kill(&self) -> bool {
        dispatch_sync!(self, requires_process_kill())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copilot_and_opencode_both_build_the_copilot_variant() {
        let copilot = build_adapter(AgentProtocol::Copilot, GatewayConfig::default());
        let opencode = build_adapter(AgentProtocol::OpenCode, GatewayConfig::default());
        assert!(matches!(copilot, AnyAgentAdapter::Copilot(_)));
        assert!(matches!(opencode, AnyAgentAdapter::Copilot(_)));
    }

    #[test]
    fn requires_process_kill_is_true_only_for_copilot_and_opencode() {
        assert!(build_adapter(AgentProtocol::Copilot, GatewayConfig::default()).requires_process_kill());
        assert!(!build_adapter(AgentProtocol::StreamJson, GatewayConfig::default()).requires_process_kill());
        assert!(!build_adapter(AgentProtocol::Codex, GatewayConfig::default()).requires_process_kill());
        assert!(!build_adapter(AgentProtocol::Amp, GatewayConfig::default()).requires_process_kill());
        assert!(!build_adapter(AgentProtocol::Acp, GatewayConfig::default()).requires_process_kill());
    }
}
