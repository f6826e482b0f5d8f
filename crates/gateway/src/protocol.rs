/// Which upstream wire protocol an [`crate::AnyAgentAdapter`] should speak.
///
/// `Copilot` and `OpenCode` both construct a `gateway_adapter_copilot`
/// adapter, parameterized by `gateway_adapter_copilot::CopilotProtocol`'s
/// `copilot()`/`opencode()` constructors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentProtocol {
    StreamJson,
    Codex,
    Amp,
    Acp,
    Copilot,
    OpenCode,
}

impl AgentProtocol {
    /// Whether the collaborator subprocess must be killed explicitly rather
    /// than exiting when stdin closes.
    pub fn requires_process_kill(&self) -> bool {
        matches!(self, AgentProtocol::Copilot | AgentProtocol::OpenCode)
    }
}
