/// Adapter-construction parameters that make [`crate::adapter::CopilotAdapter`]
/// reusable for OpenCode: both speak the same TCP-server/port-discovery
/// shape, differing only in port-announcement string and event vocabulary.
/// Nothing in `adapter.rs`/`decode.rs` matches against a literal event
/// string directly; they all go through this table.
#[derive(Debug, Clone)]
pub struct CopilotProtocol {
    /// The prefix the CLI prints to stdout once its TCP server is up, e.g.
    /// `"listening on port "` for Copilot. The adapter reads the decimal
    /// digits that follow as the port.
    pub port_announcement_prefix: &'static str,
    pub events: EventNames,
}

/// The SDK's typed event-name vocabulary, made
/// data rather than match-arm literals so a second product's differently
/// spelled events can reuse the same dispatch code.
#[derive(Debug, Clone, Copy)]
pub struct EventNames {
    pub session_start: &'static str,
    pub session_resume: &'static str,
    pub session_abort: &'static str,
    pub turn_start: &'static str,
    pub turn_end: &'static str,
    pub message: &'static str,
    pub message_delta: &'static str,
    pub reasoning: &'static str,
    pub reasoning_delta: &'static str,
    pub tool_start: &'static str,
    pub tool_progress: &'static str,
    pub tool_complete: &'static str,
    pub session_idle: &'static str,
    pub session_error: &'static str,
    pub session_usage_info: &'static str,
    pub assistant_usage: &'static str,
}

impl CopilotProtocol {
    /// GitHub Copilot CLI's own vocabulary.
    pub fn copilot() -> Self {
        Self {
            port_announcement_prefix: "listening on port ",
            events: EventNames {
                session_start: "session.start",
                session_resume: "session.resume",
                session_abort: "session.abort",
                turn_start: "assistant.turn.start",
                turn_end: "assistant.turn.end",
                message: "assistant.message",
                message_delta: "assistant.message.delta",
                reasoning: "assistant.reasoning",
                reasoning_delta: "assistant.reasoning.delta",
                tool_start: "tool.start",
                tool_progress: "tool.progress",
                tool_complete: "tool.complete",
                session_idle: "session.idle",
                session_error: "session.error",
                session_usage_info: "session.usage_info",
                assistant_usage: "assistant.usage",
            },
        }
    }

    /// OpenCode's instantiation of the same TCP-server/port-discovery shape.
    /// OpenCode's CLI prints its own differently worded port banner; its
    /// event vocabulary otherwise mirrors Copilot's closely enough to reuse
    /// this same field-by-field table.
    pub fn opencode() -> Self {
        Self {
            port_announcement_prefix: "opencode server listening on port ",
            events: Self::copilot().events,
        }
    }
}
