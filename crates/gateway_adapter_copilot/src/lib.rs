#![forbid(unsafe_code)]
//! Adapter for GitHub Copilot CLI's TCP wire protocol, and (via
//! [`protocol::CopilotProtocol::opencode`]) OpenCode's.
//!
//! Unlike the stdio-based adapters, the collaborator subprocess serves its
//! actual protocol over a TCP port it announces on stdout; `connect` scans
//! for that announcement before opening the real connection. Everything
//! past that point follows the same decoder-task shape as
//! `gateway_adapter_codex`.

mod adapter;
mod decode;
mod protocol;

pub use adapter::CopilotAdapter;
pub use decode::{enrich_result, handle_event, normalize_call, TurnState};
pub use protocol::{CopilotProtocol, EventNames};
