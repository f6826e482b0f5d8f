#![forbid(unsafe_code)]
//! Adapter for Agent Client Protocol (ACP) agents.
//!
//! Strict JSON-RPC 2.0 over stdio: every request/response carries an
//! explicit `jsonrpc: "2.0"` field, unlike Codex's JSON-RPC variant. The
//! decoder task owns the wire and a pending-request correlator, the same
//! shape `gateway_adapter_codex` uses.

mod adapter;
mod decode;

pub use adapter::AcpAdapter;
pub use decode::{acp_option_kind, handle_session_update, TurnState};
