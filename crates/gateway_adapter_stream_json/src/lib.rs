#![forbid(unsafe_code)]
//! Adapter for Claude Code's `stream-json` wire protocol.
//!
//! The collaborator subprocess is driven over stdin/stdout as newline-
//! delimited JSON: `user`/`assistant`/`system`/`result`/`rate_limit`
//! messages flow one way, `control_request`/`control_response`/
//! `control_cancel_request` pairs carry the permission dialog and hook
//! configuration the other.

mod adapter;
mod decode;

pub use adapter::StreamJsonAdapter;
pub use decode::{handle_message, normalize_call, TurnState};
