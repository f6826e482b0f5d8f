//! Adapter for Sourcegraph Amp's one-shot subprocess wire protocol.
//!
//! Unlike the other adapters, `prompt` spawns a fresh subprocess per call
//! instead of driving one long-lived connection; the stream-json-shaped
//! output of each invocation is decoded the same way as the Claude Code
//! adapter, with Amp's own tool-name aliasing on top.

mod adapter;
mod decode;

pub use adapter::AmpAdapter;
pub use decode::{handle_message, normalize_call, TurnState};
