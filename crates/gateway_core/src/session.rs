use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A session identifier.
///
/// Before the upstream agent issues its own id (ACP/Codex during handshake,
/// stream-json/Amp on first message, Copilot via its SDK), adapters hold a
/// locally generated placeholder so callers always have something to key on.
/// The identifier may be rewritten once the upstream agent returns its
/// canonical id, and — for protocols that rotate ids mid-stream (stream-json,
/// Amp compaction) — again after that. `SessionId` intentionally does not
/// enforce the "once" part of that rule; that bookkeeping lives in each
/// adapter's actor state, since only it knows whether a given update is the
/// first canonical assignment or a later rotation.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Generates a locally-unique placeholder id, used until the upstream
    /// agent issues its own.
    pub fn placeholder() -> Self {
        Self(format!("pending-{}", Uuid::new_v4()))
    }

    /// Wraps an id issued by the upstream agent verbatim.
    pub fn from_upstream(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True while this id is still the locally generated placeholder and has
    /// not yet been rewritten with an upstream-issued id.
    pub fn is_placeholder(&self) -> bool {
        self.0.starts_with("pending-")
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One `Prompt` invocation's identifier, generated by the adapter.
///
/// Exactly one operation is active per session at a time; adapters do not
/// enforce this against misbehaving callers (a second prompt before the
/// first completes is undefined and must not be called by consumers) but
/// the id still lets every event name which turn produced it.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct OperationId(String);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// ACP has no explicit operation/turn id in its wire protocol; adapters
    /// for it report an empty operation id rather than fabricate one.
    pub fn empty() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_is_recognizable_and_distinct() {
        let a = SessionId::placeholder();
        let b = SessionId::placeholder();
        assert!(a.is_placeholder());
        assert_ne!(a, b);
    }

    #[test]
    fn upstream_id_is_not_a_placeholder() {
        let id = SessionId::from_upstream("s1");
        assert!(!id.is_placeholder());
        assert_eq!(id.as_str(), "s1");
    }

    #[test]
    fn acp_operation_id_is_empty() {
        let id = OperationId::empty();
        assert!(id.is_empty());
        assert_eq!(id.as_str(), "");
    }
}
