use thiserror::Error;

/// Classification of an [`AdapterError`], matching the failure kinds every
/// adapter must distinguish between.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AdapterErrorKind {
    /// A single upstream message was malformed. Logged and skipped; the
    /// operation continues.
    ProtocolParse,
    /// A handshake or RPC call itself failed. Propagated from
    /// `initialize`/`new_session`/`load_session`/`prompt`.
    ProtocolError,
    /// The agent reported a business failure inside a result. Always
    /// surfaced via an `error` event *and* returned from `prompt`.
    AgentError,
    /// The calling context was cancelled or deadlined out.
    Timeout,
    /// A method was called out of lifecycle order (e.g. `prompt` before
    /// `initialize`).
    AdapterState,
    /// An event was dropped because the bounded channel was full. Warn-only;
    /// never returned to a caller, only logged.
    ChannelOverflow,
}

/// The error type returned by every fallible [`AgentAdapter`](crate::AgentAdapter) method.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("adapter not initialized")]
    NotInitialized,

    #[error("adapter already connected")]
    AlreadyConnected,

    #[error("operation cancelled")]
    Cancelled,

    #[error("timed out waiting for upstream agent")]
    Timeout,

    #[error("failed to parse upstream message: {0}")]
    ProtocolParse(String),

    #[error("protocol error during {context}: {message}")]
    ProtocolError { context: &'static str, message: String },

    #[error("agent reported an error: {0}")]
    AgentError(String),

    #[error("method called out of lifecycle order: {0}")]
    AdapterState(&'static str),

    #[error("loadSession is not supported by this agent")]
    LoadSessionUnsupported,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to encode/decode JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl AdapterError {
    pub fn kind(&self) -> AdapterErrorKind {
        match self {
            AdapterError::NotInitialized | AdapterError::AdapterState(_) => {
                AdapterErrorKind::AdapterState
            }
            AdapterError::AlreadyConnected => AdapterErrorKind::AdapterState,
            AdapterError::Cancelled | AdapterError::Timeout => AdapterErrorKind::Timeout,
            AdapterError::ProtocolParse(_) => AdapterErrorKind::ProtocolParse,
            AdapterError::ProtocolError { .. } | AdapterError::LoadSessionUnsupported => {
                AdapterErrorKind::ProtocolError
            }
            AdapterError::AgentError(_) => AdapterErrorKind::AgentError,
            AdapterError::Io(_) | AdapterError::Json(_) => AdapterErrorKind::ProtocolError,
        }
    }
}
