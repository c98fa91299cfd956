use std::time::Duration;

use crate::events::SessionId;

/// Errors from shell sessions and the registry.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session has crashed or terminated; nothing was sent.
    #[error("{0} is dead")]
    SessionDead(SessionId),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The interpreter process could not be started or never connected.
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// The peer's hello was missing, malformed or incompatible.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The peer answered an introspection request with an error.
    #[error("introspection failed: {0}")]
    Introspection(String),

    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    #[error("multiplexer error: {0}")]
    Mux(#[from] shellmux_mux::MuxError),

    #[error("transport error: {0}")]
    Transport(#[from] shellmux_transport::TransportError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
