use std::fmt;

use bytes::Bytes;

/// Registry-assigned session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shell-{}", self.0)
    }
}

/// Lifecycle state of a shell session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Starting,
    Ready,
    Busy,
    Interrupting,
    Terminated,
    Crashed,
}

impl SessionStatus {
    /// Crashed and terminated sessions never come back on their own.
    pub fn is_dead(self) -> bool {
        matches!(self, SessionStatus::Terminated | SessionStatus::Crashed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Ready => "ready",
            SessionStatus::Busy => "busy",
            SessionStatus::Interrupting => "interrupting",
            SessionStatus::Terminated => "terminated",
            SessionStatus::Crashed => "crashed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    Stdout,
    Stderr,
}

/// A chunk of interpreter output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEvent {
    pub source: OutputSource,
    pub data: Bytes,
}

/// Notification for the UI collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub session: SessionId,
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEventKind {
    StatusChanged {
        status: SessionStatus,
        reason: Option<String>,
    },
    /// The peer completed its handshake.
    Identified {
        interpreter: String,
        info: serde_json::Value,
    },
    /// Output that arrived while no execution was active.
    Output(OutputEvent),
    Introspected {
        method: String,
        reply: serde_json::Value,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_display() {
        assert_eq!(SessionId(4).to_string(), "shell-4");
    }

    #[test]
    fn dead_states() {
        assert!(SessionStatus::Crashed.is_dead());
        assert!(SessionStatus::Terminated.is_dead());
        assert!(!SessionStatus::Interrupting.is_dead());
        assert_eq!(SessionStatus::Busy.to_string(), "busy");
    }
}
