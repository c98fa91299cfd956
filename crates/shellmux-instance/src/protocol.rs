//! JSON messages on the rendezvous socket. One frame each way per connection.

use serde::{Deserialize, Serialize};

/// First (and only) frame a client sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Answered with a [`Greeting`].
    Probe,
    /// Answered with an empty frame when `reply_expected`.
    Forward(ForwardedCommand),
}

/// A launch's command line, handed to the running instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedCommand {
    pub argv: Vec<String>,
    /// Working directory of the launch, so relative paths resolve.
    pub cwd: String,
    #[serde(default = "reply_expected_default")]
    pub reply_expected: bool,
}

fn reply_expected_default() -> bool {
    true
}

impl ForwardedCommand {
    /// `argv` with the caller's working directory.
    pub fn from_here(argv: Vec<String>) -> Self {
        let cwd = std::env::current_dir()
            .map(|dir| dir.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            argv,
            cwd,
            reply_expected: true,
        }
    }
}

/// The server's reply to a probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeting {
    pub app: String,
    pub pid: u32,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_wire_format() {
        let message = ClientMessage::Forward(ForwardedCommand {
            argv: vec!["file.txt".into()],
            cwd: "/home/me".into(),
            reply_expected: true,
        });
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "forward",
                "argv": ["file.txt"],
                "cwd": "/home/me",
                "reply_expected": true,
            })
        );
    }

    #[test]
    fn reply_expected_defaults_to_true() {
        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type":"forward","argv":[],"cwd":"/"}"#).unwrap();
        match parsed {
            ClientMessage::Forward(cmd) => assert!(cmd.reply_expected),
            other => panic!("expected forward, got {other:?}"),
        }
    }

    #[test]
    fn probe_wire_format() {
        assert_eq!(
            serde_json::to_string(&ClientMessage::Probe).unwrap(),
            r#"{"type":"probe"}"#
        );
    }
}
