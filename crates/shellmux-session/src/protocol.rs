//! Messages exchanged between a controller and an interpreter peer.
//!
//! Control, status and introspection payloads are JSON. Output channels carry
//! raw bytes.

use serde::{Deserialize, Serialize};
use shellmux_mux::{Capacity, ChannelMode};

/// Protocol name carried in the hello.
pub const PROTOCOL_NAME: &str = "shellmux";
/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Controller → peer: interrupt, terminate, ping.
pub const CONTROL: &str = "control";
/// Peer → controller: hello, completions, acks, pongs, bye.
pub const STATUS: &str = "status";
/// Controller → peer: code to execute.
pub const STDIN: &str = "stdin";
pub const STDOUT: &str = "stdout";
pub const STDERR: &str = "stderr";
/// Controller requests, peer replies.
pub const INTROSPECT: &str = "introspect";

/// Every session channel with the mode the controller opens it in.
///
/// Control and status ride the priority lane so an interrupt or its ack
/// never waits behind queued code or output.
pub const CONTROLLER_CHANNELS: [(&str, ChannelMode, bool); 6] = [
    (CONTROL, ChannelMode::Publish, true),
    (STATUS, ChannelMode::Subscribe, true),
    (STDIN, ChannelMode::StreamOut, false),
    (STDOUT, ChannelMode::StreamIn, false),
    (STDERR, ChannelMode::StreamIn, false),
    (INTROSPECT, ChannelMode::Request, false),
];

/// Capacity for a session channel; `default` applies to the bounded ones.
pub(crate) fn capacity_for(priority: bool, default: usize) -> Capacity {
    if priority {
        Capacity::Unbounded
    } else {
        Capacity::Bounded(default)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Stop the running code and drop every queued execution with an id up
    /// to `through`. Later executions still run.
    Interrupt { through: u64 },
    Terminate,
    Ping { nonce: u64 },
}

/// The peer's handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub protocol: String,
    pub version: String,
    /// Interpreter identity, e.g. "python 3.12.1".
    pub interpreter: String,
    #[serde(default)]
    pub info: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusMessage {
    Hello(Hello),
    /// Execution `exec` finished. The sequence numbers are the last ones the
    /// peer published on stdout and stderr for it (0 when nothing was written).
    ExecuteComplete {
        exec: u64,
        stdout_seq: u64,
        stderr_seq: u64,
    },
    /// The interrupt covering executions up to `through` took effect. The
    /// sequence numbers close the output of the interrupted executions.
    InterruptAck {
        through: u64,
        stdout_seq: u64,
        stderr_seq: u64,
    },
    Pong {
        nonce: u64,
    },
    /// The peer is about to disconnect on purpose.
    Bye,
}

/// Code submitted on the stdin channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub id: u64,
    pub code: String,
}

/// Completion, call-tip or inspection query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntrospectRequest {
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntrospectReply {
    Ok(serde_json::Value),
    Error(String),
}

/// Check a peer's hello against the controller's protocol version.
///
/// The peer must speak the same protocol and major version, with a minor
/// version at least the controller's.
pub fn check_hello(hello: &Hello, controller_version: &str) -> Result<(), String> {
    if hello.protocol != PROTOCOL_NAME {
        return Err(format!(
            "unexpected protocol '{}' (expected '{PROTOCOL_NAME}')",
            hello.protocol
        ));
    }
    if hello.interpreter.is_empty() {
        return Err("empty interpreter identity".to_string());
    }
    if !is_version_compatible(&hello.version, controller_version)? {
        return Err(format!(
            "incompatible version '{}' (controller '{}')",
            hello.version, controller_version
        ));
    }
    Ok(())
}

pub fn is_version_compatible(peer_version: &str, controller_version: &str) -> Result<bool, String> {
    let (peer_major, peer_minor) = parse_version(peer_version)?;
    let (ctl_major, ctl_minor) = parse_version(controller_version)?;

    Ok(peer_major == ctl_major && peer_minor >= ctl_minor)
}

pub fn parse_version(version: &str) -> Result<(u16, u16), String> {
    let mut parts = version.split('.');

    let major = parts
        .next()
        .ok_or_else(|| format!("invalid version '{version}': missing major"))?;
    let minor = parts
        .next()
        .ok_or_else(|| format!("invalid version '{version}': missing minor"))?;

    if parts.next().is_some() {
        return Err(format!(
            "invalid version '{version}': expected '<major>.<minor>'"
        ));
    }

    let major = major
        .parse::<u16>()
        .map_err(|_| format!("invalid version '{version}': non-numeric major"))?;
    let minor = minor
        .parse::<u16>()
        .map_err(|_| format!("invalid version '{version}': non-numeric minor"))?;

    Ok((major, minor))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello(version: &str) -> Hello {
        Hello {
            protocol: PROTOCOL_NAME.into(),
            version: version.into(),
            interpreter: "echo 0.1".into(),
            info: serde_json::Value::Null,
        }
    }

    #[test]
    fn control_wire_format() {
        let json = serde_json::to_string(&ControlMessage::Ping { nonce: 9 }).unwrap();
        assert_eq!(json, r#"{"type":"ping","nonce":9}"#);
        let json = serde_json::to_string(&ControlMessage::Interrupt { through: 4 }).unwrap();
        assert_eq!(json, r#"{"type":"interrupt","through":4}"#);
    }

    #[test]
    fn status_wire_format() {
        let json = serde_json::to_value(StatusMessage::ExecuteComplete {
            exec: 3,
            stdout_seq: 10,
            stderr_seq: 0,
        })
        .unwrap();
        assert_eq!(json["type"], "execute_complete");
        assert_eq!(json["stdout_seq"], 10);

        let json = serde_json::to_value(StatusMessage::InterruptAck {
            through: 2,
            stdout_seq: 5,
            stderr_seq: 1,
        })
        .unwrap();
        assert_eq!(json["type"], "interrupt_ack");
        assert_eq!(json["through"], 2);
        assert_eq!(json["stderr_seq"], 1);

        let parsed: StatusMessage = serde_json::from_str(
            r#"{"type":"hello","protocol":"shellmux","version":"1.0","interpreter":"py"}"#,
        )
        .unwrap();
        match parsed {
            StatusMessage::Hello(h) => {
                assert_eq!(h.interpreter, "py");
                assert!(h.info.is_null());
            }
            other => panic!("expected hello, got {other:?}"),
        }
    }

    #[test]
    fn introspect_reply_wire_format() {
        let ok = serde_json::to_string(&IntrospectReply::Ok(serde_json::json!(["a", "b"]))).unwrap();
        assert_eq!(ok, r#"{"ok":["a","b"]}"#);
        let err: IntrospectReply = serde_json::from_str(r#"{"error":"no such name"}"#).unwrap();
        assert_eq!(err, IntrospectReply::Error("no such name".into()));
    }

    #[test]
    fn version_compatibility() {
        assert!(check_hello(&hello("1.0"), "1.0").is_ok());
        assert!(check_hello(&hello("1.3"), "1.0").is_ok());
        assert!(check_hello(&hello("1.0"), "1.2").is_err());
        assert!(check_hello(&hello("2.0"), "1.0").is_err());
        assert!(check_hello(&hello("one"), "1.0").is_err());
        assert!(check_hello(&hello("1.0.0"), "1.0").is_err());
    }

    #[test]
    fn wrong_protocol_rejected() {
        let mut h = hello("1.0");
        h.protocol = "jupyter".into();
        let err = check_hello(&h, "1.0").unwrap_err();
        assert!(err.contains("jupyter"));
    }

    #[test]
    fn controller_channel_modes_have_peers() {
        for (_, mode, _) in CONTROLLER_CHANNELS {
            assert_ne!(mode.peer_mode(), mode);
        }
    }
}
