use std::fmt;
use std::io;

use shellmux::frame::FrameError;
use shellmux::instance::InstanceError;
use shellmux::session::SessionError;
use shellmux::transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
/// Another instance holds the rendezvous lock.
pub const ALREADY_RUNNING: i32 = 10;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::PermissionDenied => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    if err.is_timeout() {
        return CliError::new(TIMEOUT, format!("{context}: {err}"));
    }
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::PayloadTooLarge { .. } | FrameError::InvalidMagic => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        FrameError::ConnectionClosed => CliError::new(FAILURE, format!("{context}: {err}")),
    }
}

pub fn instance_error(context: &str, err: InstanceError) -> CliError {
    match err {
        InstanceError::AlreadyRunning { .. } => {
            CliError::new(ALREADY_RUNNING, format!("{context}: {err}"))
        }
        InstanceError::NotRunning(_) => CliError::new(FAILURE, format!("{context}: {err}")),
        InstanceError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        InstanceError::Protocol(_) | InstanceError::Json(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        InstanceError::Transport(err) => transport_error(context, err),
        InstanceError::Frame(err) => frame_error(context, err),
        InstanceError::Io(err) => io_error(context, err),
    }
}

pub fn session_error(context: &str, err: SessionError) -> CliError {
    match err {
        SessionError::Timeout { .. } => CliError::new(TIMEOUT, format!("{context}: {err}")),
        SessionError::Spawn(_) | SessionError::SessionDead(_) | SessionError::UnknownSession(_) => {
            CliError::new(FAILURE, format!("{context}: {err}"))
        }
        SessionError::Handshake(_) | SessionError::Json(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        SessionError::Transport(err) => transport_error(context, err),
        SessionError::Io(err) => io_error(context, err),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn controller_error(context: &str, err: shellmux::Error) -> CliError {
    match err {
        shellmux::Error::Session(err) => session_error(context, err),
        shellmux::Error::Instance(err) => instance_error(context, err),
        shellmux::Error::NoSession => CliError::new(FAILURE, format!("{context}: {err}")),
        shellmux::Error::ControllerStopped => CliError::new(INTERNAL, format!("{context}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;

    #[test]
    fn already_running_has_its_own_code() {
        let err = instance_error(
            "bind",
            InstanceError::AlreadyRunning {
                rendezvous: PathBuf::from("/tmp/app.sock"),
                pid: Some(42),
            },
        );
        assert_eq!(err.code, ALREADY_RUNNING);
        assert!(err.message.starts_with("bind: "));
    }

    #[test]
    fn timeouts_map_to_124() {
        assert_eq!(
            instance_error("probe", InstanceError::Timeout(Duration::from_millis(5))).code,
            TIMEOUT
        );
        let err = SessionError::Timeout {
            operation: "interrupt",
            after: Duration::from_secs(1),
        };
        assert_eq!(session_error("exec", err).code, TIMEOUT);
    }

    #[test]
    fn io_errors_are_classified() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(io_error("connect", refused).code, FAILURE);
        let other = io::Error::new(io::ErrorKind::Other, "boom");
        assert_eq!(io_error("connect", other).code, INTERNAL);
    }
}
