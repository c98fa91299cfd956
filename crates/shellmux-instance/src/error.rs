use std::path::PathBuf;
use std::time::Duration;

/// Errors from the single-instance server and client.
#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    /// Another live process holds the rendezvous lock.
    #[error("already running (rendezvous {rendezvous}, pid {pid:?})")]
    AlreadyRunning {
        rendezvous: PathBuf,
        pid: Option<u32>,
    },

    /// Nothing is listening at the rendezvous point.
    #[error("no server at {0}")]
    NotRunning(PathBuf),

    #[error("no answer within {0:?}")]
    Timeout(Duration),

    /// The other side answered with something unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(#[from] shellmux_transport::TransportError),

    #[error("frame error: {0}")]
    Frame(#[from] shellmux_frame::FrameError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, InstanceError>;
