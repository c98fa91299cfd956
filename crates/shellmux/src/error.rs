use shellmux_instance::InstanceError;
use shellmux_session::SessionError;

/// Errors surfaced by the controller and its handle.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Instance(#[from] InstanceError),

    #[error("no current shell session")]
    NoSession,

    /// The coordinator task has exited; the request was not handled.
    #[error("controller has stopped")]
    ControllerStopped,
}

pub type Result<T> = std::result::Result<T, Error>;
