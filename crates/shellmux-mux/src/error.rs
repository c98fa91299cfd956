use std::time::Duration;

use shellmux_frame::FrameError;

use crate::channel::ChannelMode;

/// Errors from multiplexer operations.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// The peer went away or the transport failed.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// A channel with this name is already open in another mode.
    #[error("channel {name:?} is open as {existing}, cannot reopen as {requested}")]
    ChannelConflict {
        name: String,
        existing: ChannelMode,
        requested: ChannelMode,
    },

    /// The multiplexer was closed locally.
    #[error("multiplexer closed")]
    MultiplexerClosed,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The operation does not match the channel's direction.
    #[error("cannot {operation} on {mode} channel {name:?}")]
    Direction {
        name: String,
        mode: ChannelMode,
        operation: &'static str,
    },

    #[error("channel {0:?} already has a subscriber")]
    AlreadySubscribed(String),

    /// `close_channel` was already called on this channel.
    #[error("channel {0:?} is closed")]
    ChannelClosed(String),

    #[error("channel was opened on a different multiplexer")]
    ForeignChannel,

    #[error("invalid channel name: {0}")]
    InvalidChannelName(String),

    /// An inbound envelope could not be decoded.
    #[error("malformed message: {0}")]
    Malformed(&'static str),

    #[error("message too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl MuxError {
    /// True for the errors that mean the multiplexer can no longer be used.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            MuxError::ConnectionClosed(_) | MuxError::MultiplexerClosed
        )
    }
}

pub type Result<T> = std::result::Result<T, MuxError>;
