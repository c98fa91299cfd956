/// Errors raised while encoding, decoding or moving frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header does not start with the magic number.
    #[error("invalid frame magic (expected 0x534d \"SM\")")]
    InvalidMagic,

    /// The payload exceeds the configured maximum.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error on the underlying stream.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection, or the channel was closed locally.
    #[error("connection closed")]
    ConnectionClosed,
}

impl FrameError {
    /// True when the error means a blocking read or write hit its timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            FrameError::Io(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
