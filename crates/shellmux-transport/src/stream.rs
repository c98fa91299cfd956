use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use crate::error::Result;

/// A connected blocking local stream.
///
/// Used by short-lived callers that run before any async runtime exists,
/// such as the command client of a freshly launched process.
pub struct LocalStream {
    inner: UnixStream,
}

impl LocalStream {
    pub(crate) fn from_std(inner: UnixStream) -> Self {
        Self { inner }
    }

    /// Set read timeout on the underlying socket.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.set_read_timeout(timeout).map_err(Into::into)
    }

    /// Set write timeout on the underlying socket.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.set_write_timeout(timeout).map_err(Into::into)
    }

    /// Apply the same timeout to reads and writes.
    pub fn set_timeouts(&self, timeout: Option<Duration>) -> Result<()> {
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)
    }

    /// Duplicate the stream (new file descriptor, same socket).
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self::from_std(self.inner.try_clone()?))
    }

    /// Half-close the write side so the peer observes EOF.
    pub fn shutdown_write(&self) -> Result<()> {
        self.inner
            .shutdown(std::net::Shutdown::Write)
            .map_err(Into::into)
    }

    /// Unwrap the standard library stream.
    pub fn into_std(self) -> UnixStream {
        self.inner
    }
}

impl Read for LocalStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for LocalStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl std::fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStream")
            .field("peer", &self.inner.peer_addr().ok())
            .finish()
    }
}
