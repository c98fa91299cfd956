use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::LocalStream;

/// Maximum socket path length (`sockaddr_un.sun_path`).
#[cfg(target_os = "linux")]
const MAX_PATH_LEN: usize = 108;
#[cfg(not(target_os = "linux"))]
const MAX_PATH_LEN: usize = 104;

/// Blocking listener on a filesystem-path Unix domain socket.
///
/// The socket file is removed when the listener is dropped, unless something
/// else has replaced it in the meantime.
pub struct SocketListener {
    listener: UnixListener,
    guard: SocketPathGuard,
}

impl SocketListener {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;

    /// Bind a socket at `path` with [`Self::DEFAULT_SOCKET_MODE`].
    ///
    /// An existing socket file at `path` is treated as stale and removed.
    /// Callers that arbitrate ownership of a well-known path must hold the
    /// matching [`InstanceLock`](crate::InstanceLock) first.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, Self::DEFAULT_SOCKET_MODE)
    }

    /// Bind a socket at `path` with an explicit permission mode.
    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        check_path_len(&path)?;
        remove_stale_socket(&path)?;

        let bind_err = |source| TransportError::Bind {
            path: path.clone(),
            source,
        };

        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).map_err(bind_err)?;
        let metadata = std::fs::symlink_metadata(&path).map_err(bind_err)?;

        info!(?path, "listening on unix domain socket");

        Ok(Self {
            listener,
            guard: SocketPathGuard {
                path,
                identity: (metadata.dev(), metadata.ino()),
            },
        })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<LocalStream> {
        let (stream, _addr) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(path = ?self.guard.path, "accepted connection");
        Ok(LocalStream::from_std(stream))
    }

    /// Connect to a listening socket (blocking).
    pub fn connect(path: impl AsRef<Path>) -> Result<LocalStream> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|source| TransportError::Connect {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(?path, "connected to unix domain socket");
        Ok(LocalStream::from_std(stream))
    }

    /// The bound socket path.
    pub fn path(&self) -> &Path {
        &self.guard.path
    }

    /// Hand the listener to the tokio reactor. Must run inside a runtime.
    #[cfg(feature = "async")]
    pub fn into_async(self) -> Result<AsyncSocketListener> {
        self.listener.set_nonblocking(true)?;
        let listener = tokio::net::UnixListener::from_std(self.listener)?;
        Ok(AsyncSocketListener {
            listener,
            guard: self.guard,
        })
    }
}

/// Async listener produced by [`SocketListener::into_async`].
#[cfg(feature = "async")]
pub struct AsyncSocketListener {
    listener: tokio::net::UnixListener,
    guard: SocketPathGuard,
}

#[cfg(feature = "async")]
impl AsyncSocketListener {
    /// Bind straight into the reactor.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        SocketListener::bind(path)?.into_async()
    }

    /// Accept the next connection.
    pub async fn accept(&self) -> Result<tokio::net::UnixStream> {
        let (stream, _addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::Accept)?;
        debug!(path = ?self.guard.path, "accepted connection");
        Ok(stream)
    }

    /// The bound socket path.
    pub fn path(&self) -> &Path {
        &self.guard.path
    }
}

/// Connect to a listening socket from async code.
#[cfg(feature = "async")]
pub async fn connect_async(path: impl AsRef<Path>) -> Result<tokio::net::UnixStream> {
    let path = path.as_ref();
    let stream = tokio::net::UnixStream::connect(path)
        .await
        .map_err(|source| TransportError::Connect {
            path: path.to_path_buf(),
            source,
        })?;
    debug!(?path, "connected to unix domain socket");
    Ok(stream)
}

/// Removes the socket file on drop if it is still the file we created.
struct SocketPathGuard {
    path: PathBuf,
    identity: (u64, u64),
}

impl Drop for SocketPathGuard {
    fn drop(&mut self) {
        let Ok(metadata) = std::fs::symlink_metadata(&self.path) else {
            return;
        };
        if metadata.file_type().is_socket() && (metadata.dev(), metadata.ino()) == self.identity {
            debug!(path = ?self.path, "removing socket file");
            let _ = std::fs::remove_file(&self.path);
        } else {
            debug!(path = ?self.path, "socket path replaced; leaving it alone");
        }
    }
}

fn check_path_len(path: &Path) -> Result<()> {
    let len = path.as_os_str().len();
    if len >= MAX_PATH_LEN {
        return Err(TransportError::PathTooLong {
            path: path.to_path_buf(),
            len,
            max: MAX_PATH_LEN,
        });
    }
    Ok(())
}

// Never removes anything that is not a socket.
fn remove_stale_socket(path: &Path) -> Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(TransportError::Bind {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    if !metadata.file_type().is_socket() {
        return Err(TransportError::Bind {
            path: path.to_path_buf(),
            source: std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "existing path is not a unix socket",
            ),
        });
    }

    debug!(?path, "removing stale socket");
    std::fs::remove_file(path).map_err(|source| TransportError::Bind {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "shmx-sock-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn bind_accept_connect_and_cleanup() {
        let dir = temp_dir("basic");
        let sock_path = dir.join("a.sock");

        let listener = SocketListener::bind(&sock_path).unwrap();
        assert_eq!(listener.path(), sock_path.as_path());

        let path = sock_path.clone();
        let client = std::thread::spawn(move || {
            let mut stream = SocketListener::connect(&path).unwrap();
            stream.write_all(b"ping").unwrap();
        });

        let mut server = listener.accept().unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        client.join().unwrap();

        drop(listener);
        assert!(!sock_path.exists(), "socket file should be removed on drop");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn socket_mode_is_owner_only() {
        let dir = temp_dir("mode");
        let sock_path = dir.join("m.sock");

        let listener = SocketListener::bind(&sock_path).unwrap();
        let mode = std::fs::metadata(&sock_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn stale_socket_is_replaced() {
        let dir = temp_dir("stale");
        let sock_path = dir.join("s.sock");

        // A listener that is dropped without cleanup leaves a dead socket file.
        let stale = UnixListener::bind(&sock_path).unwrap();
        drop(stale);
        assert!(sock_path.exists());

        let listener = SocketListener::bind(&sock_path).unwrap();
        let _client = SocketListener::connect(&sock_path).unwrap();
        let _server = listener.accept().unwrap();

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn refuses_to_remove_regular_file() {
        let dir = temp_dir("file");
        let sock_path = dir.join("f.sock");
        std::fs::write(&sock_path, b"not a socket").unwrap();

        let result = SocketListener::bind(&sock_path);
        assert!(matches!(result, Err(TransportError::Bind { .. })));
        assert_eq!(std::fs::read(&sock_path).unwrap(), b"not a socket");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn drop_leaves_replaced_path() {
        let dir = temp_dir("replace");
        let sock_path = dir.join("r.sock");

        let listener = SocketListener::bind(&sock_path).unwrap();
        std::fs::remove_file(&sock_path).unwrap();
        std::fs::write(&sock_path, b"someone else").unwrap();

        drop(listener);
        assert!(sock_path.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn path_too_long_rejected() {
        let long_path = format!("/tmp/{}.sock", "x".repeat(200));
        let result = SocketListener::bind(&long_path);
        assert!(matches!(result, Err(TransportError::PathTooLong { .. })));
    }

    #[test]
    fn connect_to_missing_path_fails() {
        let dir = temp_dir("missing");
        let result = SocketListener::connect(dir.join("nobody.sock"));
        match result {
            Err(TransportError::Connect { source, .. }) => {
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("expected connect error, got {other:?}"),
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn async_listener_roundtrip() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let dir = temp_dir("async");
        let sock_path = dir.join("x.sock");
        let listener = AsyncSocketListener::bind(&sock_path).unwrap();

        let path = sock_path.clone();
        let client = tokio::spawn(async move {
            let mut stream = connect_async(&path).await.unwrap();
            stream.write_all(b"hello").await.unwrap();
        });

        let mut server = listener.accept().await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        client.await.unwrap();

        drop(listener);
        assert!(!sock_path.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
