//! Launching interpreter peers.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use shellmux_transport::AsyncSocketListener;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::error::{Result, SessionError};

/// Environment variable through which a spawned peer learns where to connect.
pub const CONNECT_ENV: &str = "SHELLMUX_CONNECT";

/// What to run for a shell session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl SpawnSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// Control over a spawned interpreter process.
pub trait ProcessHandle: Send + 'static {
    /// OS process id, if there is one.
    fn id(&self) -> Option<u32>;
    /// Non-blocking check; reaps the process once it has exited.
    fn is_alive(&mut self) -> bool;
    /// Force the process down. Safe to call more than once.
    fn kill(&mut self);
}

/// Byte stream connected to a peer.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A launched peer: its connection and its process.
pub struct SpawnedPeer {
    pub io: Box<dyn PeerStream>,
    pub process: Box<dyn ProcessHandle>,
}

impl std::fmt::Debug for SpawnedPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedPeer")
            .field("pid", &self.process.id())
            .finish_non_exhaustive()
    }
}

/// Starts interpreter peers. Sessions call this on start and restart.
pub trait Spawner: Send + Sync + 'static {
    fn spawn(
        &self,
        spec: &SpawnSpec,
        markers: &BTreeMap<String, String>,
    ) -> impl Future<Output = Result<SpawnedPeer>> + Send;
}

/// Spawns real processes that connect back over a private Unix socket.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    socket_dir: PathBuf,
    accept_timeout: Duration,
}

static NEXT_SOCKET: AtomicU64 = AtomicU64::new(0);

impl Default for ProcessSpawner {
    fn default() -> Self {
        Self {
            socket_dir: std::env::temp_dir(),
            accept_timeout: Duration::from_secs(10),
        }
    }
}

impl ProcessSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory for per-peer sockets. Default: the system temp dir.
    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }

    /// How long the peer has to connect after launch. Default: 10s.
    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    fn socket_path(&self) -> PathBuf {
        let n = NEXT_SOCKET.fetch_add(1, Ordering::Relaxed);
        self.socket_dir
            .join(format!("shellmux-{}-{n}.sock", std::process::id()))
    }
}

impl Spawner for ProcessSpawner {
    async fn spawn(
        &self,
        spec: &SpawnSpec,
        markers: &BTreeMap<String, String>,
    ) -> Result<SpawnedPeer> {
        let path = self.socket_path();
        // Dropped at the end of this call, which removes the socket file.
        let listener = AsyncSocketListener::bind(&path)?;

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .envs(markers)
            .env(CONNECT_ENV, listener.path())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .map_err(|e| SessionError::Spawn(format!("failed to start '{}': {e}", spec.program)))?;
        let pid = child.id();
        debug!(program = %spec.program, ?pid, socket = ?path, "peer launched");

        let accepted = tokio::time::timeout(self.accept_timeout, async {
            tokio::select! {
                stream = listener.accept() => stream.map_err(SessionError::from),
                status = child.wait() => Err(SessionError::Spawn(match status {
                    Ok(status) => format!("'{}' exited before connecting ({status})", spec.program),
                    Err(e) => format!("'{}' could not be waited on: {e}", spec.program),
                })),
            }
        })
        .await;

        let stream = match accepted {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                let _ = child.start_kill();
                return Err(SessionError::Spawn(format!(
                    "'{}' did not connect within {:?}",
                    spec.program, self.accept_timeout
                )));
            }
        };

        info!(program = %spec.program, ?pid, "peer connected");
        Ok(SpawnedPeer {
            io: Box::new(stream),
            process: Box::new(ChildProcess { child }),
        })
    }
}

/// [`ProcessHandle`] over a tokio child process.
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
}

impl ProcessHandle for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn kill(&mut self) {
        if self.is_alive() {
            let _ = self.child.start_kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawner(tag: &str) -> (ProcessSpawner, PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "shmx-spawn-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let spawner = ProcessSpawner::new()
            .with_socket_dir(&dir)
            .with_accept_timeout(Duration::from_millis(300));
        (spawner, dir)
    }

    #[test]
    fn spec_builder() {
        let spec = SpawnSpec::new("python3")
            .arg("-i")
            .env("PYTHONUNBUFFERED", "1")
            .cwd("/tmp");
        assert_eq!(spec.args, vec!["-i"]);
        assert_eq!(spec.env["PYTHONUNBUFFERED"], "1");
        assert_eq!(spec.cwd, Some(PathBuf::from("/tmp")));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let (spawner, dir) = spawner("missing");
        let spec = SpawnSpec::new("/definitely/not/a/program");
        let err = spawner.spawn(&spec, &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, SessionError::Spawn(_)));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn early_exit_is_a_spawn_error() {
        let (spawner, dir) = spawner("exit");
        let spec = SpawnSpec::new("sh").arg("-c").arg("exit 3");
        let err = spawner.spawn(&spec, &BTreeMap::new()).await.unwrap_err();
        match err {
            SessionError::Spawn(msg) => assert!(msg.contains("exited"), "{msg}"),
            other => panic!("expected spawn error, got {other:?}"),
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (spawner, dir) = spawner("silent");
        let spec = SpawnSpec::new("sleep").arg("5");
        let err = spawner.spawn(&spec, &BTreeMap::new()).await.unwrap_err();
        match err {
            SessionError::Spawn(msg) => assert!(msg.contains("did not connect"), "{msg}"),
            other => panic!("expected spawn error, got {other:?}"),
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn markers_and_connect_path_reach_the_child() {
        let (spawner, dir) = spawner("env");
        let out = dir.join("env.txt");
        // `sh` cannot connect to a unix socket, so the accept times out; only
        // the environment it saw is checked.
        let script = format!(
            "printf '%s %s' \"$SHELLMUX_CONTROLLER_PID\" \"$SHELLMUX_CONNECT\" > {}; sleep 1",
            out.display()
        );
        let spec = SpawnSpec::new("sh").arg("-c").arg(script);
        let mut markers = BTreeMap::new();
        markers.insert("SHELLMUX_CONTROLLER_PID".to_string(), "4242".to_string());

        let _ = spawner.spawn(&spec, &markers).await;

        let contents = std::fs::read_to_string(&out).unwrap();
        assert!(contents.starts_with("4242 "), "{contents}");
        assert!(contents.contains(dir.to_str().unwrap()), "{contents}");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
