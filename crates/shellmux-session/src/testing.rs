//! In-process peers for session and registry tests.

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use shellmux_mux::MuxConfig;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

use crate::error::{Result, SessionError};
use crate::peer::{PeerEndpoint, PeerEvent};
use crate::protocol::{ControlMessage, IntrospectReply};
use crate::spawn::{ProcessHandle, SpawnSpec, SpawnedPeer, Spawner};

/// How the fake interpreter behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Echoes code to stdout (`err:` prefix to stderr, `sleep:<ms>` waits,
    /// `exit` says bye and leaves). Acks interrupts, answers pings.
    Echo,
    /// Never sends a hello.
    Silent,
    /// Hello with an incompatible major version.
    WrongVersion,
    /// Like `Echo` but ignores interrupts.
    Stubborn,
    /// Like `Echo` but prints a banner right after the hello.
    Banner,
}

#[derive(Debug, Clone)]
pub struct MockProcess {
    alive: Arc<AtomicBool>,
    killed: Arc<AtomicBool>,
    written: Arc<AtomicUsize>,
}

impl MockProcess {
    fn new() -> Self {
        Self {
            alive: Arc::new(AtomicBool::new(true)),
            killed: Arc::new(AtomicBool::new(false)),
            written: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bytes the controller has written towards this peer.
    pub fn bytes_written(&self) -> usize {
        self.written.load(Ordering::SeqCst)
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn exit(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

impl ProcessHandle for MockProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    fn is_alive(&mut self) -> bool {
        self.is_running()
    }

    fn kill(&mut self) {
        self.killed.store(true, Ordering::SeqCst);
        self.exit();
    }
}

/// Spawns scripted in-process peers over duplex pipes.
#[derive(Debug)]
pub struct MockSpawner {
    script: Mutex<Script>,
    fail: AtomicBool,
    spawned: AtomicUsize,
    processes: Mutex<Vec<MockProcess>>,
}

impl MockSpawner {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            fail: AtomicBool::new(false),
            spawned: AtomicUsize::new(0),
            processes: Mutex::new(Vec::new()),
        })
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    pub fn fail_next(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Handle to the n-th spawned process.
    pub fn process(&self, n: usize) -> MockProcess {
        self.processes.lock().unwrap()[n].clone()
    }
}

impl Spawner for MockSpawner {
    async fn spawn(
        &self,
        spec: &SpawnSpec,
        _markers: &BTreeMap<String, String>,
    ) -> Result<SpawnedPeer> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SessionError::Spawn(format!("cannot start '{}'", spec.program)));
        }
        let script = *self.script.lock().unwrap();
        let (controller, peer) = tokio::io::duplex(64 * 1024);
        let process = MockProcess::new();
        self.processes.lock().unwrap().push(process.clone());
        self.spawned.fetch_add(1, Ordering::SeqCst);

        let endpoint = PeerEndpoint::new(peer, MuxConfig::default())?;
        tokio::spawn(run_script(endpoint, script, process.clone()));

        let io = CountingIo {
            inner: controller,
            written: Arc::clone(&process.written),
        };
        Ok(SpawnedPeer {
            io: Box::new(io),
            process: Box::new(process),
        })
    }
}

/// Controller end of a mock peer's pipe, counting what gets written.
struct CountingIo {
    inner: DuplexStream,
    written: Arc<AtomicUsize>,
}

impl AsyncRead for CountingIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for CountingIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let polled = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &polled {
            self.written.fetch_add(*n, Ordering::SeqCst);
        }
        polled
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

async fn run_script(mut peer: PeerEndpoint, script: Script, process: MockProcess) {
    match script {
        Script::Silent => {
            while peer.next_event().await.is_some() {}
            return;
        }
        Script::WrongVersion => {
            let _ = peer
                .send_status(&crate::protocol::StatusMessage::Hello(crate::protocol::Hello {
                    protocol: crate::protocol::PROTOCOL_NAME.into(),
                    version: "9.0".into(),
                    interpreter: "mock".into(),
                    info: serde_json::Value::Null,
                }))
                .await;
            while peer.next_event().await.is_some() {}
            return;
        }
        Script::Echo | Script::Stubborn | Script::Banner => {}
    }

    let _ = peer.hello("mock 1.0", serde_json::json!({"pid": 0})).await;
    if script == Script::Banner {
        let _ = peer.write_stdout("banner").await;
    }
    let acks_interrupts = script != Script::Stubborn;
    // Requests that arrived while code was sleeping.
    let mut backlog = VecDeque::new();
    loop {
        let event = match backlog.pop_front() {
            Some(event) => event,
            None => match peer.next_event().await {
                Some(event) => event,
                None => return,
            },
        };
        match event {
            PeerEvent::Execute(request) if peer.is_interrupted(request.id) => {}
            PeerEvent::Execute(request) => {
                if request.code == "exit" {
                    let _ = peer.bye().await;
                    peer.close();
                    process.exit();
                    return;
                }
                if let Some(ms) = request.code.strip_prefix("sleep:") {
                    let ms: u64 = ms.parse().unwrap_or(0);
                    let sleep = tokio::time::sleep(Duration::from_millis(ms));
                    tokio::pin!(sleep);
                    let mut interrupted = false;
                    loop {
                        tokio::select! {
                            _ = &mut sleep => break,
                            event = peer.next_event() => match event {
                                Some(PeerEvent::Control(ControlMessage::Interrupt { .. })) if acks_interrupts => {
                                    if peer.is_interrupted(request.id) {
                                        interrupted = true;
                                        break;
                                    }
                                    let _ = peer.ack_interrupt().await;
                                }
                                Some(PeerEvent::Control(ControlMessage::Interrupt { .. })) => {}
                                Some(PeerEvent::Control(ControlMessage::Ping { nonce })) => {
                                    let _ = peer.pong(nonce).await;
                                }
                                Some(other) => backlog.push_back(other),
                                None => return,
                            },
                        }
                    }
                    if interrupted {
                        let _ = peer.write_stderr("interrupted").await;
                        let _ = peer.ack_interrupt().await;
                        continue;
                    }
                    let _ = peer.write_stdout("slept").await;
                } else if let Some(text) = request.code.strip_prefix("err:") {
                    let _ = peer.write_stderr(text.to_string()).await;
                } else {
                    let _ = peer.write_stdout(request.code.clone()).await;
                }
                let _ = peer.complete(request.id).await;
            }
            PeerEvent::Control(ControlMessage::Interrupt { .. }) => {
                if acks_interrupts {
                    let _ = peer.ack_interrupt().await;
                }
            }
            PeerEvent::Control(ControlMessage::Ping { nonce }) => {
                let _ = peer.pong(nonce).await;
            }
            PeerEvent::Control(ControlMessage::Terminate) => {
                let _ = peer.bye().await;
                peer.close();
                process.exit();
                return;
            }
            PeerEvent::Introspect { request, body } => match body.method.as_str() {
                "complete" => {
                    let reply = IntrospectReply::Ok(serde_json::json!(["alpha", "beta"]));
                    let _ = peer.reply_introspect(&request, &reply).await;
                }
                // Never answered.
                "slow" => {}
                other => {
                    let reply = IntrospectReply::Error(format!("unknown method '{other}'"));
                    let _ = peer.reply_introspect(&request, &reply).await;
                }
            },
        }
    }
}
