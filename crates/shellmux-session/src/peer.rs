//! The interpreter side of a session connection.
//!
//! Interpreter peers written in Rust (and the tests) use [`PeerEndpoint`] to
//! speak the session protocol back to the controller.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use shellmux_mux::{Channel, Message, Multiplexer, MuxConfig, Subscription};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::error::{Result, SessionError};
use crate::protocol::{
    self, capacity_for, ControlMessage, ExecuteRequest, Hello, IntrospectReply,
    IntrospectRequest, StatusMessage, PROTOCOL_NAME, PROTOCOL_VERSION,
};
use crate::spawn::CONNECT_ENV;

/// Something the controller asked for.
#[derive(Debug)]
pub enum PeerEvent {
    Execute(ExecuteRequest),
    Control(ControlMessage),
    /// Answer with [`PeerEndpoint::reply_introspect`], passing `request`.
    Introspect {
        request: Message,
        body: IntrospectRequest,
    },
}

pub struct PeerEndpoint {
    mux: Multiplexer,
    status: Channel,
    stdout: Channel,
    stderr: Channel,
    introspect: Channel,
    control_rx: Subscription,
    stdin_rx: Subscription,
    introspect_rx: Subscription,
    last_stdout: AtomicU64,
    last_stderr: AtomicU64,
    /// Highest execution id covered by an interrupt so far.
    interrupted_through: u64,
}

impl PeerEndpoint {
    /// Speak the peer side of the protocol over `io`.
    pub fn new<T>(io: T, config: MuxConfig) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let capacity = config.channel_capacity;
        let mux = Multiplexer::new(io, config);
        let open = |name: &str| -> Result<Channel> {
            let (_, mode, priority) = protocol::CONTROLLER_CHANNELS
                .into_iter()
                .find(|(n, _, _)| *n == name)
                .ok_or_else(|| SessionError::Handshake(format!("unknown channel '{name}'")))?;
            Ok(mux.open_channel_with(name, mode.peer_mode(), capacity_for(priority, capacity))?)
        };

        let control = open(protocol::CONTROL)?;
        let status = open(protocol::STATUS)?;
        let stdin = open(protocol::STDIN)?;
        let stdout = open(protocol::STDOUT)?;
        let stderr = open(protocol::STDERR)?;
        let introspect = open(protocol::INTROSPECT)?;

        let control_rx = mux.subscribe(&control)?;
        let stdin_rx = mux.subscribe(&stdin)?;
        let introspect_rx = mux.subscribe(&introspect)?;

        Ok(Self {
            mux,
            status,
            stdout,
            stderr,
            introspect,
            control_rx,
            stdin_rx,
            introspect_rx,
            last_stdout: AtomicU64::new(0),
            last_stderr: AtomicU64::new(0),
            interrupted_through: 0,
        })
    }

    /// Connect to the controller socket named by `SHELLMUX_CONNECT`.
    #[cfg(unix)]
    pub async fn connect_from_env(config: MuxConfig) -> Result<Self> {
        let path = std::env::var_os(CONNECT_ENV)
            .ok_or_else(|| SessionError::Handshake(format!("{CONNECT_ENV} is not set")))?;
        let stream = shellmux_transport::connect_async(path).await?;
        Self::new(stream, config)
    }

    /// Announce the interpreter with this build's protocol version.
    pub async fn hello(&self, interpreter: &str, info: serde_json::Value) -> Result<()> {
        self.send_status(&StatusMessage::Hello(Hello {
            protocol: PROTOCOL_NAME.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            interpreter: interpreter.to_string(),
            info,
        }))
        .await
    }

    /// Send any status message as-is.
    pub async fn send_status(&self, message: &StatusMessage) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        self.mux.publish(&self.status, payload).await?;
        Ok(())
    }

    /// Next request from the controller; `None` once it has gone away.
    ///
    /// Control messages are served first. Malformed messages are skipped, as
    /// are executions an earlier interrupt already covered.
    pub async fn next_event(&mut self) -> Option<PeerEvent> {
        loop {
            tokio::select! {
                biased;
                message = self.control_rx.next() => {
                    match serde_json::from_slice(&message?.payload) {
                        Ok(control) => {
                            if let ControlMessage::Interrupt { through } = control {
                                self.interrupted_through = self.interrupted_through.max(through);
                            }
                            return Some(PeerEvent::Control(control));
                        }
                        Err(err) => warn!(error = %err, "skipping malformed control message"),
                    }
                }
                message = self.stdin_rx.next() => {
                    match serde_json::from_slice::<ExecuteRequest>(&message?.payload) {
                        Ok(request) if self.is_interrupted(request.id) => {
                            debug!(exec = request.id, "dropping interrupted execution");
                        }
                        Ok(request) => return Some(PeerEvent::Execute(request)),
                        Err(err) => warn!(error = %err, "skipping malformed execute request"),
                    }
                }
                message = self.introspect_rx.next() => {
                    let request = message?;
                    match serde_json::from_slice(&request.payload) {
                        Ok(body) => return Some(PeerEvent::Introspect { request, body }),
                        Err(err) => warn!(error = %err, "skipping malformed introspect request"),
                    }
                }
            }
        }
    }

    /// Whether an interrupt received so far covers execution `exec`.
    ///
    /// Peers that queue executions themselves check this before running one.
    pub fn is_interrupted(&self, exec: u64) -> bool {
        exec <= self.interrupted_through
    }

    pub async fn write_stdout(&self, data: impl Into<Bytes>) -> Result<()> {
        let seq = self.mux.publish(&self.stdout, data).await?;
        self.last_stdout.fetch_max(seq, Ordering::AcqRel);
        Ok(())
    }

    pub async fn write_stderr(&self, data: impl Into<Bytes>) -> Result<()> {
        let seq = self.mux.publish(&self.stderr, data).await?;
        self.last_stderr.fetch_max(seq, Ordering::AcqRel);
        Ok(())
    }

    /// Report execution `exec` finished, covering all output written so far.
    pub async fn complete(&self, exec: u64) -> Result<()> {
        self.send_status(&StatusMessage::ExecuteComplete {
            exec,
            stdout_seq: self.last_stdout.load(Ordering::Acquire),
            stderr_seq: self.last_stderr.load(Ordering::Acquire),
        })
        .await
    }

    /// Acknowledge every interrupt received so far.
    ///
    /// Write whatever the interrupted code still has to say before calling
    /// this; output published afterwards belongs to later executions.
    pub async fn ack_interrupt(&self) -> Result<()> {
        self.send_status(&StatusMessage::InterruptAck {
            through: self.interrupted_through,
            stdout_seq: self.last_stdout.load(Ordering::Acquire),
            stderr_seq: self.last_stderr.load(Ordering::Acquire),
        })
        .await
    }

    pub async fn pong(&self, nonce: u64) -> Result<()> {
        self.send_status(&StatusMessage::Pong { nonce }).await
    }

    pub async fn reply_introspect(&self, request: &Message, reply: &IntrospectReply) -> Result<()> {
        let payload = serde_json::to_vec(reply)?;
        self.mux.reply(&self.introspect, request, payload).await?;
        Ok(())
    }

    /// Say goodbye; the controller treats the following disconnect as a clean exit.
    pub async fn bye(&self) -> Result<()> {
        self.send_status(&StatusMessage::Bye).await
    }

    /// Flush queued messages and drop the connection.
    pub fn close(&self) {
        self.mux.close();
    }

    /// Like [`close`](Self::close), but returns only once the flush is done.
    pub async fn shutdown(&self) {
        self.mux.shutdown().await;
    }
}
