//! The launch side: find the running instance and hand it our argv.
//!
//! Blocking on purpose: this runs once, before any runtime exists, and the
//! process usually exits right after.

use std::time::Duration;

use shellmux_frame::{FrameConfig, FrameError, FrameReader, FrameWriter};
use shellmux_transport::{InstanceLock, LocalStream, SocketListener};
use tracing::{debug, info, warn};

use crate::config::InstanceConfig;
use crate::error::{InstanceError, Result};
use crate::protocol::{ClientMessage, ForwardedCommand, Greeting};

/// What the launch should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalResult {
    /// No usable server. `stale` is set when something listened but did not
    /// answer properly.
    BecomeServer { stale: bool },
    /// The running instance took the command.
    HandledRemotely { server_pid: Option<u32> },
}

struct Exchange {
    reader: FrameReader<LocalStream>,
    writer: FrameWriter<LocalStream>,
    timeout: Duration,
}

impl Exchange {
    fn open(config: &InstanceConfig, timeout: Duration) -> Result<Self> {
        let stream = SocketListener::connect(&config.rendezvous)
            .map_err(|_| InstanceError::NotRunning(config.rendezvous.clone()))?;
        let frame_config = FrameConfig::default()
            .with_max_payload_size(config.max_payload_size)
            .with_timeout(timeout);
        let reader = FrameReader::for_local(stream.try_clone()?, frame_config.clone())?;
        let writer = FrameWriter::for_local(stream, frame_config)?;
        Ok(Self {
            reader,
            writer,
            timeout,
        })
    }

    fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        self.writer.send(&payload).map_err(|e| self.classify(e))
    }

    fn receive(&mut self) -> Result<bytes::Bytes> {
        self.reader.read_frame().map_err(|e| self.classify(e))
    }

    fn classify(&self, err: FrameError) -> InstanceError {
        if err.is_timeout() {
            InstanceError::Timeout(self.timeout)
        } else {
            err.into()
        }
    }
}

/// Ask the server at the rendezvous point who it is.
pub fn probe(config: &InstanceConfig) -> Result<Greeting> {
    let mut exchange = Exchange::open(config, config.probe_timeout)?;
    exchange.send(&ClientMessage::Probe)?;
    let greeting: Greeting = serde_json::from_slice(&exchange.receive()?)?;
    if greeting.app != config.app_name {
        return Err(InstanceError::Protocol(format!(
            "server belongs to '{}', expected '{}'",
            greeting.app, config.app_name
        )));
    }
    debug!(pid = greeting.pid, version = %greeting.version, "server answered probe");
    Ok(greeting)
}

/// True when a server for this app answers a probe in time.
pub fn is_server_running(config: &InstanceConfig) -> bool {
    probe(config).is_ok()
}

/// Send one command to the running server.
///
/// Waits for the empty acknowledgement frame when `reply_expected`.
pub fn forward_command(config: &InstanceConfig, command: &ForwardedCommand) -> Result<()> {
    let mut exchange = Exchange::open(config, config.forward_timeout)?;
    exchange.send(&ClientMessage::Forward(command.clone()))?;
    if command.reply_expected {
        let ack = exchange.receive()?;
        if !ack.is_empty() {
            return Err(InstanceError::Protocol(format!(
                "expected empty acknowledgement, got {} bytes",
                ack.len()
            )));
        }
    }
    Ok(())
}

/// Forward `argv` to the running instance, or report that this process
/// should become it.
///
/// An empty `argv` is forwarded too; the server treats it as a focus request.
pub fn handle_cmd_args(config: &InstanceConfig, argv: &[String]) -> LocalResult {
    let command = ForwardedCommand::from_here(argv.to_vec());
    match forward_command(config, &command) {
        Ok(()) => {
            let server_pid = InstanceLock::holder_pid(config.lock_path());
            info!(?server_pid, args = argv.len(), "command forwarded to running instance");
            LocalResult::HandledRemotely { server_pid }
        }
        Err(InstanceError::NotRunning(path)) => {
            debug!(?path, "no running instance");
            LocalResult::BecomeServer { stale: false }
        }
        Err(err) => {
            warn!(error = %err, "running instance did not take the command");
            LocalResult::BecomeServer { stale: true }
        }
    }
}
