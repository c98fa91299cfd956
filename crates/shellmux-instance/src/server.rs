//! The running instance's side of the rendezvous.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use shellmux_frame::{FrameConfig, Transport};
use shellmux_transport::{AsyncSocketListener, InstanceLock};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::InstanceConfig;
use crate::error::{InstanceError, Result};
use crate::protocol::{ClientMessage, ForwardedCommand, Greeting};

/// Accepts launches' connections and queues their forwarded commands.
///
/// Holds the rendezvous lock for its whole life. Dropping it removes the
/// socket file first and then releases the lock.
pub struct CommandServer {
    config: InstanceConfig,
    // Field order matters: the listener (and its socket file) goes before the lock.
    listener: AsyncSocketListener,
    _lock: InstanceLock,
    commands_tx: mpsc::UnboundedSender<ForwardedCommand>,
    commands_rx: Option<mpsc::UnboundedReceiver<ForwardedCommand>>,
}

struct ConnectionContext {
    greeting: Bytes,
    frame_config: FrameConfig,
    timeout: Duration,
    commands: mpsc::UnboundedSender<ForwardedCommand>,
}

impl CommandServer {
    /// Take the rendezvous lock and bind the socket. Must run inside a runtime.
    ///
    /// Fails with `AlreadyRunning` when another process holds the lock.
    pub fn bind(config: InstanceConfig) -> Result<Self> {
        if let Some(dir) = config.rendezvous.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let lock_path = config.lock_path();
        let Some(lock) = InstanceLock::try_acquire(&lock_path)? else {
            return Err(InstanceError::AlreadyRunning {
                rendezvous: config.rendezvous.clone(),
                pid: InstanceLock::holder_pid(&lock_path),
            });
        };
        // With the lock held, any socket file left at the path is stale.
        let listener = AsyncSocketListener::bind(&config.rendezvous)?;
        info!(path = ?config.rendezvous, app = %config.app_name, "command server bound");

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            listener,
            _lock: lock,
            commands_tx,
            commands_rx: Some(commands_rx),
        })
    }

    pub fn path(&self) -> &Path {
        self.listener.path()
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    /// The queue of forwarded commands. Available once.
    pub fn take_commands(&mut self) -> Option<mpsc::UnboundedReceiver<ForwardedCommand>> {
        self.commands_rx.take()
    }

    /// Accept connections until `cancel` fires, one task per connection.
    ///
    /// A failing connection is logged and dropped; it never stops the loop.
    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        let greeting = serde_json::to_vec(&Greeting {
            app: self.config.app_name.clone(),
            pid: std::process::id(),
            version: self.config.version.clone(),
        })?;
        let context = Arc::new(ConnectionContext {
            greeting: Bytes::from(greeting),
            frame_config: FrameConfig::default()
                .with_max_payload_size(self.config.max_payload_size),
            timeout: self.config.forward_timeout,
            commands: self.commands_tx.clone(),
        });
        let next_conn = AtomicU64::new(1);

        loop {
            let stream = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(stream) => stream,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                },
            };
            let conn = next_conn.fetch_add(1, Ordering::Relaxed);
            let context = Arc::clone(&context);
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, &context).await {
                    warn!(conn, error = %err, "command connection failed");
                }
            });
        }

        info!(path = ?self.listener.path(), "command server stopped");
        Ok(())
    }
}

impl std::fmt::Debug for CommandServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandServer")
            .field("path", &self.listener.path())
            .field("app", &self.config.app_name)
            .finish_non_exhaustive()
    }
}

async fn handle_connection(stream: UnixStream, context: &ConnectionContext) -> Result<()> {
    let mut transport = Transport::with_config(stream, &context.frame_config);
    let frame = tokio::time::timeout(context.timeout, transport.receive())
        .await
        .map_err(|_| InstanceError::Timeout(context.timeout))??;

    match serde_json::from_slice::<ClientMessage>(&frame)? {
        ClientMessage::Probe => {
            debug!("answering probe");
            transport.send(context.greeting.clone()).await?;
        }
        ClientMessage::Forward(command) => {
            info!(args = ?command.argv, cwd = %command.cwd, "command forwarded");
            let reply_expected = command.reply_expected;
            context
                .commands
                .send(command)
                .map_err(|_| InstanceError::Protocol("command queue closed".into()))?;
            if reply_expected {
                transport.send(Bytes::new()).await?;
            }
        }
    }
    transport.close().await?;
    Ok(())
}
