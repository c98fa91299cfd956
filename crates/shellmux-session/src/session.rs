use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use shellmux_mux::{Channel, Message, Multiplexer, MuxError, Subscription};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::events::{
    OutputEvent, OutputSource, SessionEvent, SessionEventKind, SessionId, SessionStatus,
};
use crate::protocol::{
    self, capacity_for, check_hello, ControlMessage, ExecuteRequest, Hello, IntrospectReply,
    IntrospectRequest, StatusMessage,
};
use crate::spawn::{ProcessHandle, SpawnSpec, Spawner};

/// How one execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Interrupted,
    /// The session crashed, restarted or terminated before completion.
    Aborted(String),
}

/// Output of one submitted piece of code, in the order it arrived.
///
/// The stream ends when the execution completes, is interrupted or is
/// aborted; [`Execution::outcome`] then says which.
pub struct Execution {
    id: u64,
    rx: mpsc::UnboundedReceiver<OutputEvent>,
    outcome: Arc<OnceLock<ExecutionOutcome>>,
}

impl Execution {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn next(&mut self) -> Option<OutputEvent> {
        self.rx.recv().await
    }

    /// `None` until the stream has ended.
    pub fn outcome(&self) -> Option<ExecutionOutcome> {
        self.outcome.get().cloned()
    }

    /// Drain the remaining output and return it with the outcome.
    pub async fn collect(mut self) -> (Vec<OutputEvent>, ExecutionOutcome) {
        let mut output = Vec::new();
        while let Some(event) = self.rx.recv().await {
            output.push(event);
        }
        let outcome = self
            .outcome
            .get()
            .cloned()
            .unwrap_or_else(|| ExecutionOutcome::Aborted("session dropped".into()));
        (output, outcome)
    }
}

impl futures_core::Stream for Execution {
    type Item = OutputEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<OutputEvent>> {
        self.rx.poll_recv(cx)
    }
}

impl std::fmt::Debug for Execution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Execution")
            .field("id", &self.id)
            .field("outcome", &self.outcome.get())
            .finish()
    }
}

/// How the peer said an execution ended, and the last stdout/stderr
/// sequence numbers that belong to it.
struct Ended {
    outcome: ExecutionOutcome,
    stdout_seq: u64,
    stderr_seq: u64,
}

struct PendingExecution {
    id: u64,
    tx: mpsc::UnboundedSender<OutputEvent>,
    outcome: Arc<OnceLock<ExecutionOutcome>>,
    ended: Option<Ended>,
}

impl PendingExecution {
    fn finish(self, outcome: ExecutionOutcome) {
        let _ = self.outcome.set(outcome);
    }

    fn owns(&self, source: OutputSource, seq: u64) -> bool {
        match (&self.ended, source) {
            (None, _) => true,
            (Some(ended), OutputSource::Stdout) => seq <= ended.stdout_seq,
            (Some(ended), OutputSource::Stderr) => seq <= ended.stderr_seq,
        }
    }

    /// Ended, with all of its output handed out.
    fn is_settled(&self, delivered: &Delivered) -> bool {
        self.ended.as_ref().is_some_and(|ended| {
            delivered.stdout >= ended.stdout_seq && delivered.stderr >= ended.stderr_seq
        })
    }
}

type SharedProcess = Arc<Mutex<Box<dyn ProcessHandle>>>;

fn lock_process(process: &SharedProcess) -> MutexGuard<'_, Box<dyn ProcessHandle>> {
    process.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything tied to one spawned peer.
#[derive(Clone)]
struct Link {
    mux: Arc<Multiplexer>,
    control: Channel,
    stdin: Channel,
    introspect: Channel,
    process: SharedProcess,
    cancel: CancellationToken,
}

impl Link {
    fn shut(&self) {
        self.cancel.cancel();
        self.mux.close();
        lock_process(&self.process).kill();
    }
}

struct Subscriptions {
    status: Subscription,
    stdout: Subscription,
    stderr: Subscription,
}

/// Highest output sequence numbers handed out so far, per stream.
#[derive(Default)]
struct Delivered {
    stdout: u64,
    stderr: u64,
}

struct State {
    /// Bumped on restart and terminate so a superseded pump cannot touch
    /// the session.
    generation: u64,
    link: Option<Link>,
    interpreter: Option<String>,
    pending: VecDeque<PendingExecution>,
    next_exec: u64,
    /// Callers of `interrupt`, keyed by the last execution id they cover.
    interrupt_waiters: Vec<(u64, oneshot::Sender<()>)>,
    pings: HashMap<u64, oneshot::Sender<()>>,
    next_nonce: u64,
    peer_said_bye: bool,
}

impl State {
    fn abort_all(&mut self, reason: &str) {
        for pending in self.pending.drain(..) {
            pending.finish(ExecutionOutcome::Aborted(reason.to_string()));
        }
        self.interrupt_waiters.clear();
        self.pings.clear();
    }
}

struct Inner<S> {
    id: SessionId,
    spec: SpawnSpec,
    spawner: Arc<S>,
    config: SessionConfig,
    events: mpsc::UnboundedSender<SessionEvent>,
    status: watch::Sender<SessionStatus>,
    state: Mutex<State>,
    /// Serializes restart and terminate.
    lifecycle: tokio::sync::Mutex<()>,
    /// Keeps execution ids in submission order on the wire.
    submit: tokio::sync::Mutex<()>,
}

/// One interpreter subprocess driven over a multiplexed connection.
///
/// Cheap to clone; clones share the session. The session is shut down when
/// the last clone is dropped.
pub struct ShellSession<S: Spawner> {
    inner: Arc<Inner<S>>,
}

impl<S: Spawner> Clone for ShellSession<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Spawner> std::fmt::Debug for ShellSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellSession")
            .field("id", &self.inner.id)
            .field("program", &self.inner.spec.program)
            .field("status", &self.status())
            .finish()
    }
}

impl<S: Spawner> ShellSession<S> {
    /// Spawn the peer and start the session in `Starting`.
    ///
    /// Returns once the process is connected; the handshake completes in the
    /// background. A spawn failure is returned and leaves nothing running.
    pub async fn start(
        id: SessionId,
        spec: SpawnSpec,
        spawner: Arc<S>,
        config: SessionConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self> {
        let (status, _) = watch::channel(SessionStatus::Starting);
        let inner = Arc::new(Inner {
            id,
            spec,
            spawner,
            config,
            events,
            status,
            state: Mutex::new(State {
                generation: 0,
                link: None,
                interpreter: None,
                pending: VecDeque::new(),
                next_exec: 0,
                interrupt_waiters: Vec::new(),
                pings: HashMap::new(),
                next_nonce: 0,
                peer_said_bye: false,
            }),
            lifecycle: tokio::sync::Mutex::new(()),
            submit: tokio::sync::Mutex::new(()),
        });
        inner.launch(0).await?;
        info!(session = %id, program = %inner.spec.program, "session started");
        Ok(Self { inner })
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn spec(&self) -> &SpawnSpec {
        &self.inner.spec
    }

    pub fn status(&self) -> SessionStatus {
        *self.inner.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    /// Interpreter identity from the last successful handshake.
    pub fn interpreter(&self) -> Option<String> {
        self.inner.lock_state().interpreter.clone()
    }

    pub fn process_id(&self) -> Option<u32> {
        let link = self.inner.lock_state().link.clone();
        link.and_then(|link| lock_process(&link.process).id())
    }

    /// Wait for the handshake. Fails with `SessionDead` if it never happens.
    pub async fn wait_ready(&self) -> Result<()> {
        if self.settle().await.is_dead() {
            return Err(SessionError::SessionDead(self.id()));
        }
        Ok(())
    }

    /// Submit code. The returned stream yields its output.
    ///
    /// Waits out a pending handshake first. Fails with `SessionDead`, without
    /// any I/O, once the session has crashed or terminated.
    pub async fn execute(&self, code: impl Into<String>) -> Result<Execution> {
        self.settle().await;
        let _submit = self.inner.submit.lock().await;

        let (link, generation, payload, execution) = {
            let mut state = self.inner.lock_state();
            let status = self.status();
            if status.is_dead() {
                return Err(SessionError::SessionDead(self.id()));
            }
            let Some(link) = state.link.clone() else {
                return Err(SessionError::SessionDead(self.id()));
            };

            let id = state.next_exec + 1;
            let payload = serde_json::to_vec(&ExecuteRequest {
                id,
                code: code.into(),
            })?;
            state.next_exec = id;

            let (tx, rx) = mpsc::unbounded_channel();
            let outcome = Arc::new(OnceLock::new());
            state.pending.push_back(PendingExecution {
                id,
                tx,
                outcome: Arc::clone(&outcome),
                ended: None,
            });
            if status == SessionStatus::Ready {
                self.inner.set_status(SessionStatus::Busy, None);
            }
            (link, state.generation, payload, Execution { id, rx, outcome })
        };

        if let Err(err) = link.mux.publish(&link.stdin, payload).await {
            self.inner.end(
                generation,
                SessionStatus::Crashed,
                format!("failed to submit code: {err}"),
            );
            return Err(SessionError::SessionDead(self.id()));
        }
        debug!(session = %self.id(), exec = execution.id, "code submitted");
        Ok(execution)
    }

    /// Interrupt the running code.
    ///
    /// A no-op unless the session is busy. Every execution submitted before
    /// the call ends `Interrupted` unless it already completed; executions
    /// submitted afterwards run normally. Waits for the peer's
    /// acknowledgement; without one inside `interrupt_grace` the process is
    /// killed, the session crashes and `Timeout` is returned.
    pub async fn interrupt(&self) -> Result<()> {
        let (link, generation, through, ack) = {
            let mut state = self.inner.lock_state();
            let status = self.status();
            match status {
                s if s.is_dead() => return Err(SessionError::SessionDead(self.id())),
                SessionStatus::Busy | SessionStatus::Interrupting => {}
                _ => return Ok(()),
            }
            let Some(link) = state.link.clone() else {
                return Err(SessionError::SessionDead(self.id()));
            };
            let through = state.next_exec;
            let (tx, rx) = oneshot::channel();
            state.interrupt_waiters.push((through, tx));
            if status == SessionStatus::Busy {
                self.inner.set_status(SessionStatus::Interrupting, None);
            }
            (link, state.generation, through, rx)
        };

        debug!(session = %self.id(), through, "interrupting");
        let payload = serde_json::to_vec(&ControlMessage::Interrupt { through })?;
        if let Err(err) = link.mux.publish(&link.control, payload).await {
            self.inner.end(
                generation,
                SessionStatus::Crashed,
                format!("failed to send interrupt: {err}"),
            );
            return Err(SessionError::SessionDead(self.id()));
        }

        let grace = self.inner.config.interrupt_grace;
        match tokio::time::timeout(grace, ack).await {
            Ok(Ok(())) => Ok(()),
            // The session ended or restarted while we waited.
            Ok(Err(_)) if self.status().is_dead() => Err(SessionError::SessionDead(self.id())),
            Ok(Err(_)) => Ok(()),
            Err(_) => {
                self.inner.end(
                    generation,
                    SessionStatus::Crashed,
                    format!("no interrupt acknowledgement within {grace:?}"),
                );
                Err(SessionError::Timeout {
                    operation: "interrupt",
                    after: grace,
                })
            }
        }
    }

    /// Tear down the current peer and spawn a fresh one.
    ///
    /// Valid in every state except `Terminated`. Pending executions are
    /// aborted. Returns once the new peer is connected.
    pub async fn restart(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let generation = {
            let mut state = self.inner.lock_state();
            if self.status() == SessionStatus::Terminated {
                return Err(SessionError::SessionDead(self.id()));
            }
            state.generation += 1;
            if let Some(link) = state.link.take() {
                link.shut();
            }
            state.abort_all("session restarted");
            state.interpreter = None;
            state.peer_said_bye = false;
            self.inner
                .set_status(SessionStatus::Starting, Some("restarting".into()));
            state.generation
        };

        info!(session = %self.id(), generation, "restarting session");
        if let Err(err) = self.inner.launch(generation).await {
            self.inner.end(
                generation,
                SessionStatus::Crashed,
                format!("restart failed: {err}"),
            );
            return Err(err);
        }
        Ok(())
    }

    /// Run an introspection query (completion, call-tip, inspection).
    ///
    /// A timeout is returned as `Timeout` and leaves the session alone; a
    /// transport failure crashes it.
    pub async fn introspect(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.settle().await;
        let (link, generation) = {
            let state = self.inner.lock_state();
            if self.status().is_dead() {
                return Err(SessionError::SessionDead(self.id()));
            }
            match &state.link {
                Some(link) => (link.clone(), state.generation),
                None => return Err(SessionError::SessionDead(self.id())),
            }
        };

        let body = serde_json::to_vec(&IntrospectRequest {
            method: method.to_string(),
            params,
        })?;
        let timeout = self.inner.config.introspect_timeout;
        let reply = match link.mux.request(&link.introspect, body, timeout).await {
            Ok(reply) => reply,
            Err(MuxError::Timeout(after)) => {
                debug!(session = %self.id(), method, "introspection timed out");
                return Err(SessionError::Timeout {
                    operation: "introspect",
                    after,
                });
            }
            Err(err) => {
                self.inner.end(
                    generation,
                    SessionStatus::Crashed,
                    format!("introspection failed: {err}"),
                );
                return Err(err.into());
            }
        };

        match serde_json::from_slice::<IntrospectReply>(&reply.payload)? {
            IntrospectReply::Ok(value) => {
                self.inner.emit(SessionEventKind::Introspected {
                    method: method.to_string(),
                    reply: value.clone(),
                });
                Ok(value)
            }
            IntrospectReply::Error(message) => Err(SessionError::Introspection(message)),
        }
    }

    /// Round-trip a ping through the peer.
    pub async fn ping(&self) -> Result<Duration> {
        let (link, generation, nonce, pong) = {
            let mut state = self.inner.lock_state();
            if self.status().is_dead() {
                return Err(SessionError::SessionDead(self.id()));
            }
            let Some(link) = state.link.clone() else {
                return Err(SessionError::SessionDead(self.id()));
            };
            state.next_nonce += 1;
            let nonce = state.next_nonce;
            let (tx, rx) = oneshot::channel();
            state.pings.insert(nonce, tx);
            (link, state.generation, nonce, rx)
        };

        let started = Instant::now();
        let payload = serde_json::to_vec(&ControlMessage::Ping { nonce })?;
        if let Err(err) = link.mux.publish(&link.control, payload).await {
            self.inner.end(
                generation,
                SessionStatus::Crashed,
                format!("failed to send ping: {err}"),
            );
            return Err(SessionError::SessionDead(self.id()));
        }

        let timeout = self.inner.config.ping_timeout;
        match tokio::time::timeout(timeout, pong).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(_)) => Err(SessionError::SessionDead(self.id())),
            Err(_) => {
                self.inner.lock_state().pings.remove(&nonce);
                Err(SessionError::Timeout {
                    operation: "ping",
                    after: timeout,
                })
            }
        }
    }

    /// Ask the peer to exit, then make sure it does.
    ///
    /// Sends a terminate message, closes the connection, waits up to
    /// `terminate_grace` for the process to exit and kills it otherwise.
    /// Idempotent.
    pub async fn terminate(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let link = {
            let mut state = self.inner.lock_state();
            if self.status() == SessionStatus::Terminated {
                return Ok(());
            }
            state.generation += 1;
            state.abort_all("session terminated");
            state.link.take()
        };

        if let Some(link) = link {
            if let Ok(payload) = serde_json::to_vec(&ControlMessage::Terminate) {
                let _ = link.mux.publish(&link.control, payload).await;
            }
            link.cancel.cancel();
            link.mux.close();

            let deadline = Instant::now() + self.inner.config.terminate_grace;
            loop {
                let alive = lock_process(&link.process).is_alive();
                if !alive {
                    break;
                }
                if Instant::now() >= deadline {
                    warn!(session = %self.id(), "peer ignored terminate; killing it");
                    lock_process(&link.process).kill();
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }

        let _state = self.inner.lock_state();
        if !self.status().is_dead() {
            self.inner
                .set_status(SessionStatus::Terminated, Some("terminated".into()));
            info!(session = %self.id(), "session terminated");
        }
        Ok(())
    }

    /// Wait while the session is starting and return the settled status.
    async fn settle(&self) -> SessionStatus {
        let mut rx = self.inner.status.subscribe();
        let settled = match rx.wait_for(|status| *status != SessionStatus::Starting).await {
            Ok(status) => *status,
            Err(_) => SessionStatus::Crashed,
        };
        settled
    }
}

impl<S: Spawner> Inner<S> {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, kind: SessionEventKind) {
        let _ = self.events.send(SessionEvent {
            session: self.id,
            kind,
        });
    }

    /// Publish a status change. Callers hold the state lock.
    fn set_status(&self, status: SessionStatus, reason: Option<String>) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!(session = %self.id, from = %previous, to = %status, "status changed");
            self.emit(SessionEventKind::StatusChanged { status, reason });
        }
    }

    /// Spawn a peer, open the session channels and start the pump.
    async fn launch(self: &Arc<Self>, generation: u64) -> Result<()> {
        let peer = self.spawner.spawn(&self.spec, &self.config.markers).await?;
        let mux = Arc::new(Multiplexer::new(peer.io, self.config.mux.clone()));

        let capacity = self.config.mux.channel_capacity;
        let mut channels = Vec::with_capacity(protocol::CONTROLLER_CHANNELS.len());
        for (name, mode, priority) in protocol::CONTROLLER_CHANNELS {
            channels.push(mux.open_channel_with(name, mode, capacity_for(priority, capacity))?);
        }
        let [control, status, stdin, stdout, stderr, introspect] =
            <[Channel; 6]>::try_from(channels).map_err(|_| {
                SessionError::Handshake("session channel set is incomplete".into())
            })?;

        let subs = Subscriptions {
            status: mux.subscribe(&status)?,
            stdout: mux.subscribe(&stdout)?,
            stderr: mux.subscribe(&stderr)?,
        };
        let process: SharedProcess = Arc::new(Mutex::new(peer.process));
        let cancel = CancellationToken::new();
        let mux_handle = Arc::clone(&mux);
        let link = Link {
            mux,
            control,
            stdin,
            introspect,
            process: Arc::clone(&process),
            cancel: cancel.clone(),
        };

        {
            let mut state = self.lock_state();
            if state.generation != generation {
                link.shut();
                return Err(SessionError::SessionDead(self.id));
            }
            state.link = Some(link);
            state.peer_said_bye = false;
        }

        tokio::spawn(pump(
            Arc::downgrade(self),
            generation,
            subs,
            mux_handle,
            process,
            cancel,
            self.config.handshake_timeout,
            self.config.liveness_interval,
        ));
        Ok(())
    }

    /// Move to a terminal status once per generation and release the peer.
    fn end(&self, generation: u64, status: SessionStatus, reason: String) {
        let link = {
            let mut state = self.lock_state();
            let already_dead = self.status.borrow().is_dead();
            if state.generation != generation || already_dead {
                return;
            }
            let link = state.link.take();
            state.abort_all(&reason);
            self.set_status(status, Some(reason.clone()));
            link
        };

        match status {
            SessionStatus::Crashed => warn!(session = %self.id, %reason, "session crashed"),
            _ => info!(session = %self.id, %reason, "session ended"),
        }
        if let Some(link) = link {
            link.shut();
        }
    }

    fn identify(&self, generation: u64, hello: Hello) {
        let mut state = self.lock_state();
        if state.generation != generation {
            return;
        }
        info!(session = %self.id, interpreter = %hello.interpreter, version = %hello.version, "peer identified");
        state.interpreter = Some(hello.interpreter.clone());
        self.emit(SessionEventKind::Identified {
            interpreter: hello.interpreter,
            info: hello.info,
        });
        if *self.status.borrow() == SessionStatus::Starting {
            self.set_status(SessionStatus::Ready, None);
        }
    }

    fn on_status(&self, generation: u64, message: Message, delivered: &Delivered) {
        let status: StatusMessage = match serde_json::from_slice(&message.payload) {
            Ok(status) => status,
            Err(err) => {
                warn!(session = %self.id, error = %err, "ignoring malformed status message");
                return;
            }
        };

        let mut state = self.lock_state();
        if state.generation != generation {
            return;
        }
        match status {
            StatusMessage::Hello(_) => warn!(session = %self.id, "ignoring repeated hello"),
            StatusMessage::ExecuteComplete {
                exec,
                stdout_seq,
                stderr_seq,
            } => {
                match state.pending.iter_mut().find(|p| p.id == exec) {
                    Some(pending) if pending.ended.is_none() => {
                        pending.ended = Some(Ended {
                            outcome: ExecutionOutcome::Completed,
                            stdout_seq,
                            stderr_seq,
                        });
                    }
                    Some(_) => debug!(session = %self.id, exec, "completion after interrupt"),
                    None => debug!(session = %self.id, exec, "completion for unknown execution"),
                }
                self.release_completed(&mut state, delivered);
            }
            StatusMessage::InterruptAck {
                through,
                stdout_seq,
                stderr_seq,
            } => {
                let mut interrupted = 0;
                for pending in state
                    .pending
                    .iter_mut()
                    .filter(|p| p.id <= through && p.ended.is_none())
                {
                    pending.ended = Some(Ended {
                        outcome: ExecutionOutcome::Interrupted,
                        stdout_seq,
                        stderr_seq,
                    });
                    interrupted += 1;
                }
                debug!(session = %self.id, through, interrupted, "interrupt acknowledged");

                let current = *self.status.borrow();
                if matches!(current, SessionStatus::Busy | SessionStatus::Interrupting) {
                    let running = state.pending.iter().any(|p| p.ended.is_none());
                    let next = if running {
                        SessionStatus::Busy
                    } else {
                        SessionStatus::Ready
                    };
                    self.set_status(next, None);
                }
                self.release_completed(&mut state, delivered);

                let (answered, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.interrupt_waiters)
                    .into_iter()
                    .partition(|(covers, _)| *covers <= through);
                state.interrupt_waiters = waiting;
                for (_, waiter) in answered {
                    let _ = waiter.send(());
                }
            }
            StatusMessage::Pong { nonce } => {
                if let Some(waiter) = state.pings.remove(&nonce) {
                    let _ = waiter.send(());
                }
            }
            StatusMessage::Bye => {
                debug!(session = %self.id, "peer said goodbye");
                state.peer_said_bye = true;
            }
        }
    }

    fn on_output(
        &self,
        generation: u64,
        source: OutputSource,
        message: Message,
        delivered: &mut Delivered,
    ) {
        let mut state = self.lock_state();
        if state.generation != generation {
            return;
        }
        let seq = message.seq;
        match source {
            OutputSource::Stdout => delivered.stdout = seq,
            OutputSource::Stderr => delivered.stderr = seq,
        }

        let event = OutputEvent {
            source,
            data: message.payload,
        };
        match state.pending.iter().find(|p| p.owns(source, seq)) {
            Some(pending) => {
                // The consumer may have dropped its stream; output is discarded then.
                let _ = pending.tx.send(event);
            }
            None => self.emit(SessionEventKind::Output(event)),
        }
        self.release_completed(&mut state, delivered);
    }

    /// Finish executions, oldest first, once the peer has ended them and
    /// their output has all been delivered.
    fn release_completed(&self, state: &mut State, delivered: &Delivered) {
        while state
            .pending
            .front()
            .is_some_and(|front| front.is_settled(delivered))
        {
            let Some(mut done) = state.pending.pop_front() else {
                break;
            };
            let outcome = done
                .ended
                .take()
                .map_or(ExecutionOutcome::Completed, |ended| ended.outcome);
            debug!(session = %self.id, exec = done.id, ?outcome, "execution finished");
            done.finish(outcome);
        }
        if state.pending.is_empty() && *self.status.borrow() == SessionStatus::Busy {
            self.set_status(SessionStatus::Ready, None);
        }
    }

    /// The connection or the process went away.
    fn peer_gone(&self, generation: u64, reason: &str) {
        let said_bye = self.lock_state().peer_said_bye;
        if said_bye {
            self.end(generation, SessionStatus::Terminated, "peer exited".into());
        } else {
            self.end(generation, SessionStatus::Crashed, reason.to_string());
        }
    }
}

impl<S> Drop for Inner<S> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(link) = state.link.take() {
            link.shut();
        }
    }
}

async fn next_hello(status: &mut Subscription) -> std::result::Result<Hello, String> {
    let message = status
        .next()
        .await
        .ok_or_else(|| "connection closed before hello".to_string())?;
    match serde_json::from_slice::<StatusMessage>(&message.payload) {
        Ok(StatusMessage::Hello(hello)) => Ok(hello),
        Ok(other) => Err(format!("expected hello, got {other:?}")),
        Err(err) => Err(format!("malformed hello: {err}")),
    }
}

/// Hand everything already buffered to the session before it ends.
fn drain<S: Spawner>(
    inner: &Inner<S>,
    generation: u64,
    subs: &mut Subscriptions,
    delivered: &mut Delivered,
) {
    while let Some(message) = subs.status.try_next() {
        inner.on_status(generation, message, delivered);
    }
    while let Some(message) = subs.stdout.try_next() {
        inner.on_output(generation, OutputSource::Stdout, message, delivered);
    }
    while let Some(message) = subs.stderr.try_next() {
        inner.on_output(generation, OutputSource::Stderr, message, delivered);
    }
}

/// Per-peer receive loop: handshake, then status, output and liveness.
async fn pump<S: Spawner>(
    inner: Weak<Inner<S>>,
    generation: u64,
    mut subs: Subscriptions,
    mux: Arc<Multiplexer>,
    process: SharedProcess,
    cancel: CancellationToken,
    handshake_timeout: Duration,
    liveness_interval: Duration,
) {
    let hello = tokio::select! {
        _ = cancel.cancelled() => return,
        hello = tokio::time::timeout(handshake_timeout, next_hello(&mut subs.status)) => hello,
    };
    {
        let Some(session) = inner.upgrade() else {
            return;
        };
        let outcome = match hello {
            Err(_) => Err(format!("no handshake within {handshake_timeout:?}")),
            Ok(Err(reason)) => Err(reason),
            Ok(Ok(hello)) => check_hello(&hello, &session.config.protocol_version)
                .map(|()| hello)
                .map_err(|reason| format!("handshake rejected: {reason}")),
        };
        match outcome {
            Ok(hello) => session.identify(generation, hello),
            Err(reason) => {
                session.end(generation, SessionStatus::Crashed, reason);
                return;
            }
        }
    }

    let mut delivered = Delivered::default();
    let mut liveness = tokio::time::interval(liveness_interval);
    liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
    liveness.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            message = subs.status.next() => {
                let Some(session) = inner.upgrade() else { return };
                match message {
                    Some(message) => session.on_status(generation, message, &delivered),
                    None => {
                        drain(&session, generation, &mut subs, &mut delivered);
                        session.peer_gone(generation, "connection closed");
                        return;
                    }
                }
            }
            message = subs.stdout.next() => {
                let Some(session) = inner.upgrade() else { return };
                // Completions already queued must be seen before routing output.
                while let Some(status) = subs.status.try_next() {
                    session.on_status(generation, status, &delivered);
                }
                match message {
                    Some(message) => session.on_output(generation, OutputSource::Stdout, message, &mut delivered),
                    None => {
                        drain(&session, generation, &mut subs, &mut delivered);
                        session.peer_gone(generation, "connection closed");
                        return;
                    }
                }
            }
            message = subs.stderr.next() => {
                let Some(session) = inner.upgrade() else { return };
                while let Some(status) = subs.status.try_next() {
                    session.on_status(generation, status, &delivered);
                }
                match message {
                    Some(message) => session.on_output(generation, OutputSource::Stderr, message, &mut delivered),
                    None => {
                        drain(&session, generation, &mut subs, &mut delivered);
                        session.peer_gone(generation, "connection closed");
                        return;
                    }
                }
            }
            _ = liveness.tick() => {
                let alive = lock_process(&process).is_alive();
                if !alive {
                    // Let the connection deliver whatever the process wrote last.
                    let _ = tokio::time::timeout(liveness_interval, mux.closed()).await;
                    let Some(session) = inner.upgrade() else { return };
                    drain(&session, generation, &mut subs, &mut delivered);
                    session.peer_gone(generation, "process exited");
                    return;
                }
            }
        }
    }
}
