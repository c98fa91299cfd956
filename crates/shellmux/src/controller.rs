//! The coordinator: one task owns the session registry.
//!
//! Session events, forwarded launches and requests from the UI side all
//! arrive on channels and are handled in turn. Work that talks to a peer
//! (execute, interrupt, introspect) happens on the caller's task through a
//! cloned [`ShellSession`]. Starting and closing shells run on tasks of
//! their own and report back, so a slow interpreter never stalls the loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use shellmux_instance::ForwardedCommand;
use shellmux_session::{
    Execution, Result as SessionResult, SessionConfig, SessionError, SessionEvent, SessionId,
    SessionInfo, SessionRegistry, ShellSession, SpawnSpec, Spawner,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Marker naming the controller's process id, set in every interpreter's environment.
pub const CONTROLLER_PID_ENV: &str = "SHELLMUX_CONTROLLER_PID";
/// Marker naming the controller's version.
pub const CONTROLLER_VERSION_ENV: &str = "SHELLMUX_CONTROLLER_VERSION";

/// Notification for the UI collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    Session(SessionEvent),
    /// A launch asked for this file.
    OpenFile(PathBuf),
    /// A launch without arguments: bring the window forward.
    Focus,
    ShellStarted {
        id: SessionId,
        program: String,
    },
    ShellFailed {
        program: String,
        reason: String,
    },
}

/// One thing a command line asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    OpenFile(PathBuf),
    Focus,
    StartShell(SpawnSpec),
}

/// Turns a forwarded command line into actions.
pub trait ArgsHandler: Send + 'static {
    fn handle(&mut self, command: &ForwardedCommand) -> Vec<Action>;
}

/// `--shell=<program [args]>` starts a shell, other arguments are files
/// relative to the launch's directory, and no arguments means focus.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultArgsHandler;

impl ArgsHandler for DefaultArgsHandler {
    fn handle(&mut self, command: &ForwardedCommand) -> Vec<Action> {
        let cwd = Path::new(&command.cwd);
        let mut actions = Vec::new();
        let mut files_only = false;
        let mut args = command.argv.iter();

        while let Some(arg) = args.next() {
            if files_only {
                actions.push(Action::OpenFile(resolve(cwd, arg)));
            } else if arg == "--" {
                files_only = true;
            } else if let Some(program) = arg.strip_prefix("--shell=") {
                push_shell(&mut actions, program, cwd);
            } else if arg == "--shell" {
                match args.next() {
                    Some(program) => push_shell(&mut actions, program, cwd),
                    None => warn!("--shell without a program"),
                }
            } else if arg.starts_with('-') && arg.len() > 1 {
                debug!(arg = %arg, "ignoring unknown option");
            } else {
                actions.push(Action::OpenFile(resolve(cwd, arg)));
            }
        }

        if actions.is_empty() {
            actions.push(Action::Focus);
        }
        actions
    }
}

fn push_shell(actions: &mut Vec<Action>, command_line: &str, cwd: &Path) {
    let mut words = command_line.split_whitespace();
    let Some(program) = words.next() else {
        warn!("--shell with an empty program");
        return;
    };
    let mut spec = words.fold(SpawnSpec::new(program), |spec, word| spec.arg(word));
    if !cwd.as_os_str().is_empty() {
        spec = spec.cwd(cwd);
    }
    actions.push(Action::StartShell(spec));
}

fn resolve(cwd: &Path, arg: &str) -> PathBuf {
    let path = Path::new(arg);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

enum Request<S: Spawner> {
    Dispatch {
        command: ForwardedCommand,
        done: oneshot::Sender<()>,
    },
    StartShell {
        spec: SpawnSpec,
        reply: oneshot::Sender<Result<SessionId>>,
    },
    /// `None` means the current session.
    Session {
        target: Option<SessionId>,
        reply: oneshot::Sender<Result<ShellSession<S>>>,
    },
    Close {
        id: SessionId,
        reply: oneshot::Sender<Result<()>>,
    },
    SetCurrent {
        id: SessionId,
        reply: oneshot::Sender<Result<()>>,
    },
    Acknowledge(SessionId),
    List(oneshot::Sender<Vec<SessionInfo>>),
    Shutdown,
}

/// Answers a dispatch once every shell it started is registered or failed.
struct DispatchDone(Option<oneshot::Sender<()>>);

impl Drop for DispatchDone {
    fn drop(&mut self) {
        if let Some(done) = self.0.take() {
            let _ = done.send(());
        }
    }
}

/// A shell start that finished on its own task.
struct Launched<S: Spawner> {
    program: String,
    result: SessionResult<ShellSession<S>>,
    reply: Option<oneshot::Sender<Result<SessionId>>>,
    dispatch: Option<Arc<DispatchDone>>,
}

/// Owns the [`SessionRegistry`] and runs the coordinator loop.
pub struct Controller<S: Spawner, H: ArgsHandler = DefaultArgsHandler> {
    registry: SessionRegistry<S>,
    session_events: mpsc::UnboundedReceiver<SessionEvent>,
    commands: Option<mpsc::UnboundedReceiver<ForwardedCommand>>,
    requests: mpsc::UnboundedReceiver<Request<S>>,
    launched_tx: mpsc::UnboundedSender<Launched<S>>,
    launched: mpsc::UnboundedReceiver<Launched<S>>,
    events: mpsc::UnboundedSender<ControllerEvent>,
    handler: H,
}

impl<S: Spawner, H: ArgsHandler> Controller<S, H> {
    /// Build a controller, the handle to drive it and the stream of events it emits.
    ///
    /// The controller markers are added to `config` unless already present.
    pub fn new(
        spawner: Arc<S>,
        config: SessionConfig,
        handler: H,
    ) -> (
        Self,
        ControllerHandle<S>,
        mpsc::UnboundedReceiver<ControllerEvent>,
    ) {
        let config = with_controller_markers(config);
        let (registry, session_events) = SessionRegistry::new(spawner, config);
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (launched_tx, launched) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let controller = Self {
            registry,
            session_events,
            commands: None,
            requests,
            launched_tx,
            launched,
            events,
            handler,
        };
        (
            controller,
            ControllerHandle {
                requests: requests_tx,
            },
            events_rx,
        )
    }

    /// Also serve commands forwarded by a [`shellmux_instance::CommandServer`].
    pub fn with_commands(mut self, commands: mpsc::UnboundedReceiver<ForwardedCommand>) -> Self {
        self.commands = Some(commands);
        self
    }

    /// Run until `cancel` fires or a handle asks for shutdown, then terminate
    /// every session.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("controller started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(event) = self.session_events.recv() => self.on_session_event(event),
                Some(launched) = self.launched.recv() => self.on_launched(launched),
                command = next_command(&mut self.commands) => match command {
                    Some(command) => self.dispatch(command, None),
                    None => {
                        debug!("command queue closed");
                        self.commands = None;
                    }
                },
                request = self.requests.recv() => match request {
                    Some(Request::Shutdown) | None => break,
                    Some(request) => self.on_request(request),
                },
            }
        }
        self.registry.shutdown().await;
        info!("controller stopped");
    }

    fn on_session_event(&mut self, event: SessionEvent) {
        self.registry.observe(&event);
        self.emit(ControllerEvent::Session(event));
    }

    fn dispatch(&mut self, command: ForwardedCommand, done: Option<Arc<DispatchDone>>) {
        let actions = self.handler.handle(&command);
        debug!(args = ?command.argv, actions = actions.len(), "dispatching command");
        for action in actions {
            match action {
                Action::OpenFile(path) => self.emit(ControllerEvent::OpenFile(path)),
                Action::Focus => self.emit(ControllerEvent::Focus),
                // The outcome is reported as a ShellStarted or ShellFailed event.
                Action::StartShell(spec) => self.start_shell(spec, None, done.clone()),
            }
        }
    }

    fn on_request(&mut self, request: Request<S>) {
        match request {
            Request::Dispatch { command, done } => {
                self.dispatch(command, Some(Arc::new(DispatchDone(Some(done)))));
            }
            Request::StartShell { spec, reply } => self.start_shell(spec, Some(reply), None),
            Request::Session { target, reply } => {
                let _ = reply.send(self.resolve(target));
            }
            Request::Close { id, reply } => match self.registry.detach(id) {
                Ok(session) => {
                    tokio::spawn(async move {
                        let result = session.terminate().await.map_err(Error::from);
                        let _ = reply.send(result);
                    });
                }
                Err(err) => {
                    let _ = reply.send(Err(err.into()));
                }
            },
            Request::SetCurrent { id, reply } => {
                let _ = reply.send(self.registry.set_current(id).map_err(Error::from));
            }
            Request::Acknowledge(id) => {
                self.registry.acknowledge(id);
            }
            Request::List(reply) => {
                let _ = reply.send(self.registry.list());
            }
            Request::Shutdown => {}
        }
    }

    /// Spawn the shell on its own task; [`Self::on_launched`] registers it.
    fn start_shell(
        &mut self,
        spec: SpawnSpec,
        reply: Option<oneshot::Sender<Result<SessionId>>>,
        dispatch: Option<Arc<DispatchDone>>,
    ) {
        let program = spec.program.clone();
        debug!(program = %program, "starting shell");
        let launch = self.registry.launch(spec);
        let launched = self.launched_tx.clone();
        tokio::spawn(async move {
            let result = launch.await;
            // Gone only once the loop has stopped; the session shuts down on drop.
            let _ = launched.send(Launched {
                program,
                result,
                reply,
                dispatch,
            });
        });
    }

    fn on_launched(&mut self, launched: Launched<S>) {
        let Launched {
            program,
            result,
            reply,
            dispatch,
        } = launched;
        let result = match result {
            Ok(session) => {
                let id = self.registry.insert(session);
                info!(session = %id, program = %program, "shell started");
                self.emit(ControllerEvent::ShellStarted { id, program });
                Ok(id)
            }
            Err(err) => {
                warn!(program = %program, error = %err, "shell failed to start");
                self.emit(ControllerEvent::ShellFailed {
                    program,
                    reason: err.to_string(),
                });
                Err(err.into())
            }
        };
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
        drop(dispatch);
    }

    fn resolve(&mut self, target: Option<SessionId>) -> Result<ShellSession<S>> {
        let session = match target {
            Some(id) => self
                .registry
                .get(id)
                .ok_or(Error::Session(SessionError::UnknownSession(id)))?,
            None => self.registry.get_current().ok_or(Error::NoSession)?,
        };
        self.registry.touch(session.id());
        Ok(session)
    }

    fn emit(&self, event: ControllerEvent) {
        if self.events.send(event).is_err() {
            debug!("controller event dropped; no listener");
        }
    }
}

async fn next_command(
    commands: &mut Option<mpsc::UnboundedReceiver<ForwardedCommand>>,
) -> Option<ForwardedCommand> {
    match commands {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn with_controller_markers(mut config: SessionConfig) -> SessionConfig {
    config
        .markers
        .entry(CONTROLLER_PID_ENV.to_string())
        .or_insert_with(|| std::process::id().to_string());
    config
        .markers
        .entry(CONTROLLER_VERSION_ENV.to_string())
        .or_insert_with(|| env!("CARGO_PKG_VERSION").to_string());
    config
}

/// Cheap, cloneable access to a running [`Controller`].
///
/// Every call fails with [`Error::ControllerStopped`] once the loop has exited.
pub struct ControllerHandle<S: Spawner> {
    requests: mpsc::UnboundedSender<Request<S>>,
}

impl<S: Spawner> Clone for ControllerHandle<S> {
    fn clone(&self) -> Self {
        Self {
            requests: self.requests.clone(),
        }
    }
}

impl<S: Spawner> ControllerHandle<S> {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request<S>) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(make(tx))
            .map_err(|_| Error::ControllerStopped)?;
        rx.await.map_err(|_| Error::ControllerStopped)
    }

    /// Run a command line through the argument handler, as if forwarded.
    ///
    /// Returns once its actions are done: shells it starts are registered,
    /// or have failed, by then. The loop keeps serving meanwhile.
    pub async fn dispatch(&self, command: ForwardedCommand) -> Result<()> {
        self.call(|done| Request::Dispatch { command, done }).await
    }

    /// Spawn a shell session; it becomes current.
    pub async fn start_shell(&self, spec: SpawnSpec) -> Result<SessionId> {
        self.call(|reply| Request::StartShell { spec, reply }).await?
    }

    pub async fn session(&self, id: SessionId) -> Result<ShellSession<S>> {
        self.call(|reply| Request::Session {
            target: Some(id),
            reply,
        })
        .await?
    }

    pub async fn current(&self) -> Result<ShellSession<S>> {
        self.call(|reply| Request::Session {
            target: None,
            reply,
        })
        .await?
    }

    /// Execute `code` in the current session.
    pub async fn execute(&self, code: impl Into<String>) -> Result<Execution> {
        Ok(self.current().await?.execute(code).await?)
    }

    pub async fn interrupt(&self) -> Result<()> {
        Ok(self.current().await?.interrupt().await?)
    }

    pub async fn restart(&self) -> Result<()> {
        Ok(self.current().await?.restart().await?)
    }

    pub async fn introspect(&self, method: &str, params: Value) -> Result<Value> {
        Ok(self.current().await?.introspect(method, params).await?)
    }

    /// Unregister and terminate a session.
    ///
    /// The session is gone from the registry at once; the call returns when
    /// the peer has exited.
    pub async fn close_shell(&self, id: SessionId) -> Result<()> {
        self.call(|reply| Request::Close { id, reply }).await?
    }

    pub async fn set_current(&self, id: SessionId) -> Result<()> {
        self.call(|reply| Request::SetCurrent { id, reply }).await?
    }

    /// The UI has seen `id` die; it may be pruned.
    pub fn acknowledge(&self, id: SessionId) -> Result<()> {
        self.requests
            .send(Request::Acknowledge(id))
            .map_err(|_| Error::ControllerStopped)
    }

    pub async fn list(&self) -> Result<Vec<SessionInfo>> {
        self.call(Request::List).await
    }

    /// Ask the loop to stop; sessions are terminated before it exits.
    pub fn shutdown(&self) {
        let _ = self.requests.send(Request::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use shellmux_mux::MuxConfig;
    use shellmux_session::{
        OutputSource, PeerEndpoint, ProcessHandle, SessionEventKind, SessionStatus, SpawnedPeer,
    };
    use tokio::task::AbortHandle;

    use super::*;
    use crate::echo::EchoPeer;

    const WAIT: Duration = Duration::from_secs(5);

    /// Runs the echo interpreter as a task behind an in-memory pipe.
    struct EchoSpawner;

    struct TaskProcess(AbortHandle);

    impl ProcessHandle for TaskProcess {
        fn id(&self) -> Option<u32> {
            None
        }

        fn is_alive(&mut self) -> bool {
            !self.0.is_finished()
        }

        fn kill(&mut self) {
            self.0.abort();
        }
    }

    impl Spawner for EchoSpawner {
        async fn spawn(
            &self,
            spec: &SpawnSpec,
            markers: &BTreeMap<String, String>,
        ) -> shellmux_session::Result<SpawnedPeer> {
            match spec.program.as_str() {
                "missing" => return Err(SessionError::Spawn("no such program".into())),
                // Never connects.
                "hang" => std::future::pending::<()>().await,
                _ => {}
            }
            let (ours, theirs) = tokio::io::duplex(64 * 1024);
            let mut peer = PeerEndpoint::new(theirs, MuxConfig::default())?;
            let env = markers.clone();
            let task = if spec.program == "deaf" {
                // Says hello, then ignores everything until killed.
                tokio::spawn(async move {
                    let _ = peer.hello("deaf 0.1", Value::Null).await;
                    while peer.next_event().await.is_some() {}
                    std::future::pending::<()>().await;
                })
            } else {
                tokio::spawn(async move {
                    let _ = EchoPeer::new(peer).with_env(env).run().await;
                })
            };
            Ok(SpawnedPeer {
                io: Box::new(ours),
                process: Box::new(TaskProcess(task.abort_handle())),
            })
        }
    }

    fn config() -> SessionConfig {
        SessionConfig::default()
            .with_handshake_timeout(Duration::from_secs(2))
            .with_interrupt_grace(Duration::from_secs(1))
            .with_terminate_grace(Duration::from_millis(300))
            .with_liveness_interval(Duration::from_millis(20))
    }

    fn start() -> (
        ControllerHandle<EchoSpawner>,
        mpsc::UnboundedReceiver<ControllerEvent>,
        mpsc::UnboundedSender<ForwardedCommand>,
        tokio::task::JoinHandle<()>,
    ) {
        start_with(config())
    }

    fn start_with(
        config: SessionConfig,
    ) -> (
        ControllerHandle<EchoSpawner>,
        mpsc::UnboundedReceiver<ControllerEvent>,
        mpsc::UnboundedSender<ForwardedCommand>,
        tokio::task::JoinHandle<()>,
    ) {
        let (controller, handle, events) =
            Controller::new(Arc::new(EchoSpawner), config, DefaultArgsHandler);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let running = tokio::spawn(
            controller
                .with_commands(commands_rx)
                .run(CancellationToken::new()),
        );
        (handle, events, commands_tx, running)
    }

    fn forwarded(argv: &[&str]) -> ForwardedCommand {
        ForwardedCommand {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            cwd: "/work".to_string(),
            reply_expected: true,
        }
    }

    /// Next event that is not a session event.
    async fn next_controller_event(
        events: &mut mpsc::UnboundedReceiver<ControllerEvent>,
    ) -> ControllerEvent {
        loop {
            let event = tokio::time::timeout(WAIT, events.recv())
                .await
                .expect("event in time")
                .expect("controller alive");
            if !matches!(event, ControllerEvent::Session(_)) {
                return event;
            }
        }
    }

    async fn stdout_of(execution: Execution) -> String {
        let (output, outcome) = tokio::time::timeout(WAIT, execution.collect())
            .await
            .unwrap();
        assert_eq!(outcome, shellmux_session::ExecutionOutcome::Completed);
        output
            .iter()
            .filter(|event| event.source == OutputSource::Stdout)
            .map(|event| String::from_utf8_lossy(&event.data).into_owned())
            .collect()
    }

    #[test]
    fn default_handler_actions() {
        let mut handler = DefaultArgsHandler;
        assert_eq!(handler.handle(&forwarded(&[])), vec![Action::Focus]);
        assert_eq!(
            handler.handle(&forwarded(&["notes.txt", "/etc/hosts"])),
            vec![
                Action::OpenFile(PathBuf::from("/work/notes.txt")),
                Action::OpenFile(PathBuf::from("/etc/hosts")),
            ]
        );
        assert_eq!(
            handler.handle(&forwarded(&["--shell=python3 -i"])),
            vec![Action::StartShell(
                SpawnSpec::new("python3").arg("-i").cwd("/work")
            )]
        );
        assert_eq!(
            handler.handle(&forwarded(&["--shell", "bash", "--", "--weird-name"])),
            vec![
                Action::StartShell(SpawnSpec::new("bash").cwd("/work")),
                Action::OpenFile(PathBuf::from("/work/--weird-name")),
            ]
        );
        assert_eq!(handler.handle(&forwarded(&["--verbose"])), vec![Action::Focus]);
    }

    #[tokio::test]
    async fn forwarded_files_and_focus_become_events() {
        let (handle, mut events, commands, _running) = start();

        commands.send(forwarded(&["a.rs", "b.rs"])).unwrap();
        assert_eq!(
            next_controller_event(&mut events).await,
            ControllerEvent::OpenFile(PathBuf::from("/work/a.rs"))
        );
        assert_eq!(
            next_controller_event(&mut events).await,
            ControllerEvent::OpenFile(PathBuf::from("/work/b.rs"))
        );

        handle.dispatch(forwarded(&[])).await.unwrap();
        assert_eq!(next_controller_event(&mut events).await, ControllerEvent::Focus);
        handle.shutdown();
    }

    #[tokio::test]
    async fn forwarded_shell_starts_and_executes() {
        let (handle, mut events, commands, _running) = start();

        commands.send(forwarded(&["--shell=echo"])).unwrap();
        let id = match next_controller_event(&mut events).await {
            ControllerEvent::ShellStarted { id, program } => {
                assert_eq!(program, "echo");
                id
            }
            other => panic!("expected ShellStarted, got {other:?}"),
        };

        let sessions = handle.list().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, id);
        assert!(sessions[0].current);

        let out = stdout_of(handle.execute("hello").await.unwrap()).await;
        assert_eq!(out, "hello\n");
        handle.shutdown();
    }

    #[tokio::test]
    async fn interpreters_see_the_controller_markers() {
        let (handle, _events, _commands, _running) = start();
        handle.start_shell(SpawnSpec::new("echo")).await.unwrap();

        let pid = stdout_of(handle.execute("env:SHELLMUX_CONTROLLER_PID").await.unwrap()).await;
        assert_eq!(pid.trim(), std::process::id().to_string());
        let version =
            stdout_of(handle.execute("env:SHELLMUX_CONTROLLER_VERSION").await.unwrap()).await;
        assert_eq!(version.trim(), env!("CARGO_PKG_VERSION"));
        handle.shutdown();
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_and_registers_nothing() {
        let (handle, mut events, _commands, _running) = start();

        let err = handle.start_shell(SpawnSpec::new("missing")).await.unwrap_err();
        assert!(matches!(err, Error::Session(SessionError::Spawn(_))));
        match next_controller_event(&mut events).await {
            ControllerEvent::ShellFailed { program, reason } => {
                assert_eq!(program, "missing");
                assert!(reason.contains("no such program"));
            }
            other => panic!("expected ShellFailed, got {other:?}"),
        }
        assert!(handle.list().await.unwrap().is_empty());
        assert!(matches!(handle.execute("x").await, Err(Error::NoSession)));
        handle.shutdown();
    }

    #[tokio::test]
    async fn interrupt_and_introspect_through_the_handle() {
        let (handle, _events, _commands, _running) = start();
        handle.start_shell(SpawnSpec::new("echo")).await.unwrap();
        handle.current().await.unwrap().wait_ready().await.unwrap();

        let completions = handle
            .introspect("complete", serde_json::json!({"prefix": "s"}))
            .await
            .unwrap();
        assert_eq!(completions, serde_json::json!(["sleep"]));

        let execution = handle.execute("sleep:5000").await.unwrap();
        let session = handle.current().await.unwrap();
        let mut status = session.watch_status();
        tokio::time::timeout(WAIT, status.wait_for(|s| *s == SessionStatus::Busy))
            .await
            .unwrap()
            .unwrap();
        handle.interrupt().await.unwrap();

        let (_, outcome) = tokio::time::timeout(WAIT, execution.collect())
            .await
            .unwrap();
        assert_eq!(outcome, shellmux_session::ExecutionOutcome::Interrupted);
        assert_eq!(session.status(), SessionStatus::Ready);
        handle.shutdown();
    }

    #[tokio::test]
    async fn hanging_shell_start_does_not_stall_other_shells() {
        let (handle, _events, _commands, _running) = start();
        let healthy = handle.start_shell(SpawnSpec::new("echo")).await.unwrap();
        handle.current().await.unwrap().wait_ready().await.unwrap();

        let quick = Duration::from_secs(1);
        let dispatching = handle.clone();
        let dispatch = tokio::spawn(async move {
            dispatching.dispatch(forwarded(&["--shell=hang"])).await
        });
        let starting = handle.clone();
        let hung = tokio::spawn(async move { starting.start_shell(SpawnSpec::new("hang")).await });
        // Both requests reach the loop ahead of the execute below.
        tokio::task::yield_now().await;

        let out = tokio::time::timeout(quick, async {
            stdout_of(handle.execute("still here").await.unwrap()).await
        })
        .await
        .expect("healthy shell should answer while another one starts");
        assert_eq!(out, "still here
");
        assert_eq!(handle.list().await.unwrap().len(), 1);
        assert_eq!(handle.current().await.unwrap().id(), healthy);
        assert!(!hung.is_finished());
        assert!(!dispatch.is_finished());

        hung.abort();
        dispatch.abort();
        handle.shutdown();
    }

    #[tokio::test]
    async fn closing_a_stuck_shell_does_not_stall_other_shells() {
        let grace = Duration::from_secs(2);
        let (handle, _events, _commands, _running) =
            start_with(config().with_terminate_grace(grace));
        let deaf = handle.start_shell(SpawnSpec::new("deaf")).await.unwrap();
        let echo = handle.start_shell(SpawnSpec::new("echo")).await.unwrap();
        handle.session(deaf).await.unwrap().wait_ready().await.unwrap();
        handle.session(echo).await.unwrap().wait_ready().await.unwrap();

        let closing = handle.clone();
        let started = tokio::time::Instant::now();
        let close = tokio::spawn(async move { closing.close_shell(deaf).await });

        tokio::time::timeout(WAIT, async {
            while handle.list().await.unwrap().len() != 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("closed shell should be unregistered at once");
        let out = tokio::time::timeout(Duration::from_secs(1), async {
            stdout_of(handle.execute("quick").await.unwrap()).await
        })
        .await
        .expect("other shells should answer while one is closing");
        assert_eq!(out, "quick
");
        assert_eq!(handle.current().await.unwrap().id(), echo);
        assert!(started.elapsed() < grace);

        tokio::time::timeout(WAIT, close).await.unwrap().unwrap().unwrap();
        assert!(started.elapsed() >= grace, "deaf peer is killed after the grace period");
        handle.shutdown();
    }

    #[tokio::test]
    async fn closing_current_falls_back_to_another_session() {
        let (handle, _events, _commands, _running) = start();
        let first = handle.start_shell(SpawnSpec::new("echo")).await.unwrap();
        let second = handle.start_shell(SpawnSpec::new("echo")).await.unwrap();
        assert_eq!(handle.current().await.unwrap().id(), second);

        handle.close_shell(second).await.unwrap();
        assert_eq!(handle.current().await.unwrap().id(), first);
        assert!(matches!(
            handle.session(second).await,
            Err(Error::Session(SessionError::UnknownSession(_)))
        ));

        handle.set_current(first).await.unwrap();
        assert!(handle.set_current(second).await.is_err());
        handle.shutdown();
    }

    #[tokio::test]
    async fn dead_sessions_are_pruned_after_acknowledgement() {
        let (handle, mut events, _commands, _running) = start();
        let id = handle.start_shell(SpawnSpec::new("echo")).await.unwrap();
        let session = handle.current().await.unwrap();
        session.wait_ready().await.unwrap();

        // `exit` makes the echo peer say goodbye and hang up.
        let _ = handle.execute("exit").await.unwrap();
        loop {
            let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
            if let ControllerEvent::Session(SessionEvent {
                session,
                kind: SessionEventKind::StatusChanged { status, .. },
            }) = event
            {
                if session == id && status.is_dead() {
                    break;
                }
            }
        }
        assert_eq!(handle.list().await.unwrap().len(), 1);

        handle.acknowledge(id).unwrap();
        assert!(handle.list().await.unwrap().is_empty());
        handle.shutdown();
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop_and_the_sessions() {
        let (handle, _events, _commands, running) = start();
        handle.start_shell(SpawnSpec::new("echo")).await.unwrap();
        let session = handle.current().await.unwrap();
        session.wait_ready().await.unwrap();

        handle.shutdown();
        tokio::time::timeout(WAIT, running).await.unwrap().unwrap();
        assert!(session.status().is_dead());
        assert!(matches!(handle.list().await, Err(Error::ControllerStopped)));
    }
}
