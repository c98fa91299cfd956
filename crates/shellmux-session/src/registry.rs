use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::events::{SessionEvent, SessionEventKind, SessionId, SessionStatus};
use crate::session::ShellSession;
use crate::spawn::{SpawnSpec, Spawner};

/// Snapshot of one registered session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub program: String,
    pub status: SessionStatus,
    pub interpreter: Option<String>,
    pub current: bool,
}

/// The controller's sessions, in creation order, plus the current one.
///
/// Owned by a single coordinator task. The current id, when set, always names
/// a registered session; removing it picks the most recently active survivor
/// in the same call.
pub struct SessionRegistry<S: Spawner> {
    spawner: Arc<S>,
    config: SessionConfig,
    events: mpsc::UnboundedSender<SessionEvent>,
    sessions: Vec<(SessionId, ShellSession<S>)>,
    /// Least recently active first.
    activity: Vec<SessionId>,
    acknowledged: HashSet<SessionId>,
    current: Option<SessionId>,
    next_id: u64,
}

impl<S: Spawner> SessionRegistry<S> {
    /// Create an empty registry. Events from every session arrive on the
    /// returned receiver.
    pub fn new(
        spawner: Arc<S>,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let registry = Self {
            spawner,
            config,
            events,
            sessions: Vec::new(),
            activity: Vec::new(),
            acknowledged: HashSet::new(),
            current: None,
            next_id: 0,
        };
        (registry, rx)
    }

    /// Spawn a session and make it current.
    ///
    /// Nothing is registered when the spawn fails.
    pub async fn create_session(&mut self, spec: SpawnSpec) -> Result<SessionId> {
        let session = self.launch(spec).await?;
        Ok(self.insert(session))
    }

    /// Start a session without registering it.
    ///
    /// The returned future borrows nothing from the registry, so a
    /// coordinator can run it on another task and keep serving. Pass the
    /// session to [`insert`](Self::insert) once it has started. The id is
    /// taken now; a failed start leaves a gap.
    pub fn launch(
        &mut self,
        spec: SpawnSpec,
    ) -> impl Future<Output = Result<ShellSession<S>>> + Send + 'static {
        self.next_id += 1;
        ShellSession::start(
            SessionId(self.next_id),
            spec,
            Arc::clone(&self.spawner),
            self.config.clone(),
            self.events.clone(),
        )
    }

    /// Register a started session and make it current.
    pub fn insert(&mut self, session: ShellSession<S>) -> SessionId {
        self.prune();
        let id = session.id();
        self.sessions.push((id, session));
        self.mark_active(id);
        self.current = Some(id);
        info!(session = %id, "session registered");
        id
    }

    pub fn get_current(&mut self) -> Option<ShellSession<S>> {
        self.prune();
        self.current.and_then(|id| self.lookup(id))
    }

    pub fn current_id(&mut self) -> Option<SessionId> {
        self.prune();
        self.current
    }

    pub fn get(&mut self, id: SessionId) -> Option<ShellSession<S>> {
        self.prune();
        self.lookup(id)
    }

    pub fn set_current(&mut self, id: SessionId) -> Result<()> {
        self.prune();
        if self.lookup(id).is_none() {
            return Err(SessionError::UnknownSession(id));
        }
        self.current = Some(id);
        self.mark_active(id);
        Ok(())
    }

    /// Unregister and terminate a session.
    pub async fn close_session(&mut self, id: SessionId) -> Result<()> {
        self.detach(id)?.terminate().await
    }

    /// Unregister a session and hand it over; terminating it is up to the
    /// caller. A new current session is picked right away.
    pub fn detach(&mut self, id: SessionId) -> Result<ShellSession<S>> {
        let session = self
            .remove(id)
            .ok_or(SessionError::UnknownSession(id))?;
        info!(session = %id, current = ?self.current, "session closed");
        Ok(session)
    }

    pub fn list(&mut self) -> Vec<SessionInfo> {
        self.prune();
        self.sessions
            .iter()
            .map(|(id, session)| SessionInfo {
                id: *id,
                program: session.spec().program.clone(),
                status: session.status(),
                interpreter: session.interpreter(),
                current: self.current == Some(*id),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// The collaborator has seen this session die; it may be pruned.
    pub fn acknowledge(&mut self, id: SessionId) {
        if self.lookup(id).is_some() {
            self.acknowledged.insert(id);
        }
        self.prune();
    }

    /// Record activity on a session.
    pub fn touch(&mut self, id: SessionId) {
        if self.lookup(id).is_some() {
            self.mark_active(id);
        }
    }

    /// Feed a session event; a session turning busy counts as activity.
    pub fn observe(&mut self, event: &SessionEvent) {
        if let SessionEventKind::StatusChanged {
            status: SessionStatus::Busy,
            ..
        } = event.kind
        {
            self.touch(event.session);
        }
    }

    /// Drop dead sessions that were acknowledged. Returns their ids.
    pub fn prune(&mut self) -> Vec<SessionId> {
        let doomed: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(id, session)| {
                self.acknowledged.contains(id) && session.status().is_dead()
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &doomed {
            self.remove(*id);
            debug!(session = %id, "pruned dead session");
        }
        doomed
    }

    /// Terminate every session and empty the registry.
    pub async fn shutdown(&mut self) {
        let sessions: Vec<_> = self.sessions.drain(..).collect();
        self.activity.clear();
        self.acknowledged.clear();
        self.current = None;
        for (id, session) in sessions {
            if let Err(err) = session.terminate().await {
                debug!(session = %id, error = %err, "terminate during shutdown failed");
            }
        }
    }

    fn lookup(&self, id: SessionId) -> Option<ShellSession<S>> {
        self.sessions
            .iter()
            .find(|(sid, _)| *sid == id)
            .map(|(_, session)| session.clone())
    }

    fn mark_active(&mut self, id: SessionId) {
        self.activity.retain(|a| *a != id);
        self.activity.push(id);
    }

    fn remove(&mut self, id: SessionId) -> Option<ShellSession<S>> {
        let index = self.sessions.iter().position(|(sid, _)| *sid == id)?;
        let (_, session) = self.sessions.remove(index);
        self.activity.retain(|a| *a != id);
        self.acknowledged.remove(&id);
        if self.current == Some(id) {
            self.current = self.activity.last().copied();
        }
        Some(session)
    }
}

impl<S: Spawner> std::fmt::Debug for SessionRegistry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("current", &self.current)
            .finish()
    }
}
