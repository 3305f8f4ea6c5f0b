//! Connection hub: one actor task per client connection.
//!
//! Each connection owns an inbound command channel (fed by the transport),
//! an outbound event channel (drained by the transport), and at most one
//! session subscription. The actor is the only code that touches its
//! connection state, so there is no shared per-connection lock.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use th_core::collab::{AuthError, Authenticator};
use th_core::types::{Scope, ScopeKey, SessionId, SessionState, UserId};
use th_session::{Input, RegistryError, Session, SessionError, SessionEvent, SessionRegistry};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::connection::{ConnectionEvent, ConnectionStateMachine, Liveness};
use crate::protocol::{ClientEvent, CloseReason, ErrorKind, Resume, ServerEvent};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum HubError {
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    #[error("connection is not bound to session {0}")]
    NotBound(SessionId),

    #[error("no session is bound to this connection")]
    NothingBound,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl HubError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HubError::Unauthorized(_) => ErrorKind::Unauthorized,
            HubError::NotBound(_) | HubError::NothingBound => ErrorKind::NotBound,
            HubError::Registry(e) => match e {
                RegistryError::ScopeNotFound(_) => ErrorKind::ScopeNotFound,
                RegistryError::SessionDead(_) => ErrorKind::SessionDead,
                RegistryError::AtCapacity { .. } | RegistryError::SpawnFailed(_) => {
                    ErrorKind::SpawnFailed
                }
                RegistryError::NotFound(_) => ErrorKind::Internal,
            },
            HubError::Session(SessionError::SessionDead) => ErrorKind::SessionDead,
            HubError::Session(_) => ErrorKind::Internal,
        }
    }

    fn to_event(&self) -> ServerEvent {
        ServerEvent::error(self.kind(), self.to_string())
    }
}

// ---------------------------------------------------------------------------
// Config / handles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of each connection's session subscription. A subscriber that
    /// falls this far behind is dropped and told `lagged`.
    pub subscriber_queue: usize,
    /// Capacity of the actor -> transport channel.
    pub outbound_queue: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            subscriber_queue: 256,
            outbound_queue: 64,
        }
    }
}

/// The transport's end of a connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: Uuid,
    pub inbound: flume::Sender<ClientEvent>,
    pub outbound: flume::Receiver<ServerEvent>,
    pub liveness: Arc<Liveness>,
}

impl ConnectionHandle {
    /// Queue a client event. Returns `false` once the connection is closed.
    pub fn send(&self, event: ClientEvent) -> bool {
        self.liveness.touch();
        self.inbound.send(event).is_ok()
    }

    /// Next server event, or `None` once the connection is closed.
    pub async fn recv(&self) -> Option<ServerEvent> {
        self.outbound.recv_async().await.ok()
    }
}

struct ConnectionEntry {
    liveness: Arc<Liveness>,
    close_tx: flume::Sender<CloseReason>,
    task: JoinHandle<()>,
}

/// Live counters for `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub sessions: usize,
}

// ---------------------------------------------------------------------------
// ConnectionHub
// ---------------------------------------------------------------------------

pub struct ConnectionHub {
    registry: Arc<SessionRegistry>,
    auth: Arc<dyn Authenticator>,
    config: HubConfig,
    connections: DashMap<Uuid, ConnectionEntry>,
}

impl ConnectionHub {
    pub fn new(
        registry: Arc<SessionRegistry>,
        auth: Arc<dyn Authenticator>,
        config: HubConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            auth,
            config,
            connections: DashMap::new(),
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.auth
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.connections.len(),
            sessions: self.registry.len(),
        }
    }

    /// Accept a new connection and start its actor.
    pub fn connect(self: &Arc<Self>) -> ConnectionHandle {
        let id = Uuid::new_v4();
        let (inbound_tx, inbound_rx) = flume::unbounded();
        let (outbound_tx, outbound_rx) = flume::bounded(self.config.outbound_queue.max(1));
        let (close_tx, close_rx) = flume::bounded(1);
        let liveness = Arc::new(Liveness::new());

        let actor = ConnectionActor {
            id,
            hub: self.clone(),
            machine: ConnectionStateMachine::new(),
            binding: None,
            outbound: outbound_tx,
        };
        let span = th_telemetry::request_id::connection_span(id);
        let task = tokio::spawn(actor.run(inbound_rx, close_rx).instrument(span));

        self.connections.insert(
            id,
            ConnectionEntry {
                liveness: liveness.clone(),
                close_tx,
                task,
            },
        );
        info!(conn_id = %id, "connection opened");

        ConnectionHandle {
            id,
            inbound: inbound_tx,
            outbound: outbound_rx,
            liveness,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Ask a connection to close. The client receives `closed{reason}`.
    pub fn close_connection(&self, id: Uuid, reason: CloseReason) -> bool {
        match self.connections.get(&id) {
            Some(entry) => entry.close_tx.try_send(reason).is_ok(),
            None => false,
        }
    }

    /// Close connections that have been silent for longer than `timeout`.
    /// Returns how many were closed.
    pub fn reap_dead_connections(&self, timeout: Duration) -> usize {
        let stale: Vec<Uuid> = self
            .connections
            .iter()
            .filter(|e| e.value().liveness.silent_for() > timeout)
            .map(|e| *e.key())
            .collect();
        for id in &stale {
            warn!(conn_id = %id, "connection missed liveness deadline");
            self.close_connection(*id, CloseReason::Timeout);
        }
        stale.len()
    }

    /// Close every connection, e.g. on daemon shutdown.
    pub fn close_all(&self, reason: CloseReason) {
        for entry in self.connections.iter() {
            let _ = entry.value().close_tx.try_send(reason);
        }
    }

    /// Abort actors that did not exit on their own after `close_all`.
    pub fn abort_all(&self) {
        for entry in self.connections.iter() {
            entry.value().task.abort();
        }
        self.connections.clear();
    }

    pub fn session_status(&self, key: &ScopeKey) -> Option<SessionState> {
        self.registry.status(key)
    }

    /// Tear down the session for `key` (e.g. when its project is deleted).
    /// Bound connections receive `closed{destroyed}`.
    pub async fn destroy_session(&self, key: &ScopeKey) -> Option<SessionId> {
        self.registry.destroy_scope(key).await
    }

    fn forget(&self, id: Uuid) {
        self.connections.remove(&id);
    }
}

impl std::fmt::Debug for ConnectionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHub")
            .field("connections", &self.connections.len())
            .field("registry", &self.registry)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ConnectionActor
// ---------------------------------------------------------------------------

struct Binding {
    session: Arc<Session>,
    events: flume::Receiver<SessionEvent>,
    /// Last sequence delivered to the client.
    sequence: u64,
}

/// What the actor loop should do after handling one step.
enum Flow {
    Continue,
    Stop,
}

struct ConnectionActor {
    id: Uuid,
    hub: Arc<ConnectionHub>,
    machine: ConnectionStateMachine,
    binding: Option<Binding>,
    outbound: flume::Sender<ServerEvent>,
}

impl ConnectionActor {
    async fn run(
        mut self,
        inbound: flume::Receiver<ClientEvent>,
        close: flume::Receiver<CloseReason>,
    ) {
        loop {
            let session_events = self.binding.as_ref().map(|b| b.events.clone());
            let flow = tokio::select! {
                biased;
                reason = close.recv_async() => match reason {
                    Ok(reason) => self.expire(reason).await,
                    Err(_) => Flow::Stop,
                },
                event = next_session_event(session_events) => self.on_session_event(event).await,
                command = inbound.recv_async() => match command {
                    Ok(command) => self.on_client_event(command).await,
                    Err(_) => {
                        debug!(conn_id = %self.id, "transport went away");
                        Flow::Stop
                    }
                },
            };
            if matches!(flow, Flow::Stop) {
                break;
            }
        }

        self.unbind();
        self.hub.forget(self.id);
        info!(conn_id = %self.id, state = %self.machine.state(), "connection closed");
    }

    /// Deliver an event to the transport. `false` means the transport is gone.
    async fn emit(&self, event: ServerEvent) -> bool {
        self.outbound.send_async(event).await.is_ok()
    }

    fn flow(delivered: bool) -> Flow {
        if delivered {
            Flow::Continue
        } else {
            Flow::Stop
        }
    }

    fn transition(&mut self, event: ConnectionEvent) {
        if let Err(e) = self.machine.transition(event) {
            debug!(conn_id = %self.id, error = %e, "ignored connection transition");
        }
    }

    fn unbind(&mut self) {
        if let Some(binding) = self.binding.take() {
            binding.session.unsubscribe(self.id);
        }
    }

    // -- client commands ----------------------------------------------------

    async fn on_client_event(&mut self, event: ClientEvent) -> Flow {
        match event {
            ClientEvent::Join {
                scope,
                token,
                resume,
                fresh,
            } => self.join(&scope, &token, resume, fresh).await,
            ClientEvent::Message { bound_id, text } => {
                self.submit(bound_id, Input::Line(text)).await
            }
            ClientEvent::Input { bound_id, data } => self.submit(bound_id, Input::Raw(data)).await,
            ClientEvent::Resize { cols, rows } => self.resize(cols, rows).await,
            ClientEvent::Leave => {
                self.unbind();
                self.transition(ConnectionEvent::Leave);
                self.emit(ServerEvent::Closed {
                    reason: CloseReason::Left,
                })
                .await;
                Flow::Stop
            }
        }
    }

    async fn join(&mut self, scope: &str, token: &str, resume: Option<Resume>, fresh: bool) -> Flow {
        let user = match self.hub.auth.authenticate(token).await {
            Ok(user) => user,
            Err(e) => {
                warn!(conn_id = %self.id, error = %e, "join rejected");
                self.unbind();
                self.transition(ConnectionEvent::AuthFailed);
                self.emit(HubError::from(e).to_event()).await;
                self.emit(ServerEvent::Closed {
                    reason: CloseReason::Unauthorized,
                })
                .await;
                return Flow::Stop;
            }
        };

        match self.bind(user, Scope::parse(scope), resume, fresh).await {
            Ok(event) => Self::flow(self.emit(event).await),
            Err(e) => {
                debug!(conn_id = %self.id, error = %e, "join failed");
                Self::flow(self.emit(e.to_event()).await)
            }
        }
    }

    async fn bind(
        &mut self,
        user: UserId,
        scope: Scope,
        resume: Option<Resume>,
        fresh: bool,
    ) -> Result<ServerEvent, HubError> {
        let key = ScopeKey::new(user, scope);
        let registry = &self.hub.registry;
        let session = if fresh {
            registry.get_or_create_fresh(&key).await?
        } else {
            registry.get_or_create(&key).await?
        };

        // A resume point only means something for the session it came from.
        let resume_from = resume
            .filter(|r| r.session_id == session.id())
            .map(|r| r.sequence);
        let subscription = session.subscribe(
            self.id,
            resume_from,
            self.hub.config.subscriber_queue,
        )?;

        if let Some(previous) = self.binding.take() {
            if previous.session.id() != session.id() {
                previous.session.unsubscribe(self.id);
            }
        }

        let catch_up = subscription.catch_up;
        info!(
            conn_id = %self.id,
            key = %key,
            session_id = %session.id(),
            sequence = catch_up.sequence,
            resumed = catch_up.resumed,
            gap = catch_up.gap,
            "connection joined"
        );
        self.binding = Some(Binding {
            session: session.clone(),
            events: subscription.events,
            sequence: catch_up.sequence,
        });
        self.transition(ConnectionEvent::Joined);

        Ok(ServerEvent::Joined {
            session_id: session.id(),
            snapshot: catch_up.content,
            sequence: catch_up.sequence,
            resumed: catch_up.resumed,
            gap: catch_up.gap,
        })
    }

    fn bound_session(&self, bound_id: SessionId) -> Result<Arc<Session>, HubError> {
        match &self.binding {
            Some(b) if b.session.id() == bound_id => Ok(b.session.clone()),
            _ => Err(HubError::NotBound(bound_id)),
        }
    }

    async fn submit(&mut self, bound_id: SessionId, input: Input) -> Flow {
        let session = match self.bound_session(bound_id) {
            Ok(session) => session,
            Err(e) => return Self::flow(self.emit(e.to_event()).await),
        };
        match session.send(&input).await {
            Ok(()) => Flow::Continue,
            Err(SessionError::SessionDead) => {
                info!(conn_id = %self.id, session_id = %bound_id, "input for dead session, unbinding");
                self.unbind();
                self.transition(ConnectionEvent::Unbind);
                Self::flow(
                    self.emit(HubError::Session(SessionError::SessionDead).to_event())
                        .await,
                )
            }
            Err(e) => {
                warn!(conn_id = %self.id, session_id = %bound_id, error = %e, "failed to forward input");
                Self::flow(self.emit(HubError::from(e).to_event()).await)
            }
        }
    }

    async fn resize(&mut self, cols: u16, rows: u16) -> Flow {
        let Some(session) = self.binding.as_ref().map(|b| b.session.clone()) else {
            return Self::flow(self.emit(HubError::NothingBound.to_event()).await);
        };
        if let Err(e) = session.resize(cols, rows).await {
            debug!(conn_id = %self.id, error = %e, "resize failed");
        }
        Flow::Continue
    }

    // -- session events -----------------------------------------------------

    async fn on_session_event(&mut self, event: Result<SessionEvent, flume::RecvError>) -> Flow {
        let Some(binding) = self.binding.as_mut() else {
            return Flow::Continue;
        };

        match event {
            Ok(SessionEvent::Output { delta, sequence }) => {
                if sequence <= binding.sequence {
                    return Flow::Continue;
                }
                binding.sequence = sequence;
                Self::flow(self.emit(ServerEvent::Output { delta, sequence }).await)
            }
            Ok(SessionEvent::Resync { snapshot, sequence }) => {
                binding.sequence = sequence;
                Self::flow(self.emit(ServerEvent::Resync { snapshot, sequence }).await)
            }
            Ok(SessionEvent::Ended { reason }) => {
                self.binding = None;
                self.transition(ConnectionEvent::Unbind);
                Self::flow(
                    self.emit(ServerEvent::Closed {
                        reason: reason.into(),
                    })
                    .await,
                )
            }
            Err(_) => {
                // The session stopped feeding us: either it is gone, or our
                // queue overflowed and we were dropped.
                let dead = binding.session.state() == SessionState::Dead;
                let session_id = binding.session.id();
                self.unbind();
                self.transition(ConnectionEvent::Unbind);
                let event = if dead {
                    ServerEvent::Closed {
                        reason: CloseReason::Exited,
                    }
                } else {
                    warn!(conn_id = %self.id, %session_id, "subscriber lagged");
                    ServerEvent::error(
                        ErrorKind::Lagged,
                        "output queue overflowed; rejoin with resume to catch up",
                    )
                };
                Self::flow(self.emit(event).await)
            }
        }
    }

    async fn expire(&mut self, reason: CloseReason) -> Flow {
        self.unbind();
        self.transition(ConnectionEvent::Expire);
        self.emit(ServerEvent::Closed { reason }).await;
        Flow::Stop
    }
}

async fn next_session_event(
    events: Option<flume::Receiver<SessionEvent>>,
) -> Result<SessionEvent, flume::RecvError> {
    match events {
        Some(rx) => rx.recv_async().await,
        None => std::future::pending().await,
    }
}
