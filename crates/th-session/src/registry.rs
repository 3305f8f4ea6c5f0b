use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use th_core::collab::{ResolveError, WorkspaceResolver};
use th_core::config::SessionConfig;
use th_core::types::{Scope, ScopeKey, SessionId, SessionState, UserId};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::backend::{SessionBackend, SpawnRequest};
use crate::error::SessionError;
use crate::session::{lock, Session, SessionOptions};

/// Name of the project notes file exported into project shells.
const PROJECT_CONTEXT_FILE: &str = "CLAUDE.md";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("scope not found: {0}")]
    ScopeNotFound(String),

    #[error("session {0} has exited; join with fresh=true to start a new one")]
    SessionDead(SessionId),

    #[error("session not found: {0}")]
    NotFound(SessionId),

    #[error("too many sessions (max {max})")]
    AtCapacity { max: usize },

    #[error("failed to start session: {0}")]
    SpawnFailed(#[source] SessionError),
}

impl From<ResolveError> for RegistryError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::NotFound(id) | ResolveError::InvalidId(id) => Self::ScopeNotFound(id),
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub name_prefix: String,
    pub max_sessions: usize,
    pub session: SessionOptions,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            name_prefix: "termhub".to_string(),
            max_sessions: 32,
            session: SessionOptions::default(),
        }
    }
}

impl From<&SessionConfig> for RegistryConfig {
    fn from(c: &SessionConfig) -> Self {
        Self {
            name_prefix: c.name_prefix.clone(),
            max_sessions: c.max_sessions,
            session: SessionOptions {
                buffer_max_bytes: c.buffer_max_bytes,
                buffer_max_lines: c.buffer_max_lines,
                capture_interval: c.capture_interval(),
            },
        }
    }
}

/// Creation cell for one scope key. Empty while the first caller is still
/// spawning; a failed spawn leaves it empty so the next caller retries.
type Slot = OnceCell<Arc<Session>>;

/// Process-wide table of live sessions.
///
/// The `slots` mutex is held only long enough to find or insert the cell for
/// a scope key; the spawn itself runs inside the cell, so concurrent callers
/// for the same key wait on one spawn while other keys proceed.
pub struct SessionRegistry {
    backend: Arc<dyn SessionBackend>,
    resolver: Arc<dyn WorkspaceResolver>,
    config: RegistryConfig,
    slots: Mutex<HashMap<ScopeKey, Arc<Slot>>>,
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new(
        backend: Arc<dyn SessionBackend>,
        resolver: Arc<dyn WorkspaceResolver>,
        config: RegistryConfig,
    ) -> Self {
        info!(backend = backend.kind(), max_sessions = config.max_sessions, "creating session registry");
        Self {
            backend,
            resolver,
            config,
            slots: Mutex::new(HashMap::new()),
            sessions: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Return the live session for `key`, creating it on first use.
    ///
    /// Concurrent callers for the same key share a single spawn. A session
    /// whose process has exited is reported as `SessionDead` and left in place
    /// until a caller asks for a fresh one.
    pub async fn get_or_create(&self, key: &ScopeKey) -> Result<Arc<Session>> {
        let working_dir = self.resolver.resolve_working_dir(&key.scope).await?;

        let slot = self.slot(key);
        let result = slot
            .get_or_try_init(|| self.create(key, &working_dir))
            .await
            .cloned();

        match result {
            Ok(session) if session.state() == SessionState::Dead => {
                Err(RegistryError::SessionDead(session.id()))
            }
            Ok(session) => Ok(session),
            Err(e) => {
                self.prune_slot(key, &slot);
                Err(e)
            }
        }
    }

    /// Like [`get_or_create`](Self::get_or_create), but a dead session for
    /// `key` is discarded and replaced. A live session is returned as is.
    pub async fn get_or_create_fresh(&self, key: &ScopeKey) -> Result<Arc<Session>> {
        if let Some(dead) = self.find(key).filter(|s| s.state() == SessionState::Dead) {
            info!(key = %key, session_id = %dead.id(), "replacing dead session");
            self.remove(&dead);
            dead.terminate().await;
        }
        self.get_or_create(key).await
    }

    pub fn get(&self, id: SessionId) -> Result<Arc<Session>> {
        self.sessions
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or(RegistryError::NotFound(id))
    }

    /// Current session for `key`, dead or alive, if one has been created.
    pub fn find(&self, key: &ScopeKey) -> Option<Arc<Session>> {
        let slot = lock(&self.slots, "slots").get(key).cloned()?;
        slot.get().cloned()
    }

    /// `Starting` while the first spawn for `key` is in flight.
    pub fn status(&self, key: &ScopeKey) -> Option<SessionState> {
        let slot = lock(&self.slots, "slots").get(key).cloned()?;
        Some(match slot.get() {
            Some(session) => session.state(),
            None => SessionState::Starting,
        })
    }

    /// Tear a session down. Returns `false` if it was already gone.
    pub async fn destroy(&self, id: SessionId) -> bool {
        let Some((_, session)) = self.sessions.remove(&id) else {
            debug!(session_id = %id, "destroy: already gone");
            return false;
        };
        self.remove_slot_for(&session);
        info!(session_id = %id, key = %session.key(), "destroying session");
        session.terminate().await;
        true
    }

    /// Tear a session down only if it has had no subscribers for at least
    /// `older_than` at the moment of removal.
    pub async fn destroy_if_idle(&self, id: SessionId, older_than: Duration) -> bool {
        let Some(session) = self.sessions.get(&id).map(|s| s.value().clone()) else {
            return false;
        };
        if !session.retire_if_idle(older_than) {
            debug!(session_id = %id, "destroy_if_idle: session is in use");
            return false;
        }
        self.remove(&session);
        info!(session_id = %id, key = %session.key(), "destroying idle session");
        session.terminate().await;
        true
    }

    pub async fn destroy_scope(&self, key: &ScopeKey) -> Option<SessionId> {
        let session = self.find(key)?;
        let id = session.id();
        self.destroy(id).await.then_some(id)
    }

    pub fn list(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn list_for_user(&self, user: &UserId) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter(|e| &e.value().key().user == user)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Sessions that have had no subscribers for at least `older_than`.
    pub fn list_idle(&self, older_than: Duration) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter(|e| {
                e.value()
                    .detached_for()
                    .is_some_and(|idle| idle >= older_than)
            })
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Stop every session. Backends that outlive the daemon are only
    /// detached so the next start can re-attach by name.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self.list();
        info!(count = sessions.len(), "shutting down sessions");
        for session in sessions {
            self.sessions.remove(&session.id());
            if session.survives_restart() {
                session.detach();
            } else {
                session.terminate().await;
            }
        }
        lock(&self.slots, "slots").clear();
    }

    // -- internals ----------------------------------------------------------

    fn slot(&self, key: &ScopeKey) -> Arc<Slot> {
        lock(&self.slots, "slots")
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Drop an empty cell nobody else is waiting on, so failed spawns leave
    /// no trace.
    fn prune_slot(&self, key: &ScopeKey, slot: &Arc<Slot>) {
        let mut slots = lock(&self.slots, "slots");
        let stale = slots.get(key).is_some_and(|current| {
            Arc::ptr_eq(current, slot) && current.get().is_none() && Arc::strong_count(current) == 2
        });
        if stale {
            slots.remove(key);
        }
    }

    fn remove(&self, session: &Arc<Session>) {
        self.sessions.remove(&session.id());
        self.remove_slot_for(session);
    }

    fn remove_slot_for(&self, session: &Arc<Session>) {
        let mut slots = lock(&self.slots, "slots");
        let owned = slots
            .get(session.key())
            .and_then(|slot| slot.get())
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if owned {
            slots.remove(session.key());
        }
    }

    async fn create(&self, key: &ScopeKey, working_dir: &Path) -> Result<Arc<Session>> {
        if self.sessions.len() >= self.config.max_sessions {
            warn!(key = %key, max = self.config.max_sessions, "session limit reached");
            return Err(RegistryError::AtCapacity {
                max: self.config.max_sessions,
            });
        }

        let name = key.session_name(&self.config.name_prefix);
        let attached = match self.backend.attach_existing(&name).await {
            Ok(found) => found,
            Err(e) => {
                warn!(name = %name, error = %e, "attach_existing failed, spawning instead");
                None
            }
        };
        let handle = match attached {
            Some(handle) => handle,
            None => {
                let request = SpawnRequest {
                    name,
                    working_dir: working_dir.to_path_buf(),
                    env: session_env(&key.scope, working_dir).await,
                };
                self.backend
                    .spawn(&request)
                    .await
                    .map_err(RegistryError::SpawnFailed)?
            }
        };

        let session = Session::start(
            key.clone(),
            working_dir.to_path_buf(),
            handle,
            &self.config.session,
        );
        self.sessions.insert(session.id(), session.clone());
        Ok(session)
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("backend", &self.backend.kind())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

/// Environment for a new shell. Project shells learn where they are and get
/// the project's notes file, if any.
async fn session_env(scope: &Scope, working_dir: &Path) -> Vec<(String, String)> {
    let mut env = vec![("TERM".to_string(), "xterm-256color".to_string())];
    if let Scope::Project(id) = scope {
        env.push(("PROJECT_NAME".to_string(), id.clone()));
        env.push((
            "PROJECT_PATH".to_string(),
            working_dir.to_string_lossy().into_owned(),
        ));
        if let Ok(context) = tokio::fs::read_to_string(working_dir.join(PROJECT_CONTEXT_FILE)).await {
            env.push(("CLAUDE_PROJECT_CONTEXT".to_string(), context));
        }
    }
    env
}
