use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use th_core::types::{ScopeKey, SessionId, SessionState};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{BackendHandle, Input};
use crate::error::{Result, SessionError};
use crate::output_buffer::{OutputBuffer, Utf8Decoder};

pub(crate) fn lock<'a, T>(m: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    m.lock().unwrap_or_else(|e| {
        warn!(lock = what, "mutex was poisoned, recovering");
        e.into_inner()
    })
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Why a session stopped delivering events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The backing process exited on its own.
    Exited,
    /// The session was torn down explicitly or by the idle sweep.
    Destroyed,
    /// The daemon is stopping; the backing process may live on.
    Shutdown,
}

impl EndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EndReason::Exited => "exited",
            EndReason::Destroyed => "destroyed",
            EndReason::Shutdown => "shutdown",
        }
    }
}

/// Pushed to every subscriber, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Output { delta: String, sequence: u64 },
    /// The whole screen was replaced; discard local content.
    Resync { snapshot: String, sequence: u64 },
    /// Always the last event a subscriber receives.
    Ended { reason: EndReason },
}

/// What a new subscriber has to apply before consuming its event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchUp {
    /// Full snapshot, or only the missed tail when `resumed` is set.
    pub content: String,
    pub sequence: u64,
    pub resumed: bool,
    /// A resume was requested but the missed range had been evicted.
    pub gap: bool,
}

#[derive(Debug)]
pub struct Subscription {
    pub catch_up: CatchUp,
    pub events: flume::Receiver<SessionEvent>,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub buffer_max_bytes: usize,
    pub buffer_max_lines: usize,
    /// Poll period for backends without an output stream.
    pub capture_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            buffer_max_bytes: 64 * 1024,
            buffer_max_lines: 500,
            capture_interval: Duration::from_millis(300),
        }
    }
}

/// Serializable view of a session for listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub user_id: String,
    pub scope: String,
    pub name: String,
    pub state: SessionState,
    pub working_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub subscribers: usize,
    pub sequence: u64,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct Lifecycle {
    state: SessionState,
    last_activity: DateTime<Utc>,
}

struct OutputHub {
    buffer: OutputBuffer,
    subscribers: Vec<(Uuid, flume::Sender<SessionEvent>)>,
    detached_since: Option<Instant>,
    closed: bool,
}

/// One durable backing shell plus its scrollback and subscriber list.
///
/// Only the capture task writes to the buffer. Subscription and catch-up are
/// computed under the same lock as appends, so a subscriber sees every
/// sequence exactly once: either in its catch-up or as a live event.
pub struct Session {
    id: SessionId,
    key: ScopeKey,
    working_dir: PathBuf,
    created_at: DateTime<Utc>,
    handle: Arc<dyn BackendHandle>,
    lifecycle: Mutex<Lifecycle>,
    output: Mutex<OutputHub>,
    capture_task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Wrap a freshly spawned (or re-attached) handle and start its capture
    /// task. Must be called from within a Tokio runtime.
    pub fn start(
        key: ScopeKey,
        working_dir: PathBuf,
        handle: Arc<dyn BackendHandle>,
        options: &SessionOptions,
    ) -> Arc<Self> {
        let now = Utc::now();
        let session = Arc::new(Self {
            id: SessionId::new(),
            key,
            working_dir,
            created_at: now,
            handle,
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Starting,
                last_activity: now,
            }),
            output: Mutex::new(OutputHub {
                buffer: OutputBuffer::new(options.buffer_max_bytes, options.buffer_max_lines),
                subscribers: Vec::new(),
                detached_since: Some(Instant::now()),
                closed: false,
            }),
            capture_task: Mutex::new(None),
        });

        let weak = Arc::downgrade(&session);
        let task = match session.handle.output_stream() {
            Some(stream) => tokio::spawn(stream_loop(weak, stream)),
            None => tokio::spawn(poll_loop(weak, options.capture_interval)),
        };
        *lock(&session.capture_task, "capture_task") = Some(task);

        info!(session_id = %session.id, key = %session.key, name = session.handle.name(), "session started");
        session
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn key(&self) -> &ScopeKey {
        &self.key
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        lock(&self.lifecycle, "lifecycle").state
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        lock(&self.lifecycle, "lifecycle").last_activity
    }

    pub fn survives_restart(&self) -> bool {
        self.handle.survives_restart()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.output, "output").subscribers.len()
    }

    /// How long the session has had no subscribers; `None` while anyone is
    /// attached.
    pub fn detached_for(&self) -> Option<Duration> {
        lock(&self.output, "output")
            .detached_since
            .map(|since| since.elapsed())
    }

    /// Close the session to new subscribers if nobody has been attached for
    /// at least `older_than`. Decided under the subscription lock, so a
    /// racing `subscribe` either keeps the session alive or sees it dead.
    pub fn retire_if_idle(&self, older_than: Duration) -> bool {
        {
            let mut hub = lock(&self.output, "output");
            let idle = !hub.closed
                && hub
                    .detached_since
                    .is_some_and(|since| since.elapsed() >= older_than);
            if !idle {
                return false;
            }
            hub.closed = true;
        }
        lock(&self.lifecycle, "lifecycle").state = SessionState::Dead;
        true
    }

    pub fn snapshot(&self) -> crate::output_buffer::Snapshot {
        lock(&self.output, "output").buffer.snapshot()
    }

    pub fn info(&self) -> SessionInfo {
        let (state, last_activity) = {
            let l = lock(&self.lifecycle, "lifecycle");
            (l.state, l.last_activity)
        };
        let (subscribers, sequence) = {
            let hub = lock(&self.output, "output");
            (hub.subscribers.len(), hub.buffer.last_sequence())
        };
        SessionInfo {
            session_id: self.id,
            user_id: self.key.user.to_string(),
            scope: self.key.scope.to_string(),
            name: self.handle.name().to_string(),
            state,
            working_dir: self.working_dir.clone(),
            created_at: self.created_at,
            last_activity,
            subscribers,
            sequence,
        }
    }

    /// Register `conn_id` for live events and return what it must apply
    /// first. A repeated subscribe for the same connection replaces the
    /// previous registration.
    pub fn subscribe(
        &self,
        conn_id: Uuid,
        resume: Option<u64>,
        capacity: usize,
    ) -> Result<Subscription> {
        // One slot beyond `capacity` stays free for the final `Ended`.
        let (tx, rx) = flume::bounded(capacity.max(1) + 1);
        let mut hub = lock(&self.output, "output");
        if hub.closed {
            return Err(SessionError::SessionDead);
        }

        let catch_up = match resume.map(|seq| hub.buffer.tail_since(seq)) {
            Some(Ok(tail)) => CatchUp {
                content: tail.content,
                sequence: tail.sequence,
                resumed: true,
                gap: false,
            },
            other => {
                let snap = hub.buffer.snapshot();
                CatchUp {
                    content: snap.content,
                    sequence: snap.sequence,
                    resumed: false,
                    gap: matches!(other, Some(Err(_))),
                }
            }
        };

        hub.subscribers.retain(|(id, _)| *id != conn_id);
        hub.subscribers.push((conn_id, tx));
        hub.detached_since = None;
        drop(hub);

        debug!(session_id = %self.id, %conn_id, sequence = catch_up.sequence, resumed = catch_up.resumed, gap = catch_up.gap, "subscriber added");
        Ok(Subscription {
            catch_up,
            events: rx,
        })
    }

    pub fn unsubscribe(&self, conn_id: Uuid) {
        let mut hub = lock(&self.output, "output");
        let before = hub.subscribers.len();
        hub.subscribers.retain(|(id, _)| *id != conn_id);
        if hub.subscribers.is_empty() && before > 0 {
            hub.detached_since = Some(Instant::now());
        }
        if hub.subscribers.len() != before {
            debug!(session_id = %self.id, %conn_id, "subscriber removed");
        }
    }

    pub async fn send(&self, input: &Input) -> Result<()> {
        if self.state() == SessionState::Dead {
            return Err(SessionError::SessionDead);
        }
        self.handle.send(input).await?;
        self.touch();
        Ok(())
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        if self.state() == SessionState::Dead {
            return Err(SessionError::SessionDead);
        }
        self.handle.resize(cols, rows).await
    }

    /// Stop capturing, kill the backing process and notify subscribers.
    /// Safe to call more than once.
    pub async fn terminate(&self) {
        self.stop_capture();
        if let Err(e) = self.handle.terminate().await {
            warn!(session_id = %self.id, error = %e, "failed to terminate backing process");
        }
        self.close(EndReason::Destroyed);
    }

    /// Stop capturing and notify subscribers but leave the backing process
    /// running, so a later daemon can re-attach to it.
    pub fn detach(&self) {
        self.stop_capture();
        self.close(EndReason::Shutdown);
    }

    fn stop_capture(&self) {
        if let Some(task) = lock(&self.capture_task, "capture_task").take() {
            task.abort();
        }
    }

    fn touch(&self) {
        lock(&self.lifecycle, "lifecycle").last_activity = Utc::now();
    }

    fn set_state(&self, state: SessionState) {
        let mut l = lock(&self.lifecycle, "lifecycle");
        if l.state == SessionState::Dead || l.state == state {
            return;
        }
        debug!(session_id = %self.id, from = %l.state, to = %state, "session state change");
        l.state = state;
    }

    fn close(&self, reason: EndReason) {
        {
            let mut l = lock(&self.lifecycle, "lifecycle");
            l.state = SessionState::Dead;
        }
        let subscribers = {
            let mut hub = lock(&self.output, "output");
            if hub.closed {
                return;
            }
            hub.closed = true;
            hub.detached_since = Some(Instant::now());
            std::mem::take(&mut hub.subscribers)
        };
        info!(session_id = %self.id, reason = reason.as_str(), subscribers = subscribers.len(), "session ended");
        for (conn_id, tx) in subscribers {
            if let Err(flume::TrySendError::Full(_)) = tx.try_send(SessionEvent::Ended { reason }) {
                warn!(session_id = %self.id, %conn_id, "no room for end notice");
            }
        }
    }

    /// Append to the buffer and fan the delta out.
    fn publish(&self, text: &str) {
        let (sequence, subscribers) = {
            let mut hub = lock(&self.output, "output");
            if hub.closed {
                return;
            }
            let Some(sequence) = hub.buffer.append(text) else {
                return;
            };
            (sequence, hub.subscribers.clone())
        };
        self.touch();
        self.broadcast(
            subscribers,
            SessionEvent::Output {
                delta: text.to_string(),
                sequence,
            },
        );
    }

    /// Replace the buffer contents after a screen rewrite.
    fn publish_resync(&self, screen: &str) {
        let (sequence, subscribers) = {
            let mut hub = lock(&self.output, "output");
            if hub.closed {
                return;
            }
            (hub.buffer.reset(screen), hub.subscribers.clone())
        };
        self.touch();
        self.broadcast(
            subscribers,
            SessionEvent::Resync {
                snapshot: screen.to_string(),
                sequence,
            },
        );
    }

    fn broadcast(&self, subscribers: Vec<(Uuid, flume::Sender<SessionEvent>)>, event: SessionEvent) {
        let mut dropped = Vec::new();
        for (conn_id, tx) in &subscribers {
            if at_capacity(tx) {
                warn!(session_id = %self.id, %conn_id, "subscriber queue full, dropping");
                dropped.push(tx.clone());
                continue;
            }
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(flume::TrySendError::Full(_)) => {
                    warn!(session_id = %self.id, %conn_id, "subscriber queue full, dropping");
                    dropped.push(tx.clone());
                }
                Err(flume::TrySendError::Disconnected(_)) => {
                    dropped.push(tx.clone());
                }
            }
        }
        drop(subscribers);
        if dropped.is_empty() {
            return;
        }

        let mut hub = lock(&self.output, "output");
        hub.subscribers
            .retain(|(_, tx)| !dropped.iter().any(|d| d.same_channel(tx)));
        if hub.subscribers.is_empty() && hub.detached_since.is_none() {
            hub.detached_since = Some(Instant::now());
        }
    }

    /// Fold a freshly polled screen into the buffer: growth becomes an
    /// `Output` delta, anything else a `Resync`.
    fn reconcile(&self, previous: &mut String, screen: String) {
        if screen == *previous {
            return;
        }
        match scrolled_tail(previous, &screen) {
            Some("") => {}
            Some(tail) => self.publish(tail),
            None => self.publish_resync(&screen),
        }
        *previous = screen;
    }
}

/// True once a subscriber queue holds `capacity` events, leaving only the
/// slot reserved for `Ended`.
fn at_capacity(tx: &flume::Sender<SessionEvent>) -> bool {
    tx.capacity().is_some_and(|cap| tx.len() + 1 >= cap)
}

/// The part of `screen` that is new relative to `previous`, allowing for
/// lines scrolled off the top. Returns `None` when the screen was rewritten.
///
/// The overlap is the longest suffix of `previous` that starts on a line
/// boundary and is a prefix of `screen`. Unless `previous` is kept whole, the
/// overlap must span at least one line break so a lone prompt fragment never
/// anchors an unrelated screen.
fn scrolled_tail<'a>(previous: &str, screen: &'a str) -> Option<&'a str> {
    if let Some(tail) = screen.strip_prefix(previous) {
        return Some(tail);
    }
    previous
        .match_indices('\n')
        .map(|(i, _)| &previous[i + 1..])
        .take_while(|overlap| overlap.contains('\n'))
        .find(|overlap| screen.starts_with(overlap))
        .map(|overlap| &screen[overlap.len()..])
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("name", &self.handle.name())
            .field("state", &self.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Capture loops
// ---------------------------------------------------------------------------

async fn stream_loop(session: Weak<Session>, stream: flume::Receiver<Vec<u8>>) {
    if let Some(s) = session.upgrade() {
        s.set_state(SessionState::Ready);
    }
    let mut decoder = Utf8Decoder::default();
    while let Ok(chunk) = stream.recv_async().await {
        let Some(s) = session.upgrade() else {
            return;
        };
        let text = decoder.push(&chunk);
        s.publish(&text);
    }
    if let Some(s) = session.upgrade() {
        info!(session_id = %s.id, "output stream closed");
        s.close(EndReason::Exited);
    }
}

async fn poll_loop(session: Weak<Session>, interval: Duration) {
    let mut previous = String::new();
    loop {
        let Some(s) = session.upgrade() else {
            return;
        };
        if !s.handle.is_alive().await {
            info!(session_id = %s.id, "backing process is gone");
            s.close(EndReason::Exited);
            return;
        }
        match s.handle.capture().await {
            Ok(screen) => {
                let screen = screen.trim_end().to_string();
                s.reconcile(&mut previous, screen);
                s.set_state(SessionState::Ready);
            }
            Err(e) => {
                warn!(session_id = %s.id, error = %e, "capture failed");
                s.set_state(SessionState::Degraded);
            }
        }
        drop(s);
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SessionBackend;
    use crate::testing::ScriptedBackend;
    use th_core::types::UserId;

    fn key() -> ScopeKey {
        ScopeKey::project(UserId::new("alice"), "blog")
    }

    async fn start(backend: &ScriptedBackend) -> Arc<Session> {
        let handle = backend.spawn(&backend.request("termhub-alice_blog")).await.unwrap();
        Session::start(key(), PathBuf::from("/tmp"), handle, &SessionOptions::default())
    }

    async fn next(rx: &flume::Receiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv_async())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn output_reaches_subscriber_in_order() {
        let backend = ScriptedBackend::new();
        let session = start(&backend).await;
        let sub = session.subscribe(Uuid::new_v4(), None, 16).unwrap();
        assert_eq!(sub.catch_up.content, "");
        assert_eq!(sub.catch_up.sequence, 0);

        session.send(&Input::Line("echo hi".into())).await.unwrap();
        session.send(&Input::Line("echo there".into())).await.unwrap();

        assert_eq!(
            next(&sub.events).await,
            SessionEvent::Output {
                delta: "hi\n".into(),
                sequence: 1
            }
        );
        assert_eq!(
            next(&sub.events).await,
            SessionEvent::Output {
                delta: "there\n".into(),
                sequence: 2
            }
        );
    }

    #[tokio::test]
    async fn resume_returns_only_missed_tail() {
        let backend = ScriptedBackend::new();
        let session = start(&backend).await;
        let conn = Uuid::new_v4();
        let sub = session.subscribe(conn, None, 16).unwrap();
        session.send(&Input::Line("echo a".into())).await.unwrap();
        next(&sub.events).await;
        session.unsubscribe(conn);

        session.send(&Input::Line("echo b".into())).await.unwrap();
        // Wait for the capture task to append while nobody is attached.
        for _ in 0..100 {
            if session.snapshot().sequence == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let sub = session.subscribe(conn, Some(1), 16).unwrap();
        assert!(sub.catch_up.resumed);
        assert!(!sub.catch_up.gap);
        assert_eq!(sub.catch_up.content, "b\n");
        assert_eq!(sub.catch_up.sequence, 2);
    }

    #[tokio::test]
    async fn terminate_sends_ended_and_refuses_new_subscribers() {
        let backend = ScriptedBackend::new();
        let session = start(&backend).await;
        let sub = session.subscribe(Uuid::new_v4(), None, 16).unwrap();

        session.terminate().await;
        assert_eq!(
            next(&sub.events).await,
            SessionEvent::Ended {
                reason: EndReason::Destroyed
            }
        );
        assert_eq!(session.state(), SessionState::Dead);
        assert!(matches!(
            session.subscribe(Uuid::new_v4(), None, 16),
            Err(SessionError::SessionDead)
        ));
        assert!(matches!(
            session.send(&Input::Line("echo x".into())).await,
            Err(SessionError::SessionDead)
        ));
    }

    #[tokio::test]
    async fn process_exit_marks_session_dead() {
        let backend = ScriptedBackend::new();
        let session = start(&backend).await;
        let sub = session.subscribe(Uuid::new_v4(), None, 16).unwrap();
        session.send(&Input::Line("exit".into())).await.unwrap();

        assert_eq!(
            next(&sub.events).await,
            SessionEvent::Ended {
                reason: EndReason::Exited
            }
        );
        assert_eq!(session.state(), SessionState::Dead);
    }

    #[tokio::test]
    async fn full_subscriber_is_dropped() {
        let backend = ScriptedBackend::new();
        let session = start(&backend).await;
        let sub = session.subscribe(Uuid::new_v4(), None, 1).unwrap();
        let handle = backend.last_handle().unwrap();
        handle.emit("one");
        handle.emit("two");
        handle.emit("three");

        for _ in 0..100 {
            if session.subscriber_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(session.subscriber_count(), 0);
        // The queued event is still readable, then the channel reports closed.
        assert!(matches!(next(&sub.events).await, SessionEvent::Output { .. }));
        let closed = tokio::time::timeout(Duration::from_secs(2), sub.events.recv_async())
            .await
            .unwrap();
        assert!(closed.is_err());
    }

    #[tokio::test]
    async fn full_queue_still_gets_end_notice() {
        let backend = ScriptedBackend::new();
        let session = start(&backend).await;
        let sub = session.subscribe(Uuid::new_v4(), None, 1).unwrap();
        backend.last_handle().unwrap().emit("one");
        for _ in 0..100 {
            if session.snapshot().sequence == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(session.subscriber_count(), 1);

        session.terminate().await;
        assert!(matches!(next(&sub.events).await, SessionEvent::Output { .. }));
        assert_eq!(
            next(&sub.events).await,
            SessionEvent::Ended {
                reason: EndReason::Destroyed
            }
        );
    }

    #[tokio::test]
    async fn polled_screen_growth_and_rewrite() {
        let backend = ScriptedBackend::polling();
        let handle = backend.spawn(&backend.request("termhub-poll")).await.unwrap();
        let options = SessionOptions {
            capture_interval: Duration::from_millis(10),
            ..SessionOptions::default()
        };
        let session = Session::start(key(), PathBuf::from("/tmp"), handle, &options);
        let sub = session.subscribe(Uuid::new_v4(), None, 16).unwrap();
        let scripted = backend.last_handle().unwrap();

        scripted.set_screen("$ ls");
        assert_eq!(
            next(&sub.events).await,
            SessionEvent::Output {
                delta: "$ ls".into(),
                sequence: 1
            }
        );
        scripted.set_screen("$ ls\nREADME.md\n\n");
        assert_eq!(
            next(&sub.events).await,
            SessionEvent::Output {
                delta: "\nREADME.md".into(),
                sequence: 2
            }
        );
        scripted.set_screen("$ clear");
        assert_eq!(
            next(&sub.events).await,
            SessionEvent::Resync {
                snapshot: "$ clear".into(),
                sequence: 3
            }
        );
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn polled_screen_scrolling_is_an_append() {
        let backend = ScriptedBackend::polling();
        let handle = backend.spawn(&backend.request("termhub-poll")).await.unwrap();
        let options = SessionOptions {
            capture_interval: Duration::from_millis(10),
            ..SessionOptions::default()
        };
        let session = Session::start(key(), PathBuf::from("/tmp"), handle, &options);
        let sub = session.subscribe(Uuid::new_v4(), None, 16).unwrap();
        let scripted = backend.last_handle().unwrap();

        scripted.set_screen("l1\nl2\nl3");
        assert!(matches!(next(&sub.events).await, SessionEvent::Output { sequence: 1, .. }));
        scripted.set_screen("l2\nl3\nl4");
        assert_eq!(
            next(&sub.events).await,
            SessionEvent::Output {
                delta: "\nl4".into(),
                sequence: 2
            }
        );
        assert_eq!(session.snapshot().content, "l1\nl2\nl3\nl4");
    }

    #[test]
    fn scrolled_tail_finds_overlap() {
        assert_eq!(scrolled_tail("a\nb", "a\nb\nc"), Some("\nc"));
        assert_eq!(scrolled_tail("l1\nl2\nl3", "l2\nl3\nl4\nl5"), Some("\nl4\nl5"));
        assert_eq!(scrolled_tail("l1\nl2\n$ ec", "l2\n$ echo"), Some("ho"));
        // Several lines gone, nothing new yet.
        assert_eq!(scrolled_tail("l1\nl2\nl3\nl4", "l3\nl4"), Some(""));
    }

    #[test]
    fn scrolled_tail_rejects_rewrites() {
        assert_eq!(scrolled_tail("l1\nl2", "x1\nx2"), None);
        // A single trailing line is not enough of an anchor.
        assert_eq!(scrolled_tail("out\n$ ", "$ vim"), None);
        assert_eq!(scrolled_tail("", ""), Some(""));
    }

    #[tokio::test]
    async fn idle_clock_runs_only_while_detached() {
        let backend = ScriptedBackend::new();
        let session = start(&backend).await;
        assert!(session.detached_for().is_some());
        let conn = Uuid::new_v4();
        let _sub = session.subscribe(conn, None, 4).unwrap();
        assert!(session.detached_for().is_none());
        session.unsubscribe(conn);
        assert!(session.detached_for().is_some());
    }
}
