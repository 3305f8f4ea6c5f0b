//! In-memory backend for deterministic tests.
//!
//! `ScriptedBackend` behaves like a tiny shell: `echo <text>` prints
//! `<text>\n`, `exit` ends the process, everything else is recorded and
//! ignored. Tests can also inject output directly with
//! [`ScriptedHandle::emit`] or rewrite a polled screen with
//! [`ScriptedHandle::set_screen`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{BackendHandle, Input, SessionBackend, SpawnRequest};
use crate::error::{Result, SessionError};
use crate::session::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Stream,
    Poll,
}

#[derive(Debug)]
pub struct ScriptedBackend {
    mode: Mode,
    survives_restart: bool,
    spawn_delay: Duration,
    spawns: AtomicUsize,
    fail_next: AtomicBool,
    existing: Mutex<HashSet<String>>,
    handles: Mutex<Vec<Arc<ScriptedHandle>>>,
    requests: Mutex<Vec<SpawnRequest>>,
}

impl ScriptedBackend {
    /// Backend that pushes output through a stream, like a PTY.
    pub fn new() -> Self {
        Self::with_mode(Mode::Stream)
    }

    /// Backend that only supports full-screen capture, like tmux.
    pub fn polling() -> Self {
        let mut backend = Self::with_mode(Mode::Poll);
        backend.survives_restart = true;
        backend
    }

    fn with_mode(mode: Mode) -> Self {
        Self {
            mode,
            survives_restart: false,
            spawn_delay: Duration::ZERO,
            spawns: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
            existing: Mutex::new(HashSet::new()),
            handles: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Make every spawn take at least `delay`, to widen race windows.
    pub fn with_spawn_delay(mut self, delay: Duration) -> Self {
        self.spawn_delay = delay;
        self
    }

    /// Mark sessions as surviving a daemon restart.
    pub fn surviving_restart(mut self) -> Self {
        self.survives_restart = true;
        self
    }

    /// The next spawn fails with `SpawnFailed`.
    pub fn fail_next_spawn(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Pretend a session with this name is already running.
    pub fn add_existing(&self, name: impl Into<String>) {
        lock(&self.existing, "existing").insert(name.into());
    }

    /// Number of successful and failed spawn attempts so far.
    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn handles(&self) -> Vec<Arc<ScriptedHandle>> {
        lock(&self.handles, "handles").clone()
    }

    pub fn last_handle(&self) -> Option<Arc<ScriptedHandle>> {
        lock(&self.handles, "handles").last().cloned()
    }

    pub fn requests(&self) -> Vec<SpawnRequest> {
        lock(&self.requests, "requests").clone()
    }

    /// Convenience request rooted in the system temp dir.
    pub fn request(&self, name: &str) -> SpawnRequest {
        SpawnRequest {
            name: name.to_string(),
            working_dir: std::env::temp_dir(),
            env: Vec::new(),
        }
    }

    fn make_handle(&self, name: &str) -> Arc<ScriptedHandle> {
        let (tx, rx) = flume::unbounded();
        let handle = Arc::new(ScriptedHandle {
            name: name.to_string(),
            mode: self.mode,
            survives_restart: self.survives_restart,
            alive: AtomicBool::new(true),
            tx: Mutex::new(Some(tx)),
            rx,
            screen: Mutex::new(String::new()),
            inputs: Mutex::new(Vec::new()),
            terminated: AtomicBool::new(false),
        });
        lock(&self.handles, "handles").push(handle.clone());
        handle
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionBackend for ScriptedBackend {
    fn kind(&self) -> &'static str {
        "scripted"
    }

    async fn spawn(&self, request: &SpawnRequest) -> Result<Arc<dyn BackendHandle>> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        lock(&self.requests, "requests").push(request.clone());
        if !self.spawn_delay.is_zero() {
            tokio::time::sleep(self.spawn_delay).await;
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(SessionError::SpawnFailed("scripted failure".into()));
        }
        Ok(self.make_handle(&request.name))
    }

    async fn attach_existing(&self, name: &str) -> Result<Option<Arc<dyn BackendHandle>>> {
        if !lock(&self.existing, "existing").remove(name) {
            return Ok(None);
        }
        Ok(Some(self.make_handle(name)))
    }
}

// ---------------------------------------------------------------------------
// ScriptedHandle
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ScriptedHandle {
    name: String,
    mode: Mode,
    survives_restart: bool,
    alive: AtomicBool,
    tx: Mutex<Option<flume::Sender<Vec<u8>>>>,
    rx: flume::Receiver<Vec<u8>>,
    screen: Mutex<String>,
    inputs: Mutex<Vec<Input>>,
    terminated: AtomicBool,
}

impl ScriptedHandle {
    /// Produce output as if the process printed it.
    pub fn emit(&self, text: &str) {
        match self.mode {
            Mode::Stream => {
                if let Some(tx) = lock(&self.tx, "tx").as_ref() {
                    let _ = tx.send(text.as_bytes().to_vec());
                }
            }
            Mode::Poll => lock(&self.screen, "screen").push_str(text),
        }
    }

    /// Replace the whole captured screen (polling mode).
    pub fn set_screen(&self, screen: &str) {
        *lock(&self.screen, "screen") = screen.to_string();
    }

    /// Simulate the process exiting on its own.
    pub fn exit(&self) {
        self.alive.store(false, Ordering::SeqCst);
        lock(&self.tx, "tx").take();
    }

    pub fn inputs(&self) -> Vec<Input> {
        lock(&self.inputs, "inputs").clone()
    }

    pub fn was_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendHandle for ScriptedHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, input: &Input) -> Result<()> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(SessionError::SessionDead);
        }
        lock(&self.inputs, "inputs").push(input.clone());
        if let Input::Line(line) = input {
            if line.trim() == "exit" {
                self.exit();
            } else if let Some(text) = line.strip_prefix("echo ") {
                self.emit(&format!("{text}\n"));
            }
        }
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn capture(&self) -> Result<String> {
        match self.mode {
            Mode::Poll => Ok(lock(&self.screen, "screen").clone()),
            Mode::Stream => Err(SessionError::CaptureUnsupported),
        }
    }

    fn output_stream(&self) -> Option<flume::Receiver<Vec<u8>>> {
        match self.mode {
            Mode::Stream => Some(self.rx.clone()),
            Mode::Poll => None,
        }
    }

    async fn terminate(&self) -> Result<()> {
        self.terminated.store(true, Ordering::SeqCst);
        self.exit();
        Ok(())
    }

    fn survives_restart(&self) -> bool {
        self.survives_restart
    }
}

