//! The seam between a [`Session`](crate::session::Session) and whatever
//! actually runs the shell.
//!
//! A backend either pushes raw output through [`BackendHandle::output_stream`]
//! (native PTY) or only supports full-screen [`BackendHandle::capture`]
//! (tmux); the session's capture loop adapts to whichever is offered.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// Keystrokes destined for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// A line of text; the backend submits it (newline / Enter).
    Line(String),
    /// Raw bytes typed as-is, e.g. control sequences from a terminal widget.
    Raw(String),
}

impl Input {
    pub fn text(&self) -> &str {
        match self {
            Input::Line(t) | Input::Raw(t) => t,
        }
    }
}

/// Parameters for starting a new backing session.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Well-known name (`<prefix>-<slug>`), used by backends that can be
    /// re-attached after a restart.
    pub name: String,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

#[async_trait]
pub trait SessionBackend: Send + Sync + 'static {
    /// Short backend name for logs and listings.
    fn kind(&self) -> &'static str;

    async fn spawn(&self, request: &SpawnRequest) -> Result<Arc<dyn BackendHandle>>;

    /// Best-effort reattachment to a session that outlived a previous daemon.
    async fn attach_existing(&self, name: &str) -> Result<Option<Arc<dyn BackendHandle>>>;
}

#[async_trait]
pub trait BackendHandle: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Fails with `SessionDead` once the process has exited.
    async fn send(&self, input: &Input) -> Result<()>;

    async fn is_alive(&self) -> bool;

    /// Full current screen / scrollback. Stream-only backends return
    /// `CaptureUnsupported`.
    async fn capture(&self) -> Result<String>;

    /// Incremental raw output, if the backend can push it. The channel
    /// closes when the process exits.
    fn output_stream(&self) -> Option<flume::Receiver<Vec<u8>>>;

    /// Kill the backing process. Must be safe to call on a dead handle.
    async fn terminate(&self) -> Result<()>;

    async fn resize(&self, _cols: u16, _rows: u16) -> Result<()> {
        Ok(())
    }

    /// Whether the backing process keeps running when the daemon exits, so
    /// it can be picked up again by [`SessionBackend::attach_existing`].
    fn survives_restart(&self) -> bool {
        false
    }
}
