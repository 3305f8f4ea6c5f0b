use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::backend::{BackendHandle, Input, SessionBackend, SpawnRequest};
use crate::error::{Result, SessionError};
use crate::pty_pool::{PtyHandle, PtyPool, PtySpawn};

/// Runs each session as an interactive shell inside a native PTY.
///
/// PTY sessions die with the daemon, so there is nothing to re-attach to.
#[derive(Debug, Clone)]
pub struct PtyBackend {
    pool: PtyPool,
    shell: String,
}

impl PtyBackend {
    pub fn new(pool: PtyPool, shell: impl Into<String>) -> Self {
        Self {
            pool,
            shell: shell.into(),
        }
    }

    pub fn pool(&self) -> &PtyPool {
        &self.pool
    }
}

#[async_trait]
impl SessionBackend for PtyBackend {
    fn kind(&self) -> &'static str {
        "pty"
    }

    async fn spawn(&self, request: &SpawnRequest) -> Result<Arc<dyn BackendHandle>> {
        let mut spec = PtySpawn::new(&self.shell).cwd(&request.working_dir);
        for (k, v) in &request.env {
            spec = spec.env(k, v);
        }
        let pty = self.pool.spawn(&spec)?;
        info!(name = %request.name, shell = %self.shell, "spawned PTY session");
        Ok(Arc::new(PtySessionHandle {
            name: request.name.clone(),
            pty,
        }))
    }

    async fn attach_existing(&self, _name: &str) -> Result<Option<Arc<dyn BackendHandle>>> {
        Ok(None)
    }
}

#[derive(Debug)]
pub struct PtySessionHandle {
    name: String,
    pty: PtyHandle,
}

#[async_trait]
impl BackendHandle for PtySessionHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, input: &Input) -> Result<()> {
        match input {
            Input::Line(text) => self.pty.send_line(text).await,
            Input::Raw(text) => self.pty.send(text.as_bytes()).await,
        }
    }

    async fn is_alive(&self) -> bool {
        self.pty.is_alive()
    }

    async fn capture(&self) -> Result<String> {
        Err(SessionError::CaptureUnsupported)
    }

    fn output_stream(&self) -> Option<flume::Receiver<Vec<u8>>> {
        Some(self.pty.reader.clone())
    }

    async fn terminate(&self) -> Result<()> {
        debug!(name = %self.name, "terminating PTY session");
        self.pty.kill()
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.pty.resize(cols, rows)
    }
}
