//! tmux-backed sessions.
//!
//! Each scope gets a detached tmux session named after its scope key. Output
//! is obtained by polling `capture-pane`; there is no push stream. Because
//! tmux keeps running when the daemon exits, sessions are recovered by name
//! on the next start.

use std::process::Output;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::backend::{BackendHandle, Input, SessionBackend, SpawnRequest};
use crate::error::{Result, SessionError};

#[derive(Debug, Clone)]
pub struct TmuxBackend {
    program: String,
    history_lines: usize,
}

impl TmuxBackend {
    pub fn new(history_lines: usize) -> Self {
        Self {
            program: "tmux".to_string(),
            history_lines: history_lines.max(1),
        }
    }

    /// Use a different tmux binary (e.g. an absolute path).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn handle(&self, name: &str) -> Arc<dyn BackendHandle> {
        Arc::new(TmuxHandle {
            tmux: Tmux {
                program: self.program.clone(),
            },
            name: name.to_string(),
            history_lines: self.history_lines,
        })
    }
}

#[async_trait]
impl SessionBackend for TmuxBackend {
    fn kind(&self) -> &'static str {
        "tmux"
    }

    async fn spawn(&self, request: &SpawnRequest) -> Result<Arc<dyn BackendHandle>> {
        let tmux = Tmux {
            program: self.program.clone(),
        };
        let dir = request.working_dir.to_string_lossy().into_owned();
        let mut args: Vec<String> = vec![
            "new-session".into(),
            "-d".into(),
            "-s".into(),
            request.name.clone(),
            "-c".into(),
            dir,
        ];
        for (k, v) in &request.env {
            args.push("-e".into());
            args.push(format!("{k}={v}"));
        }
        let out = tmux.run(&args).await?;
        if !out.status.success() {
            return Err(SessionError::SpawnFailed(stderr_of(&out)));
        }

        let limit = self.history_lines.to_string();
        let out = tmux
            .run(&["set-option", "-t", request.name.as_str(), "history-limit", limit.as_str()])
            .await?;
        if !out.status.success() {
            warn!(name = %request.name, error = %stderr_of(&out), "could not set tmux history-limit");
        }

        info!(name = %request.name, "created tmux session");
        Ok(self.handle(&request.name))
    }

    async fn attach_existing(&self, name: &str) -> Result<Option<Arc<dyn BackendHandle>>> {
        let tmux = Tmux {
            program: self.program.clone(),
        };
        if tmux.has_session(name).await {
            info!(name, "re-attached to existing tmux session");
            Ok(Some(self.handle(name)))
        } else {
            Ok(None)
        }
    }
}

// ---------------------------------------------------------------------------
// TmuxHandle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Tmux {
    program: String,
}

impl Tmux {
    async fn run<S: AsRef<str>>(&self, args: &[S]) -> Result<Output> {
        let mut cmd = Command::new(&self.program);
        for a in args {
            cmd.arg(a.as_ref());
        }
        let out = cmd.kill_on_drop(true).output().await.map_err(|e| {
            SessionError::Backend(format!("failed to run {}: {e}", self.program))
        })?;
        Ok(out)
    }

    async fn has_session(&self, name: &str) -> bool {
        match self.run(&["has-session", "-t", name]).await {
            Ok(out) => out.status.success(),
            Err(e) => {
                debug!(name, error = %e, "has-session failed");
                false
            }
        }
    }
}

fn stderr_of(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).trim().to_string()
}

#[derive(Debug)]
pub struct TmuxHandle {
    tmux: Tmux,
    name: String,
    history_lines: usize,
}

#[async_trait]
impl BackendHandle for TmuxHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, input: &Input) -> Result<()> {
        if !self.tmux.has_session(&self.name).await {
            return Err(SessionError::SessionDead);
        }
        let text = input.text();
        if !text.is_empty() {
            let out = self
                .tmux
                .run(&["send-keys", "-t", self.name.as_str(), "-l", text])
                .await?;
            if !out.status.success() {
                return Err(SessionError::Backend(stderr_of(&out)));
            }
        }
        if matches!(input, Input::Line(_)) {
            let out = self
                .tmux
                .run(&["send-keys", "-t", self.name.as_str(), "Enter"])
                .await?;
            if !out.status.success() {
                return Err(SessionError::Backend(stderr_of(&out)));
            }
        }
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.tmux.has_session(&self.name).await
    }

    async fn capture(&self) -> Result<String> {
        let start = format!("-{}", self.history_lines);
        let out = self
            .tmux
            .run(&["capture-pane", "-p", "-t", self.name.as_str(), "-S", start.as_str()])
            .await?;
        if !out.status.success() {
            return Err(SessionError::Backend(stderr_of(&out)));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    fn output_stream(&self) -> Option<flume::Receiver<Vec<u8>>> {
        None
    }

    async fn terminate(&self) -> Result<()> {
        let out = self.tmux.run(&["kill-session", "-t", self.name.as_str()]).await?;
        if !out.status.success() {
            // Already gone is fine.
            debug!(name = %self.name, error = %stderr_of(&out), "kill-session reported an error");
        }
        Ok(())
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let (x, y) = (cols.to_string(), rows.to_string());
        let out = self
            .tmux
            .run(&["resize-window", "-t", self.name.as_str(), "-x", x.as_str(), "-y", y.as_str()])
            .await?;
        if !out.status.success() {
            return Err(SessionError::Backend(stderr_of(&out)));
        }
        Ok(())
    }

    fn survives_restart(&self) -> bool {
        true
    }
}
