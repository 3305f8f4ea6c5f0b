use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session pool is at capacity ({max})")]
    AtCapacity { max: usize },

    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    #[error("backing process has exited")]
    SessionDead,

    #[error("backend does not support full-screen capture")]
    CaptureUnsupported,

    #[error("backend command failed: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
