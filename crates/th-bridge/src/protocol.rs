//! JSON messages exchanged over the websocket, tagged by `type`.
//!
//! ```text
//! -> {"type":"join","scope":"blog","token":"...","resume":{"session_id":"...","sequence":7}}
//! <- {"type":"joined","session_id":"...","snapshot":"","sequence":7,"resumed":true,"gap":false}
//! -> {"type":"message","bound_id":"...","text":"ls"}
//! <- {"type":"output","delta":"README.md\n","sequence":8}
//! ```

use serde::{Deserialize, Serialize};
use th_core::types::SessionId;
use th_session::EndReason;

/// Where a reconnecting client left off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resume {
    pub session_id: SessionId,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Bind to the session for `scope` (`"global"` or empty for the user's
    /// global shell, otherwise a project id).
    Join {
        #[serde(default)]
        scope: String,
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume: Option<Resume>,
        /// Replace a dead session instead of failing with `session_dead`.
        #[serde(default)]
        fresh: bool,
    },
    /// A line of input, submitted with Enter.
    Message { bound_id: SessionId, text: String },
    /// Raw keystrokes, sent as-is.
    Input { bound_id: SessionId, data: String },
    Resize { cols: u16, rows: u16 },
    Leave,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Joined {
        session_id: SessionId,
        /// Full content, or only the missed tail when `resumed` is true.
        snapshot: String,
        sequence: u64,
        resumed: bool,
        gap: bool,
    },
    Output {
        delta: String,
        sequence: u64,
    },
    /// Replace everything shown so far.
    Resync {
        snapshot: String,
        sequence: u64,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
    Closed {
        reason: CloseReason,
    },
}

impl ServerEvent {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthorized,
    ScopeNotFound,
    SessionDead,
    NotBound,
    SpawnFailed,
    Lagged,
    BadRequest,
    Internal,
}

impl ErrorKind {
    /// Whether retrying the same request can succeed without the user
    /// changing anything.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::SpawnFailed | ErrorKind::Lagged | ErrorKind::Internal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The client sent `leave`.
    Left,
    /// The session's process exited.
    Exited,
    /// The session was torn down.
    Destroyed,
    /// The daemon is stopping.
    Shutdown,
    /// The connection missed its liveness deadline.
    Timeout,
    Unauthorized,
}

impl From<EndReason> for CloseReason {
    fn from(reason: EndReason) -> Self {
        match reason {
            EndReason::Exited => CloseReason::Exited,
            EndReason::Destroyed => CloseReason::Destroyed,
            EndReason::Shutdown => CloseReason::Shutdown,
        }
    }
}
