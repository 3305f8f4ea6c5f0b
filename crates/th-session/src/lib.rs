//! Durable shell sessions for termhub.
//!
//! A [`registry::SessionRegistry`] maps each (user, scope) pair to at most
//! one live [`session::Session`]. Each session owns a backing shell (a native
//! PTY or a tmux session), a bounded scrollback with per-append sequence
//! numbers, and a list of subscribers that receive output in emission order.
//!
//! Key components:
//! - [`output_buffer`] bounded scrollback with snapshot and tail-since
//! - [`backend`] the seam to whatever runs the shell
//! - [`pty_pool`] / [`pty_backend`] native PTYs
//! - [`tmux`] tmux sessions that survive daemon restarts

pub mod backend;
pub mod error;
pub mod output_buffer;
pub mod pty_backend;
pub mod pty_pool;
pub mod registry;
pub mod session;
pub mod tmux;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use backend::{BackendHandle, Input, SessionBackend, SpawnRequest};
pub use error::SessionError;
pub use registry::{RegistryConfig, RegistryError, SessionRegistry};
pub use session::{CatchUp, EndReason, Session, SessionEvent, SessionInfo, SessionOptions, Subscription};
