use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::warn;

// ---------------------------------------------------------------------------
// ConnectionState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Connected, no successful join yet.
    Unauthenticated,
    /// Subscribed to exactly one session.
    Bound,
    /// Was bound, the session went away; may join again.
    Unbound,
    /// Terminal.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Unauthenticated => "unauthenticated",
            ConnectionState::Bound => "bound",
            ConnectionState::Unbound => "unbound",
            ConnectionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEvent {
    /// A join succeeded.
    Joined,
    /// The bound session ended, was destroyed, or dropped us.
    Unbind,
    Leave,
    /// Liveness deadline missed or the daemon is stopping.
    Expire,
    AuthFailed,
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionEvent::Joined => "joined",
            ConnectionEvent::Unbind => "unbind",
            ConnectionEvent::Leave => "leave",
            ConnectionEvent::Expire => "expire",
            ConnectionEvent::AuthFailed => "auth_failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid connection transition: cannot apply {event} in state {state}")]
pub struct InvalidTransition {
    pub state: ConnectionState,
    pub event: ConnectionEvent,
}

/// Lifecycle of one client connection.
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    current: ConnectionState,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            current: ConnectionState::Unauthenticated,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.current
    }

    /// Valid transitions:
    /// - Unauthenticated | Bound | Unbound + Joined -> Bound
    /// - Bound + Unbind -> Unbound
    /// - Unauthenticated | Bound | Unbound + Leave | Expire | AuthFailed -> Closed
    pub fn transition(
        &mut self,
        event: ConnectionEvent,
    ) -> Result<ConnectionState, InvalidTransition> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        let next = match (self.current, event) {
            (S::Closed, _) => {
                return Err(InvalidTransition {
                    state: self.current,
                    event,
                })
            }
            (_, E::Joined) => S::Bound,
            (S::Bound, E::Unbind) => S::Unbound,
            (_, E::Leave | E::Expire | E::AuthFailed) => S::Closed,
            _ => {
                return Err(InvalidTransition {
                    state: self.current,
                    event,
                })
            }
        };

        let from = self.current;
        self.current = next;
        tracing::debug!(from = %from, event = %event, to = %next, "connection state transition");
        Ok(next)
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

/// Last time the transport heard from the client (any frame, including
/// pongs). Shared between the transport and the hub's reaper.
#[derive(Debug)]
pub struct Liveness {
    last_seen: Mutex<Instant>,
}

impl Liveness {
    pub fn new() -> Self {
        Self {
            last_seen: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.lock() = Instant::now();
    }

    pub fn silent_for(&self) -> Duration {
        self.lock().elapsed()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Instant> {
        self.last_seen.lock().unwrap_or_else(|e| {
            warn!("liveness lock was poisoned, recovering");
            e.into_inner()
        })
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_then_session_end_then_rejoin() {
        let mut sm = ConnectionStateMachine::new();
        assert_eq!(sm.transition(ConnectionEvent::Joined).unwrap(), ConnectionState::Bound);
        assert_eq!(sm.transition(ConnectionEvent::Unbind).unwrap(), ConnectionState::Unbound);
        assert_eq!(sm.transition(ConnectionEvent::Joined).unwrap(), ConnectionState::Bound);
        // Rejoin while bound is allowed.
        assert_eq!(sm.transition(ConnectionEvent::Joined).unwrap(), ConnectionState::Bound);
    }

    #[test]
    fn unbind_requires_binding() {
        let mut sm = ConnectionStateMachine::new();
        assert!(sm.transition(ConnectionEvent::Unbind).is_err());
        assert_eq!(sm.state(), ConnectionState::Unauthenticated);
    }

    #[test]
    fn closed_is_terminal() {
        for event in [ConnectionEvent::Leave, ConnectionEvent::Expire, ConnectionEvent::AuthFailed] {
            let mut sm = ConnectionStateMachine::new();
            assert_eq!(sm.transition(event).unwrap(), ConnectionState::Closed);
            assert!(sm.transition(ConnectionEvent::Joined).is_err());
            assert!(sm.transition(ConnectionEvent::Leave).is_err());
        }
    }

    #[test]
    fn liveness_resets_on_touch() {
        let l = Liveness::new();
        std::thread::sleep(Duration::from_millis(20));
        assert!(l.silent_for() >= Duration::from_millis(20));
        l.touch();
        assert!(l.silent_for() < Duration::from_millis(20));
    }
}
