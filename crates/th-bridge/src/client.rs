//! Reconnecting websocket client.
//!
//! Keeps a local [`ClientView`] of the bound session and, when the transport
//! drops, rejoins with `resume{session_id, sequence}` after an exponential
//! backoff. Once the attempts are used up the client gives up with
//! [`ClientError::Exhausted`] and the user has to reconnect manually.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use th_core::types::SessionId;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::protocol::{ClientEvent, CloseReason, ErrorKind, Resume, ServerEvent};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("server rejected join ({kind:?}): {message}")]
    Rejected { kind: ErrorKind, message: String },

    #[error("gave up after {attempts} attempts; reconnect manually")]
    Exhausted { attempts: u32 },

    #[error("not bound to a session")]
    NotBound,

    #[error("protocol: {0}")]
    Protocol(String),
}

impl ClientError {
    /// Worth another connection attempt.
    fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport(_) | ClientError::Protocol(_) => true,
            ClientError::Rejected { kind, .. } => kind.is_retryable(),
            ClientError::Exhausted { .. } | ClientError::NotBound => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

// ---------------------------------------------------------------------------
// ReconnectPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 8,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

// ---------------------------------------------------------------------------
// ClientView
// ---------------------------------------------------------------------------

/// What the user sees: the bound session's content up to `sequence`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientView {
    session_id: Option<SessionId>,
    sequence: u64,
    content: String,
}

impl ClientView {
    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Where to resume from on the next join, if anything is bound.
    pub fn resume(&self) -> Option<Resume> {
        self.session_id.map(|session_id| Resume {
            session_id,
            sequence: self.sequence,
        })
    }

    pub fn apply(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::Joined {
                session_id,
                snapshot,
                sequence,
                resumed,
                ..
            } => {
                if *resumed && self.session_id == Some(*session_id) {
                    self.content.push_str(snapshot);
                } else {
                    self.content = snapshot.clone();
                }
                self.session_id = Some(*session_id);
                self.sequence = *sequence;
            }
            ServerEvent::Output { delta, sequence } => {
                if *sequence > self.sequence {
                    self.content.push_str(delta);
                    self.sequence = *sequence;
                }
            }
            ServerEvent::Resync { snapshot, sequence } => {
                self.content = snapshot.clone();
                self.sequence = *sequence;
            }
            ServerEvent::Closed {
                reason: CloseReason::Exited | CloseReason::Destroyed,
            } => {
                // Nothing left to resume; the next join starts over.
                self.session_id = None;
                self.sequence = 0;
            }
            ServerEvent::Closed { .. } | ServerEvent::Error { .. } => {}
        }
    }
}

// ---------------------------------------------------------------------------
// ReconnectingClient
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// `ws://host:port/ws`
    pub url: String,
    /// Sent as the `Origin` header; must be on the server's allowlist.
    pub origin: Option<String>,
    pub scope: String,
    pub token: String,
    pub policy: ReconnectPolicy,
}

pub struct ReconnectingClient {
    options: ClientOptions,
    view: ClientView,
    socket: Option<Socket>,
}

impl ReconnectingClient {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            view: ClientView::default(),
            socket: None,
        }
    }

    pub fn view(&self) -> &ClientView {
        &self.view
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    /// Connect and join, retrying per the policy. Returns the `joined` event.
    pub async fn connect(&mut self) -> Result<ServerEvent> {
        self.connect_with(false).await
    }

    /// Like [`connect`](Self::connect), but asks the server to replace a
    /// dead session.
    pub async fn connect_fresh(&mut self) -> Result<ServerEvent> {
        self.connect_with(true).await
    }

    async fn connect_with(&mut self, fresh: bool) -> Result<ServerEvent> {
        self.socket = None;
        let policy = self.options.policy.clone();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.connect_once(fresh).await {
                Ok(joined) => {
                    info!(attempt, sequence = self.view.sequence(), "joined");
                    return Ok(joined);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    if attempt >= policy.max_attempts {
                        warn!(attempts = attempt, error = %e, "giving up; reconnect manually");
                        return Err(ClientError::Exhausted { attempts: attempt });
                    }
                    let delay = policy.delay_for(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "connect failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn connect_once(&mut self, fresh: bool) -> Result<ServerEvent> {
        let mut request = self.options.url.as_str().into_client_request()?;
        if let Some(origin) = &self.options.origin {
            let value = HeaderValue::from_str(origin)
                .map_err(|e| ClientError::Protocol(format!("origin header: {e}")))?;
            request.headers_mut().insert("origin", value);
        }
        let (mut socket, _) = tokio_tungstenite::connect_async(request).await?;

        let join = ClientEvent::Join {
            scope: self.options.scope.clone(),
            token: self.options.token.clone(),
            resume: self.view.resume(),
            fresh,
        };
        socket.send(encode(&join)?).await?;

        match read_event(&mut socket).await? {
            Some(event @ ServerEvent::Joined { .. }) => {
                self.view.apply(&event);
                self.socket = Some(socket);
                Ok(event)
            }
            Some(ServerEvent::Error { kind, message }) => {
                Err(ClientError::Rejected { kind, message })
            }
            Some(other) => Err(ClientError::Protocol(format!(
                "expected joined, got {other:?}"
            ))),
            None => Err(ClientError::Protocol("closed before joined".into())),
        }
    }

    /// Submit a line to the bound session.
    pub async fn send_line(&mut self, text: &str) -> Result<()> {
        let bound_id = self.view.session_id().ok_or(ClientError::NotBound)?;
        self.send(ClientEvent::Message {
            bound_id,
            text: text.to_string(),
        })
        .await
    }

    pub async fn send(&mut self, event: ClientEvent) -> Result<()> {
        let socket = self.socket.as_mut().ok_or(ClientError::NotBound)?;
        if let Err(e) = socket.send(encode(&event)?).await {
            self.socket = None;
            return Err(e.into());
        }
        Ok(())
    }

    /// Next event from the server, applied to the view. A dropped transport
    /// is repaired transparently: the `joined` event of the rejoin is
    /// returned instead.
    pub async fn next_event(&mut self) -> Result<ServerEvent> {
        loop {
            let Some(socket) = self.socket.as_mut() else {
                return self.connect().await;
            };
            match read_event(socket).await {
                Ok(Some(event)) => {
                    self.view.apply(&event);
                    return Ok(event);
                }
                Ok(None) | Err(_) => {
                    debug!("transport dropped, reconnecting");
                    self.socket = None;
                }
            }
        }
    }

    /// Send `leave` and close the socket.
    pub async fn leave(&mut self) -> Result<()> {
        if let Some(mut socket) = self.socket.take() {
            socket.send(encode(&ClientEvent::Leave)?).await?;
            let _ = socket.close(None).await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ReconnectingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectingClient")
            .field("url", &self.options.url)
            .field("scope", &self.options.scope)
            .field("connected", &self.socket.is_some())
            .field("view", &self.view)
            .finish()
    }
}

fn encode(event: &ClientEvent) -> Result<Message> {
    let text = serde_json::to_string(event).map_err(|e| ClientError::Protocol(e.to_string()))?;
    Ok(Message::text(text))
}

/// Next JSON event, skipping control frames. `None` once the server closed.
async fn read_event(socket: &mut Socket) -> Result<Option<ServerEvent>> {
    while let Some(frame) = socket.next().await {
        match frame? {
            Message::Text(text) => {
                let event = serde_json::from_str(text.as_str())
                    .map_err(|e| ClientError::Protocol(format!("bad server frame: {e}")))?;
                return Ok(Some(event));
            }
            Message::Close(_) => return Ok(None),
            _ => continue,
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_attempts: 10,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_secs(1));
        assert_eq!(policy.delay_for(64), Duration::from_secs(1));
    }

    #[test]
    fn view_follows_joined_output_and_resync() {
        let id = SessionId::new();
        let mut view = ClientView::default();
        view.apply(&ServerEvent::Joined {
            session_id: id,
            snapshot: "a\n".into(),
            sequence: 1,
            resumed: false,
            gap: false,
        });
        view.apply(&ServerEvent::Output {
            delta: "b\n".into(),
            sequence: 2,
        });
        // Duplicate delivery is ignored.
        view.apply(&ServerEvent::Output {
            delta: "b\n".into(),
            sequence: 2,
        });
        assert_eq!(view.content(), "a\nb\n");
        assert_eq!(view.resume(), Some(Resume { session_id: id, sequence: 2 }));

        view.apply(&ServerEvent::Joined {
            session_id: id,
            snapshot: "c\n".into(),
            sequence: 3,
            resumed: true,
            gap: false,
        });
        assert_eq!(view.content(), "a\nb\nc\n");

        view.apply(&ServerEvent::Resync {
            snapshot: "$ ".into(),
            sequence: 4,
        });
        assert_eq!(view.content(), "$ ");
        assert_eq!(view.sequence(), 4);
    }

    #[test]
    fn gap_join_replaces_content() {
        let id = SessionId::new();
        let mut view = ClientView::default();
        view.apply(&ServerEvent::Joined {
            session_id: id,
            snapshot: "old".into(),
            sequence: 1,
            resumed: false,
            gap: false,
        });
        view.apply(&ServerEvent::Joined {
            session_id: id,
            snapshot: "whole screen".into(),
            sequence: 9,
            resumed: false,
            gap: true,
        });
        assert_eq!(view.content(), "whole screen");
    }

    #[test]
    fn ended_session_is_not_resumed() {
        let mut view = ClientView::default();
        view.apply(&ServerEvent::Joined {
            session_id: SessionId::new(),
            snapshot: String::new(),
            sequence: 0,
            resumed: false,
            gap: false,
        });
        view.apply(&ServerEvent::Closed {
            reason: CloseReason::Destroyed,
        });
        assert_eq!(view.resume(), None);
    }

    #[tokio::test]
    async fn unreachable_server_exhausts_attempts() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut client = ReconnectingClient::new(ClientOptions {
            url: format!("ws://{addr}/ws"),
            origin: None,
            scope: "global".into(),
            token: "t".into(),
            policy: ReconnectPolicy {
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(10),
                max_attempts: 3,
            },
        });
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::Exhausted { attempts: 3 }));
        assert!(err.to_string().contains("reconnect manually"));
        assert!(!client.is_connected());
    }
}
