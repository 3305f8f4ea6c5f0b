use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Authenticated user identity as returned by the token verifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identifier of one backing session. A recreated session always
/// gets a new identifier, so clients can tell a resumed stream from a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// What a session is rooted at: the user's global shell or one project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Scope {
    Global,
    Project(String),
}

impl Scope {
    /// Reserved wire name for the global scope.
    pub const GLOBAL: &'static str = "global";

    /// Parse the wire form used by clients: `"global"` (or empty) is the
    /// global scope, anything else is a project id.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() || raw == Self::GLOBAL {
            Scope::Global
        } else {
            Scope::Project(raw.to_string())
        }
    }

    pub fn project_id(&self) -> Option<&str> {
        match self {
            Scope::Global => None,
            Scope::Project(id) => Some(id),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => f.write_str(Self::GLOBAL),
            Scope::Project(id) => f.write_str(id),
        }
    }
}

/// The (user, scope) pair that identifies which session a join targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeKey {
    pub user: UserId,
    pub scope: Scope,
}

impl ScopeKey {
    pub fn new(user: UserId, scope: Scope) -> Self {
        Self { user, scope }
    }

    pub fn global(user: UserId) -> Self {
        Self::new(user, Scope::Global)
    }

    pub fn project(user: UserId, project_id: impl Into<String>) -> Self {
        Self::new(user, Scope::Project(project_id.into()))
    }

    /// Filesystem- and tmux-safe slug, stable across restarts.
    ///
    /// The readable part is lossy, so it ends in a digest of the raw
    /// (user, scope) pair: distinct keys never share a slug.
    pub fn slug(&self) -> String {
        format!(
            "{}_{}-{}",
            sanitize(self.user.as_str()),
            sanitize(&self.scope.to_string()),
            self.digest()
        )
    }

    /// Well-known backing session name: `<prefix>-<slug>`.
    pub fn session_name(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.slug())
    }

    /// First 16 hex chars of SHA-256 over the length-prefixed user and the
    /// tagged scope.
    fn digest(&self) -> String {
        let user = self.user.as_str();
        let mut hasher = Sha256::new();
        hasher.update(user.len().to_string().as_bytes());
        hasher.update(b":");
        hasher.update(user.as_bytes());
        match &self.scope {
            Scope::Global => hasher.update(b"g"),
            Scope::Project(id) => {
                hasher.update(b"p");
                hasher.update(id.as_bytes());
            }
        }
        let hex = format!("{:x}", hasher.finalize());
        hex[..16].to_string()
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user, self.scope)
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle state of a backing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Backing process is being spawned or attached.
    Starting,
    /// Process is alive and output is flowing.
    Ready,
    /// Process is alive but the last capture attempt failed.
    Degraded,
    /// Process has exited or the session was torn down.
    Dead,
}

impl SessionState {
    pub fn is_live(self) -> bool {
        !matches!(self, SessionState::Dead)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Starting => "starting",
            SessionState::Ready => "ready",
            SessionState::Degraded => "degraded",
            SessionState::Dead => "dead",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_parse_global_aliases() {
        assert_eq!(Scope::parse("global"), Scope::Global);
        assert_eq!(Scope::parse("  "), Scope::Global);
        assert_eq!(Scope::parse("blog"), Scope::Project("blog".into()));
    }

    #[test]
    fn session_name_is_tmux_safe() {
        let key = ScopeKey::project(UserId::new("alice@example.com"), "my.site:v2");
        let name = key.session_name("termhub");
        assert!(name.starts_with("termhub-alice_example_com_my_site_v2-"), "{name}");
        assert!(!name.contains('.') && !name.contains(':'));
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_eq!(name, key.session_name("termhub"));
    }

    #[test]
    fn lookalike_keys_get_distinct_names() {
        let pairs = [
            (
                ScopeKey::project(UserId::new("alice_x"), "blog"),
                ScopeKey::project(UserId::new("alice"), "x_blog"),
            ),
            (
                ScopeKey::project(UserId::new("a.b"), "c"),
                ScopeKey::project(UserId::new("a_b"), "c"),
            ),
            (
                ScopeKey::project(UserId::new("ab"), "c"),
                ScopeKey::project(UserId::new("a"), "bc"),
            ),
            (
                ScopeKey::global(UserId::new("bob")),
                ScopeKey::new(UserId::new("bob"), Scope::Project("global".into())),
            ),
        ];
        for (left, right) in pairs {
            assert_ne!(left.session_name("termhub"), right.session_name("termhub"));
        }
    }

    #[test]
    fn global_and_project_slugs_differ() {
        let user = UserId::new("bob");
        assert_ne!(
            ScopeKey::global(user.clone()).slug(),
            ScopeKey::project(user, "blog").slug()
        );
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
        let id = SessionId::new();
        assert_eq!(SessionId::parse(&id.to_string()), Some(id));
        assert_eq!(SessionId::parse("nope"), None);
    }

    #[test]
    fn only_dead_is_not_live() {
        assert!(SessionState::Starting.is_live());
        assert!(SessionState::Ready.is_live());
        assert!(SessionState::Degraded.is_live());
        assert!(!SessionState::Dead.is_live());
        assert_eq!(SessionState::Degraded.to_string(), "degraded");
    }
}
