//! Interfaces to the collaborators that live outside the session bridge:
//! token verification and project directory lookup.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::types::{Scope, UserId};

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing credentials")]
    Missing,
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("invalid token signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

/// Verifies a client credential and yields the user it belongs to.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn authenticate(&self, token: &str) -> Result<UserId, AuthError>;
}

// ---------------------------------------------------------------------------
// Working directory resolution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("project not found: {0}")]
    NotFound(String),
    #[error("invalid project id: {0}")]
    InvalidId(String),
}

/// Maps a scope to the directory its session should start in.
#[async_trait]
pub trait WorkspaceResolver: Send + Sync + 'static {
    async fn resolve_working_dir(&self, scope: &Scope) -> Result<PathBuf, ResolveError>;
}

/// Resolves projects as sub-directories of a single root
/// (`<root>/<project_id>`); the global scope maps to a fixed directory.
#[derive(Debug, Clone)]
pub struct ProjectDirResolver {
    root: PathBuf,
    global_dir: PathBuf,
}

impl ProjectDirResolver {
    pub fn new(root: impl Into<PathBuf>, global_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            global_dir: global_dir.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn validate_id(project_id: &str) -> Result<(), ResolveError> {
        let ok = !project_id.is_empty()
            && project_id != "."
            && project_id != ".."
            && !project_id.contains(['/', '\\', '\0']);
        if ok {
            Ok(())
        } else {
            Err(ResolveError::InvalidId(project_id.to_string()))
        }
    }
}

#[async_trait]
impl WorkspaceResolver for ProjectDirResolver {
    async fn resolve_working_dir(&self, scope: &Scope) -> Result<PathBuf, ResolveError> {
        let project_id = match scope {
            Scope::Global => return Ok(self.global_dir.clone()),
            Scope::Project(id) => id,
        };
        Self::validate_id(project_id)?;

        let dir = self.root.join(project_id);
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => {
                debug!(project_id, dir = %dir.display(), "resolved project directory");
                Ok(dir)
            }
            _ => Err(ResolveError::NotFound(project_id.clone())),
        }
    }
}
