use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration loaded from `~/.termhub/config.toml`.
///
/// **Security**: this struct never stores the token signing secret. The
/// `[auth]` section only names the environment variable that holds it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub projects: ProjectsConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from `~/.termhub/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.auth.validate()?;
        self.session.validate()?;
        self.supervisor.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".termhub")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_daemon_port")]
    pub port: u16,
    #[serde(default = "default_daemon_host")]
    pub host: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: default_daemon_port(),
            host: default_daemon_host(),
        }
    }
}

fn default_daemon_port() -> u16 {
    5050
}
fn default_daemon_host() -> String {
    "127.0.0.1".into()
}

/// Token verification settings. Only the *name* of the secret's env var is
/// stored here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_secret_env")]
    pub secret_env: String,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret_env: default_secret_env(),
            token_ttl_secs: default_token_ttl(),
        }
    }
}

impl AuthConfig {
    /// Read the signing secret from the configured environment variable.
    pub fn secret(&self) -> Option<String> {
        std::env::var(&self.secret_env)
            .ok()
            .filter(|s| !s.trim().is_empty())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret_env.trim().is_empty() {
            return Err(ConfigError::Validation(
                "auth.secret_env must not be empty".to_string(),
            ));
        }
        if self.token_ttl_secs == 0 {
            return Err(ConfigError::Validation(
                "auth.token_ttl_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_secret_env() -> String {
    "TERMHUB_AUTH_SECRET".into()
}
fn default_token_ttl() -> u64 {
    86_400
}

/// Which implementation backs each session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// A native pseudo-terminal owned by this process.
    Pty,
    /// A detached tmux session that can outlive the daemon.
    Tmux,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Prefix for backing session names (`<prefix>-<scope slug>`).
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_buffer_bytes")]
    pub buffer_max_bytes: usize,
    #[serde(default = "default_buffer_lines")]
    pub buffer_max_lines: usize,
    /// Poll period for backends without an incremental output stream.
    #[serde(default = "default_capture_interval")]
    pub capture_interval_ms: u64,
    /// Per-connection queue depth before a slow subscriber is dropped.
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            shell: default_shell(),
            name_prefix: default_name_prefix(),
            max_sessions: default_max_sessions(),
            buffer_max_bytes: default_buffer_bytes(),
            buffer_max_lines: default_buffer_lines(),
            capture_interval_ms: default_capture_interval(),
            subscriber_queue: default_subscriber_queue(),
        }
    }
}

impl SessionConfig {
    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.capture_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shell.trim().is_empty() {
            return Err(ConfigError::Validation(
                "session.shell must not be empty".to_string(),
            ));
        }
        let prefix = self.name_prefix.trim();
        if prefix.is_empty()
            || !prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigError::Validation(format!(
                "session.name_prefix '{}' must be non-empty and use [A-Za-z0-9_-]",
                self.name_prefix
            )));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::Validation(
                "session.max_sessions must be greater than zero".to_string(),
            ));
        }
        if self.buffer_max_bytes == 0 || self.buffer_max_lines == 0 {
            return Err(ConfigError::Validation(
                "session.buffer_max_bytes and session.buffer_max_lines must be greater than zero"
                    .to_string(),
            ));
        }
        if self.capture_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "session.capture_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.subscriber_queue == 0 {
            return Err(ConfigError::Validation(
                "session.subscriber_queue must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_backend() -> BackendKind {
    BackendKind::Pty
}
fn default_shell() -> String {
    if cfg!(target_os = "macos") {
        "/bin/zsh".into()
    } else {
        "/bin/bash".into()
    }
}
fn default_name_prefix() -> String {
    "termhub".into()
}
fn default_max_sessions() -> usize {
    32
}
fn default_buffer_bytes() -> usize {
    64 * 1024
}
fn default_buffer_lines() -> usize {
    500
}
fn default_capture_interval() -> u64 {
    300
}
fn default_subscriber_queue() -> usize {
    256
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectsConfig {
    /// Directory that holds one sub-directory per project.
    #[serde(default = "default_projects_root")]
    pub root: String,
    /// Working directory for the per-user global session. Defaults to `$HOME`.
    #[serde(default)]
    pub global_dir: Option<String>,
}

impl Default for ProjectsConfig {
    fn default() -> Self {
        Self {
            root: default_projects_root(),
            global_dir: None,
        }
    }
}

impl ProjectsConfig {
    /// The projects root with a leading `~/` expanded.
    pub fn root_path(&self) -> PathBuf {
        expand_home(&self.root)
    }

    pub fn global_path(&self) -> PathBuf {
        match &self.global_dir {
            Some(dir) => expand_home(dir),
            None => dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")),
        }
    }
}

fn default_projects_root() -> String {
    "~/projects".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Sessions without subscribers for longer than this are torn down.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Connections that have not answered a ping for this long are closed.
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            idle_timeout_secs: default_idle_timeout(),
            ping_interval_secs: default_ping_interval(),
            ping_timeout_secs: default_ping_timeout(),
        }
    }
}

impl SupervisorConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_interval_secs == 0 || self.ping_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "supervisor intervals must be greater than zero".to_string(),
            ));
        }
        if self.ping_timeout_secs <= self.ping_interval_secs {
            return Err(ConfigError::Validation(format!(
                "supervisor.ping_timeout_secs ({}) must exceed ping_interval_secs ({})",
                self.ping_timeout_secs, self.ping_interval_secs
            )));
        }
        Ok(())
    }
}

fn default_sweep_interval() -> u64 {
    30
}
fn default_idle_timeout() -> u64 {
    3600
}
fn default_ping_interval() -> u64 {
    25
}
fn default_ping_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecurityConfig {
    /// Extra websocket origins allowed in addition to localhost.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.level.trim().is_empty() {
            return Err(ConfigError::Validation(
                "logging.level must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

/// Expand a leading `~/` to the current user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}
