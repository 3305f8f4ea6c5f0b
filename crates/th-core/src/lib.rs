//! Shared foundation for termhub.
//!
//! - [`types`]: user, scope and session identity plus the session lifecycle
//! - [`config`]: TOML configuration loaded from `~/.termhub/config.toml`
//! - [`collab`]: traits for the external token verifier and project lookup
//! - [`shutdown`]: cooperative shutdown signal for long-running loops

pub mod collab;
pub mod config;
pub mod shutdown;
pub mod types;
