//! Client-facing side of termhub.
//!
//! - [`hub`]: one actor per client connection, binding it to a session
//! - [`protocol`]: the JSON events exchanged over the websocket
//! - [`ws`] and [`http_api`]: the axum transport and REST surface
//! - [`auth`]: HS256 bearer tokens for joins and API routes
//! - [`client`]: a reconnecting websocket client with resume

pub mod api_error;
pub mod auth;
pub mod client;
pub mod connection;
pub mod http_api;
pub mod hub;
pub mod origin_validation;
pub mod protocol;
pub mod ws;

pub use auth::{AuthLayer, AuthUser, JwtAuthenticator};
pub use hub::{ConnectionHandle, ConnectionHub, HubConfig, HubError};
pub use http_api::{router, AppState};
pub use protocol::{ClientEvent, CloseReason, ErrorKind, Resume, ServerEvent};
