//! Origin check for websocket upgrades.
//!
//! Browsers let any page open a websocket to any host and only report the
//! page's `Origin`, so the server has to compare it against an allowlist.
//! Localhost variants are always allowed; deployments add their own
//! front-end origins through `[security] allowed_origins`.

use axum::http::{HeaderMap, StatusCode};

/// Allowed in every configuration.
pub const DEFAULT_ALLOWED_ORIGINS: &[&str] = &[
    "http://localhost",
    "https://localhost",
    "http://127.0.0.1",
    "https://127.0.0.1",
    "http://[::1]",
    "https://[::1]",
];

/// Localhost defaults followed by `extra`, without duplicates.
pub fn allowed_origins(extra: &[String]) -> Vec<String> {
    let mut origins: Vec<String> = DEFAULT_ALLOWED_ORIGINS
        .iter()
        .map(|s| s.to_string())
        .collect();
    for origin in extra {
        let origin = origin.trim().trim_end_matches('/');
        if !origin.is_empty() && !origins.iter().any(|o| o == origin) {
            origins.push(origin.to_string());
        }
    }
    origins
}

/// `Ok` when the `Origin` header equals an allowed origin, optionally
/// followed by `:<port>`. Missing or non-UTF-8 origins are rejected.
pub fn validate_websocket_origin(
    headers: &HeaderMap,
    allowed_origins: &[String],
) -> Result<(), StatusCode> {
    let origin = headers
        .get("origin")
        .ok_or(StatusCode::FORBIDDEN)?
        .to_str()
        .map_err(|_| StatusCode::FORBIDDEN)?;

    let is_allowed = allowed_origins.iter().any(|allowed| {
        if origin == allowed {
            return true;
        }
        origin
            .strip_prefix(allowed.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
            .is_some_and(|port| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
    });

    if is_allowed {
        Ok(())
    } else {
        Err(StatusCode::FORBIDDEN)
    }
}
