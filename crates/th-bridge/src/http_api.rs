use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Path, State},
    middleware as axum_middleware,
    routing::{delete, get},
    Extension, Json, Router,
};
use serde::Serialize;
use th_core::types::{Scope, ScopeKey, SessionId};
use th_session::SessionInfo;
use th_telemetry::request_id::request_id_middleware;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api_error::ApiError;
use crate::auth::{AuthLayer, AuthUser};
use crate::hub::ConnectionHub;
use crate::origin_validation::allowed_origins;
use crate::ws;

/// Shared state for every HTTP and websocket handler.
pub struct AppState {
    pub hub: Arc<ConnectionHub>,
    pub allowed_origins: Vec<String>,
    pub ping_interval: Duration,
    pub started_at: Instant,
}

impl AppState {
    /// `extra_origins` are allowed in addition to the localhost defaults.
    pub fn new(hub: Arc<ConnectionHub>, extra_origins: &[String], ping_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            hub,
            allowed_origins: allowed_origins(extra_origins),
            ping_interval,
            started_at: Instant::now(),
        })
    }
}

/// Build the daemon's router.
///
/// `/health` and `/ws` are open (the websocket authenticates each `join`);
/// everything under `/api` requires a bearer token.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/api/scopes/{scope}/status", get(scope_status))
        .route("/api/scopes/{scope}/session", delete(destroy_scope_session))
        .route("/api/sessions", get(list_sessions))
        .layer(AuthLayer::new(state.hub.authenticator().clone()));

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws::ws_handler))
        .merge(api)
        .layer(axum_middleware::from_fn(request_id_middleware))
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    connections: usize,
    sessions: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let stats = state.hub.stats();
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.started_at.elapsed().as_secs(),
        connections: stats.connections,
        sessions: stats.sessions,
    })
}

#[derive(Debug, Serialize)]
struct ScopeStatus {
    scope: String,
    /// `starting|ready|degraded|dead`, or `absent` when no session exists.
    status: &'static str,
}

/// GET /api/scopes/{scope}/status
async fn scope_status(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(scope): Path<String>,
) -> Json<ScopeStatus> {
    let key = ScopeKey::new(user, Scope::parse(&scope));
    let status = state
        .hub
        .session_status(&key)
        .map(|s| s.as_str())
        .unwrap_or("absent");
    Json(ScopeStatus {
        scope: key.scope.to_string(),
        status,
    })
}

#[derive(Debug, Serialize)]
struct Destroyed {
    session_id: SessionId,
}

/// DELETE /api/scopes/{scope}/session
async fn destroy_scope_session(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(scope): Path<String>,
) -> Result<Json<Destroyed>, ApiError> {
    let key = ScopeKey::new(user, Scope::parse(&scope));
    match state.hub.destroy_session(&key).await {
        Some(session_id) => {
            info!(key = %key, %session_id, "session destroyed via api");
            Ok(Json(Destroyed { session_id }))
        }
        None => Err(ApiError::NotFound(format!("no session for scope {}", key.scope))),
    }
}

/// GET /api/sessions
async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> Json<Vec<SessionInfo>> {
    let mut sessions: Vec<SessionInfo> = state
        .hub
        .registry()
        .list_for_user(&user)
        .iter()
        .map(|s| s.info())
        .collect();
    sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Json(sessions)
}
