use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use th_bridge::auth::JwtAuthenticator;
use th_bridge::http_api::{router, AppState};
use th_bridge::hub::{ConnectionHub, HubConfig};
use th_bridge::protocol::{ClientEvent, CloseReason, ServerEvent};
use th_core::collab::ProjectDirResolver;
use th_core::types::UserId;
use th_session::registry::{RegistryConfig, SessionRegistry};
use th_session::testing::ScriptedBackend;
use tower::ServiceExt;

struct Fixture {
    _root: tempfile::TempDir,
    hub: Arc<ConnectionHub>,
    auth: JwtAuthenticator,
    app: Router,
}

fn fixture() -> Fixture {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("blog")).unwrap();
    let registry = Arc::new(SessionRegistry::new(
        Arc::new(ScriptedBackend::new()),
        Arc::new(ProjectDirResolver::new(root.path(), root.path())),
        RegistryConfig::default(),
    ));
    let auth = JwtAuthenticator::new("http-test-secret");
    let hub = ConnectionHub::new(registry, Arc::new(auth.clone()), HubConfig::default());
    let app = router(AppState::new(hub.clone(), &[], Duration::from_secs(30)));
    Fixture {
        _root: root,
        hub,
        auth,
        app,
    }
}

impl Fixture {
    fn token(&self, user: &str) -> String {
        self.auth
            .issue_token(&UserId::new(user), user, Duration::from_secs(300))
            .unwrap()
    }

    async fn request(&self, method: &str, uri: &str, user: Option<&str>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header("Authorization", format!("Bearer {}", self.token(user)));
        }
        let resp = self
            .app
            .clone()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    /// Bind a hub connection for `user` to `scope` and return it.
    async fn join(&self, user: &str, scope: &str) -> th_bridge::hub::ConnectionHandle {
        let conn = self.hub.connect();
        conn.send(ClientEvent::Join {
            scope: scope.into(),
            token: self.token(user),
            resume: None,
            fresh: false,
        });
        let ev = tokio::time::timeout(Duration::from_secs(2), conn.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(ev, ServerEvent::Joined { .. }), "{ev:?}");
        conn
    }
}

#[tokio::test]
async fn health_is_open() {
    let fx = fixture();
    let (status, body) = fx.request("GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"], 0);
}

#[tokio::test]
async fn responses_carry_request_id() {
    let fx = fixture();
    let resp = fx
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("x-request-id", "abc123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.headers()["x-request-id"], "abc123");
}

#[tokio::test]
async fn api_requires_token() {
    let fx = fixture();
    for (method, uri) in [
        ("GET", "/api/sessions"),
        ("GET", "/api/scopes/blog/status"),
        ("DELETE", "/api/scopes/blog/session"),
    ] {
        let (status, body) = fx.request(method, uri, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{method} {uri}");
        assert_eq!(body["error"], "unauthorized");
    }
}

#[tokio::test]
async fn scope_status_tracks_session() {
    let fx = fixture();
    let (status, body) = fx.request("GET", "/api/scopes/blog/status", Some("alice")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "absent");

    let _conn = fx.join("alice", "blog").await;
    let (_, body) = fx.request("GET", "/api/scopes/blog/status", Some("alice")).await;
    assert_eq!(body["status"], "ready");
    assert_eq!(body["scope"], "blog");

    // Scopes are per user.
    let (_, body) = fx.request("GET", "/api/scopes/blog/status", Some("bob")).await;
    assert_eq!(body["status"], "absent");
}

#[tokio::test]
async fn delete_session_closes_bound_connections() {
    let fx = fixture();
    let (status, _) = fx.request("DELETE", "/api/scopes/blog/session", Some("alice")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let conn = fx.join("alice", "blog").await;
    let (status, body) = fx.request("DELETE", "/api/scopes/blog/session", Some("alice")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["session_id"].is_string());

    let ev = tokio::time::timeout(Duration::from_secs(2), conn.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        ev,
        ServerEvent::Closed {
            reason: CloseReason::Destroyed
        }
    );
    let (_, body) = fx.request("GET", "/api/scopes/blog/status", Some("alice")).await;
    assert_eq!(body["status"], "absent");
}

#[tokio::test]
async fn sessions_are_listed_per_user() {
    let fx = fixture();
    let _a1 = fx.join("alice", "blog").await;
    let _a2 = fx.join("alice", "global").await;
    let _b = fx.join("bob", "blog").await;

    let (status, body) = fx.request("GET", "/api/sessions", Some("alice")).await;
    assert_eq!(status, StatusCode::OK);
    let sessions = body.as_array().unwrap();
    assert_eq!(sessions.len(), 2);
    assert!(sessions.iter().all(|s| s["user_id"] == "alice"));
    assert!(sessions.iter().any(|s| s["scope"] == "global"));
    assert!(sessions.iter().all(|s| s["subscribers"] == 1));
}
