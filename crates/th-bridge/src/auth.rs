//! Bearer-token authentication.
//!
//! Tokens are compact HS256 JWTs carrying `user_id`, `username` and `exp`.
//! [`JwtAuthenticator`] verifies them for websocket joins; [`AuthLayer`]
//! applies the same check to HTTP routes and hands the caller's identity to
//! handlers as an [`AuthUser`] extension.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, Response, StatusCode},
    response::IntoResponse,
};
use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use th_core::collab::{AuthError, Authenticator};
use th_core::types::UserId;
use tower::{Layer, Service};
use tracing::debug;

// ---------------------------------------------------------------------------
// JwtAuthenticator
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// String or number, depending on who minted the token.
    user_id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exp: Option<i64>,
}

/// HS256 token verifier sharing a secret with the token issuer.
#[derive(Clone)]
pub struct JwtAuthenticator {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // `exp` is checked when present; tokens minted without one never expire.
        validation.required_spec_claims.clear();
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret.as_ref()),
            decoding: DecodingKey::from_secret(secret.as_ref()),
            validation,
        }
    }

    /// Mint a token for `user_id` that expires after `ttl`.
    pub fn issue_token(
        &self,
        user_id: &UserId,
        username: &str,
        ttl: Duration,
    ) -> Result<String, AuthError> {
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = Claims {
            user_id: Value::String(user_id.as_str().to_string()),
            username: Some(username.to_string()),
            exp: Some(chrono::Utc::now().timestamp().saturating_add(ttl)),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::Malformed(e.to_string()))
    }

    /// Check signature and expiry and return the token's user.
    pub fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Missing);
        }

        let claims = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| match e.kind() {
                JwtErrorKind::ExpiredSignature => AuthError::Expired,
                JwtErrorKind::InvalidSignature => AuthError::BadSignature,
                _ => AuthError::Malformed(e.to_string()),
            })?
            .claims;

        let user_id = match &claims.user_id {
            Value::String(s) if !s.trim().is_empty() => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return Err(AuthError::Malformed("missing user_id".into())),
        };
        debug!(user_id = %user_id, username = claims.username.as_deref().unwrap_or(""), "token verified");
        Ok(UserId::new(user_id))
    }
}

impl std::fmt::Debug for JwtAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("JwtAuthenticator { .. }")
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<UserId, AuthError> {
        self.verify(token)
    }
}

// ---------------------------------------------------------------------------
// AuthLayer
// ---------------------------------------------------------------------------

/// Identity of the caller, inserted into request extensions by [`AuthLayer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser(pub UserId);

/// A [`tower::Layer`] that rejects requests without a valid
/// `Authorization: Bearer <token>` header.
#[derive(Clone)]
pub struct AuthLayer {
    auth: Arc<dyn Authenticator>,
}

impl AuthLayer {
    pub fn new(auth: Arc<dyn Authenticator>) -> Self {
        Self { auth }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthMiddleware {
            inner,
            auth: self.auth.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AuthMiddleware<S> {
    inner: S,
    auth: Arc<dyn Authenticator>,
}

impl<S> Service<Request<Body>> for AuthMiddleware<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let auth = self.auth.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let token = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_string);

            let result = match token {
                Some(token) => auth.authenticate(&token).await,
                None => Err(AuthError::Missing),
            };
            match result {
                Ok(user) => {
                    req.extensions_mut().insert(AuthUser(user));
                    inner.call(req).await
                }
                Err(e) => {
                    debug!(error = %e, path = %req.uri().path(), "rejected request");
                    Ok((
                        StatusCode::UNAUTHORIZED,
                        axum::Json(serde_json::json!({"error": "unauthorized"})),
                    )
                        .into_response())
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::{Extension, Router};
    use tower::ServiceExt;

    const SECRET: &str = "test-secret";

    fn sign_raw(secret: &str, alg: Algorithm, claims: &Value) -> String {
        jsonwebtoken::encode(
            &Header::new(alg),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn issued_token_verifies() {
        let auth = JwtAuthenticator::new(SECRET);
        let token = auth
            .issue_token(&UserId::new("alice"), "Alice", Duration::from_secs(60))
            .unwrap();
        assert_eq!(auth.verify(&token).unwrap(), UserId::new("alice"));
    }

    #[test]
    fn numeric_user_id_is_accepted() {
        let token = sign_raw(
            SECRET,
            Algorithm::HS256,
            &serde_json::json!({"user_id": 42, "username": "bob"}),
        );
        let auth = JwtAuthenticator::new(SECRET);
        assert_eq!(auth.verify(&token).unwrap(), UserId::new("42"));
    }

    #[test]
    fn token_without_exp_is_accepted() {
        let token = sign_raw(SECRET, Algorithm::HS256, &serde_json::json!({"user_id": "alice"}));
        assert_eq!(
            JwtAuthenticator::new(SECRET).verify(&token).unwrap(),
            UserId::new("alice")
        );
    }

    #[test]
    fn wrong_secret_is_bad_signature() {
        let token = JwtAuthenticator::new("other")
            .issue_token(&UserId::new("alice"), "Alice", Duration::from_secs(60))
            .unwrap();
        let err = JwtAuthenticator::new(SECRET).verify(&token).unwrap_err();
        assert_eq!(err, AuthError::BadSignature);
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = sign_raw(
            SECRET,
            Algorithm::HS256,
            &serde_json::json!({"user_id": "alice", "exp": 1_000}),
        );
        let err = JwtAuthenticator::new(SECRET).verify(&token).unwrap_err();
        assert_eq!(err, AuthError::Expired);
    }

    #[test]
    fn missing_user_id_is_malformed() {
        let token = sign_raw(SECRET, Algorithm::HS256, &serde_json::json!({"user_id": ""}));
        assert!(matches!(
            JwtAuthenticator::new(SECRET).verify(&token),
            Err(AuthError::Malformed(_))
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        let auth = JwtAuthenticator::new(SECRET);
        assert_eq!(auth.verify("").unwrap_err(), AuthError::Missing);
        assert!(matches!(auth.verify("a.b"), Err(AuthError::Malformed(_))));
        assert!(matches!(auth.verify("a.b.c.d"), Err(AuthError::Malformed(_))));
        assert!(matches!(auth.verify("!!.??.**"), Err(AuthError::Malformed(_))));
    }

    #[test]
    fn other_algorithms_are_rejected() {
        let hs512 = sign_raw(SECRET, Algorithm::HS512, &serde_json::json!({"user_id": "alice"}));
        // {"alg":"none"}.{"user_id":"alice"} with an empty signature
        let unsigned = "eyJhbGciOiJub25lIn0.eyJ1c2VyX2lkIjoiYWxpY2UifQ.";
        let auth = JwtAuthenticator::new(SECRET);
        for token in [hs512.as_str(), unsigned] {
            assert!(matches!(auth.verify(token), Err(AuthError::Malformed(_))), "{token}");
        }
    }

    fn test_router() -> (Router, JwtAuthenticator) {
        let auth = JwtAuthenticator::new(SECRET);
        let router = Router::new()
            .route(
                "/whoami",
                get(|Extension(AuthUser(user)): Extension<AuthUser>| async move {
                    user.to_string()
                }),
            )
            .layer(AuthLayer::new(Arc::new(auth.clone())));
        (router, auth)
    }

    #[tokio::test]
    async fn bearer_token_reaches_handler() {
        let (app, auth) = test_router();
        let token = auth
            .issue_token(&UserId::new("alice"), "Alice", Duration::from_secs(60))
            .unwrap();
        let req = Request::builder()
            .uri("/whoami")
            .header("Authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"alice");
    }

    #[tokio::test]
    async fn missing_header_returns_401() {
        let (app, _) = test_router();
        let req = Request::builder().uri("/whoami").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_bearer_returns_401() {
        let (app, _) = test_router();
        let req = Request::builder()
            .uri("/whoami")
            .header("Authorization", "Bearer nope")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
