//! HTTP error responses.
//!
//! Every handler error becomes a JSON body `{"error": "..."}` with a
//! matching status code.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use th_session::RegistryError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::ScopeNotFound(_) | RegistryError::NotFound(_) => {
                ApiError::NotFound(e.to_string())
            }
            RegistryError::SessionDead(_) => ApiError::BadRequest(e.to_string()),
            RegistryError::AtCapacity { .. } | RegistryError::SpawnFailed(_) => {
                ApiError::Internal(e.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match self {
            ApiError::NotFound(msg) | ApiError::BadRequest(msg) | ApiError::Internal(msg) => msg,
            ApiError::Unauthorized => "unauthorized".to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_of(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn not_found_response() {
        let response = ApiError::NotFound("scope not found: blog".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_of(response).await["error"], "scope not found: blog");
    }

    #[tokio::test]
    async fn unauthorized_response() {
        let response = ApiError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_of(response).await["error"], "unauthorized");
    }

    #[test]
    fn registry_errors_map_to_statuses() {
        let e: ApiError = RegistryError::ScopeNotFound("ghost".into()).into();
        assert!(matches!(e, ApiError::NotFound(_)));
        let e: ApiError = RegistryError::AtCapacity { max: 1 }.into();
        assert!(matches!(e, ApiError::Internal(_)));
    }
}
