//! HTTP-facing error type.
//!
//! spec.md §7 separates "request validation" (4xx, no retry) from the
//! transient/fatal classes that never reach a client. The teacher maps
//! `StatusCode` manually per-handler (`api/routes.rs`); with a larger route
//! surface that repeats, so this pulls the `thiserror` + `IntoResponse`
//! pairing from `nuniesmith-kraken_regime`, the pack example closest to a
//! dedicated domain-error enum sitting alongside `anyhow`-wrapped infra
//! errors.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            ApiError::Internal(err) => {
                tracing::error!(error = %err, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".into())
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
