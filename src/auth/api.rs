//! Authentication API Endpoints
//! Mission: Registration and login for the push-gateway/backtest surface

use crate::auth::{
    jwt::JwtHandler,
    models::{LoginRequest, LoginResponse, RegisterRequest, RegisterResponse},
    user_store::{UserStore, UserStoreError},
};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tracing::{info, warn};

const MIN_PASSWORD_LEN: usize = 6;

/// Shared auth state.
#[derive(Clone)]
pub struct AuthState {
    pub user_store: Arc<UserStore>,
    pub jwt_handler: Arc<JwtHandler>,
}

impl AuthState {
    pub fn new(user_store: Arc<UserStore>, jwt_handler: Arc<JwtHandler>) -> Self {
        Self {
            user_store,
            jwt_handler,
        }
    }
}

/// POST /api/v1/register
pub async fn register(
    State(state): State<AuthState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), AuthApiError> {
    if payload.password.len() < MIN_PASSWORD_LEN {
        return Err(AuthApiError::WeakPassword);
    }

    let user = state
        .user_store
        .create_user(&payload.email, &payload.password)
        .await
        .map_err(|e| match e {
            UserStoreError::EmailTaken => AuthApiError::EmailTaken,
            UserStoreError::Other(err) => {
                warn!(error = %err, "failed to register user");
                AuthApiError::InternalError
            }
        })?;

    info!(email = %user.email, "registered user");

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse { id: user.id }),
    ))
}

/// POST /api/v1/login
pub async fn login(
    State(state): State<AuthState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, AuthApiError> {
    let user = state
        .user_store
        .verify_password(&payload.email, &payload.password)
        .await
        .map_err(|_| AuthApiError::InternalError)?
        .ok_or(AuthApiError::InvalidCredentials)?;

    let token = state
        .jwt_handler
        .generate_token(&user)
        .map_err(|_| AuthApiError::InternalError)?;

    info!(email = %user.email, "login succeeded");

    Ok(Json(LoginResponse { token }))
}

/// Auth API errors
#[derive(Debug)]
pub enum AuthApiError {
    InvalidCredentials,
    EmailTaken,
    WeakPassword,
    InternalError,
}

impl IntoResponse for AuthApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthApiError::InvalidCredentials => {
                (StatusCode::UNAUTHORIZED, "invalid email or password")
            }
            AuthApiError::EmailTaken => (StatusCode::CONFLICT, "email already registered"),
            AuthApiError::WeakPassword => (
                StatusCode::BAD_REQUEST,
                "password must be at least 6 characters",
            ),
            AuthApiError::InternalError => (StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_api_error_responses() {
        let invalid_creds = AuthApiError::InvalidCredentials.into_response();
        assert_eq!(invalid_creds.status(), StatusCode::UNAUTHORIZED);

        let taken = AuthApiError::EmailTaken.into_response();
        assert_eq!(taken.status(), StatusCode::CONFLICT);

        let weak = AuthApiError::WeakPassword.into_response();
        assert_eq!(weak.status(), StatusCode::BAD_REQUEST);
    }
}
