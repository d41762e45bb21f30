//! Authentication API Endpoints
//! Mission: Exchange a user name and password for a JWT

use crate::auth::{
    jwt::JwtHandler,
    models::{LoginRequest, LoginResponse, UserResponse},
};
use crate::storage::StockDb;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AuthState {
    pub db: StockDb,
    pub jwt_handler: Arc<JwtHandler>,
}

impl AuthState {
    pub fn new(db: StockDb, jwt_handler: Arc<JwtHandler>) -> Self {
        Self { db, jwt_handler }
    }
}

/// Login endpoint - POST /api/auth/login
pub async fn login(
    State(state): State<AuthState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, AuthApiError> {
    info!("🔐 Login attempt: {}", payload.username);

    let user = state
        .db
        .verify_password(payload.username.trim(), &payload.password)
        .map_err(|e| {
            error!("Password check failed: {:#}", e);
            AuthApiError::InternalError
        })?;

    let Some(user) = user else {
        warn!("❌ Failed login attempt: {}", payload.username);
        return Err(AuthApiError::InvalidCredentials);
    };

    let issued = state.jwt_handler.issue(&user).map_err(|e| {
        error!("Token signing failed: {:#}", e);
        AuthApiError::InternalError
    })?;

    info!("✅ Login successful: {} ({})", user.name, user.id);

    Ok(Json(LoginResponse {
        token: issued.token,
        expires_in: issued.expires_in,
        user: UserResponse::from_user(&user),
    }))
}

#[derive(Debug)]
pub enum AuthApiError {
    InvalidCredentials,
    InternalError,
}

impl IntoResponse for AuthApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthApiError::InvalidCredentials => {
                (StatusCode::UNAUTHORIZED, "Invalid username or password")
            }
            AuthApiError::InternalError => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        (status, message).into_response()
    }
}
