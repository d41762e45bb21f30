//! Endpoints for the signed-in user's own account and alert history.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    Extension,
};
use serde::Deserialize;
use tracing::info;

use super::{current_user, ApiError, WebState};
use crate::auth::models::{Claims, UserResponse};
use crate::models::AlertHistoryEntry;

const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Deserialize)]
pub struct AlertQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct NotificationsRequest {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct TopicRequest {
    pub topic: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

/// GET /api/me
pub async fn me(
    State(state): State<WebState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<UserResponse>, ApiError> {
    let user = current_user(&state, &claims)?;
    Ok(Json(UserResponse::from_user(&user)))
}

/// GET /api/alerts
pub async fn alerts(
    State(state): State<WebState>,
    Extension(claims): Extension<Claims>,
    Query(params): Query<AlertQuery>,
) -> Result<Json<Vec<AlertHistoryEntry>>, ApiError> {
    let user = current_user(&state, &claims)?;
    let limit = params.limit.unwrap_or(50).min(500);
    Ok(Json(state.db.user_alert_history(user.id, limit)?))
}

/// PUT /api/me/notifications
pub async fn set_notifications(
    State(state): State<WebState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<NotificationsRequest>,
) -> Result<Json<UserResponse>, ApiError> {
    let user = current_user(&state, &claims)?;
    state.db.set_notification_enabled(user.id, req.enabled)?;
    info!(user = %user.name, enabled = req.enabled, "🔔 Notifications toggled (web)");
    me(State(state), Extension(claims)).await
}

/// PUT /api/me/ntfy-topic
pub async fn set_topic(
    State(state): State<WebState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<TopicRequest>,
) -> Result<Json<UserResponse>, ApiError> {
    let user = current_user(&state, &claims)?;
    let topic = req
        .topic
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if matches!(topic, Some(t) if t.contains('/') || t.contains(char::is_whitespace)) {
        return Err(ApiError::BadRequest("Invalid ntfy topic".to_string()));
    }
    state.db.set_ntfy_topic(user.id, topic)?;
    me(State(state), Extension(claims)).await
}

/// POST /api/me/password
pub async fn change_password(
    State(state): State<WebState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<PasswordRequest>,
) -> Result<StatusCode, ApiError> {
    let user = current_user(&state, &claims)?;
    if user.password_hash.is_some()
        && state
            .db
            .verify_password(&user.name, &req.current_password)?
            .is_none()
    {
        return Err(ApiError::Unauthorized);
    }
    if req.new_password.len() < MIN_PASSWORD_LEN {
        return Err(ApiError::BadRequest(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    state.db.set_password(user.id, &req.new_password)?;
    Ok(StatusCode::NO_CONTENT)
}
