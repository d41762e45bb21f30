//! Authentication Models
//! Mission: Token claims and login payloads for the web API

use serde::{Deserialize, Serialize};

use crate::models::User;

/// JWT Claims payload. `sub` is the stockwatch user id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    pub sub: String,
    pub name: String,
    pub iat: usize,
    pub exp: usize,
}

impl Claims {
    pub fn user_id(&self) -> Option<i64> {
        self.sub.parse().ok()
    }
}

/// Login request body
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Login response
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_in: i64,
    pub user: UserResponse,
}

/// User response (no password hash)
#[derive(Debug, Serialize, PartialEq)]
pub struct UserResponse {
    pub id: i64,
    pub name: String,
    pub chat_id: Option<i64>,
    pub ntfy_topic: Option<String>,
    pub notification_enabled: bool,
    pub created_at: String,
}

impl UserResponse {
    pub fn from_user(user: &User) -> Self {
        Self {
            id: user.id,
            name: user.name.clone(),
            chat_id: user.chat_id,
            ntfy_topic: user.ntfy_topic.clone(),
            notification_enabled: user.notification_enabled,
            created_at: user.created_at.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claims_user_id() {
        let claims = Claims {
            sub: "42".to_string(),
            name: "alice".to_string(),
            iat: 0,
            exp: 0,
        };
        assert_eq!(claims.user_id(), Some(42));

        let bad = Claims {
            sub: "not-a-number".to_string(),
            ..claims
        };
        assert_eq!(bad.user_id(), None);
    }

    #[test]
    fn test_user_response_hides_password() {
        let user = User {
            id: 1,
            name: "alice".to_string(),
            chat_id: Some(7),
            ntfy_topic: None,
            password_hash: Some("$2b$hash".to_string()),
            enabled: true,
            notification_enabled: true,
            created_at: "2025-01-01 00:00:00".to_string(),
        };
        let json = serde_json::to_string(&UserResponse::from_user(&user)).unwrap();
        assert!(json.contains("\"name\":\"alice\""));
        assert!(!json.contains("hash"));
    }
}
