//! Web Tokens
//! Mission: Sign and check the HS256 tokens that carry a stockwatch user id

use crate::auth::models::Claims;
use crate::models::User;
use anyhow::{anyhow, Context, Result};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use tracing::debug;

pub const DEFAULT_TOKEN_TTL_HOURS: i64 = 24;

/// A freshly signed token and its lifetime in seconds.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_in: i64,
}

pub struct JwtHandler {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl JwtHandler {
    pub fn new(secret: String) -> Self {
        Self::with_ttl(secret, Duration::hours(DEFAULT_TOKEN_TTL_HOURS))
    }

    pub fn with_ttl(secret: String, ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        }
    }

    pub fn issue(&self, user: &User) -> Result<IssuedToken> {
        let now = Utc::now();
        let exp = now
            .checked_add_signed(self.ttl)
            .context("Token expiry out of range")?;
        let claims = Claims {
            sub: user.id.to_string(),
            name: user.name.clone(),
            iat: now.timestamp().max(0) as usize,
            exp: exp.timestamp().max(0) as usize,
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .context("Failed to sign token")?;
        debug!(user_id = user.id, ttl_secs = self.ttl.num_seconds(), "Token issued");

        Ok(IssuedToken {
            token,
            expires_in: self.ttl.num_seconds(),
        })
    }

    /// Signature, expiry and a numeric user id are all required.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let claims = decode::<Claims>(token, &self.decoding, &Validation::new(Algorithm::HS256))
            .context("Invalid or expired token")?
            .claims;
        if claims.user_id().is_none() {
            return Err(anyhow!("Token subject {:?} is not a user id", claims.sub));
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bob() -> User {
        User {
            id: 7,
            name: "bob".to_string(),
            chat_id: Some(700),
            ntfy_topic: None,
            password_hash: None,
            enabled: true,
            notification_enabled: true,
            created_at: "2025-03-14 09:00:00".to_string(),
        }
    }

    #[test]
    fn test_issued_token_names_the_user() {
        let handler = JwtHandler::with_ttl("k".repeat(32), Duration::hours(2));
        let issued = handler.issue(&bob()).unwrap();
        assert_eq!(issued.expires_in, 7200);

        let claims = handler.verify(&issued.token).unwrap();
        assert_eq!(claims.user_id(), Some(7));
        assert_eq!(claims.name, "bob");
        assert_eq!(claims.exp - claims.iat, 7200);
    }

    #[test]
    fn test_expired_and_foreign_tokens_fail() {
        let stale = JwtHandler::with_ttl("k".repeat(32), Duration::hours(-1))
            .issue(&bob())
            .unwrap();
        assert!(JwtHandler::new("k".repeat(32)).verify(&stale.token).is_err());

        let other = JwtHandler::new("other-secret".to_string()).issue(&bob()).unwrap();
        assert!(JwtHandler::new("k".repeat(32)).verify(&other.token).is_err());
        assert!(JwtHandler::new("k".repeat(32)).verify("a.b.c").is_err());
    }

    #[test]
    fn test_subject_must_be_a_user_id() {
        let secret = "k".repeat(32);
        let claims = Claims {
            sub: "admin".to_string(),
            name: "admin".to_string(),
            iat: Utc::now().timestamp() as usize,
            exp: (Utc::now().timestamp() + 600) as usize,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();
        assert!(JwtHandler::new(secret).verify(&token).is_err());
    }
}
