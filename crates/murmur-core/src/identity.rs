use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use tracing::debug;
use uuid::Uuid;

use murmur_types::api::Claims;

use crate::error::AuthError;

pub const DEFAULT_TOKEN_TTL_DAYS: i64 = 7;

/// The caller behind a verified bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
}

/// Issues and verifies HS256 bearer tokens.
#[derive(Clone)]
pub struct TokenIssuer {
    secret: String,
    validity: Duration,
}

impl TokenIssuer {
    pub fn new(secret: impl Into<String>, validity: Duration) -> Self {
        Self {
            secret: secret.into(),
            validity,
        }
    }

    pub fn validity(&self) -> Duration {
        self.validity
    }

    pub fn issue(&self, user_id: Uuid, username: &str) -> anyhow::Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id,
            username: username.to_string(),
            iat: now.timestamp().max(0) as usize,
            exp: (now + self.validity).timestamp().max(0) as usize,
        };

        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )?;

        Ok(token)
    }

    /// Pure verification: no store lookups, no side effects.
    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is enforced to the second.
        validation.leeway = 0;

        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(|e| {
            debug!("Token rejected: {}", e);
            AuthError::Invalid
        })?;

        Ok(Identity {
            user_id: data.claims.sub,
            username: data.claims.username,
        })
    }

    pub fn verify_credential(&self, credential: Option<&str>) -> Result<Identity, AuthError> {
        match credential {
            Some(token) if !token.is_empty() => self.verify(token),
            _ => Err(AuthError::Missing),
        }
    }
}

/// Extract the token from an `Authorization: Bearer <token>` value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    header_value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_verifies() {
        let issuer = TokenIssuer::new("secret", Duration::days(DEFAULT_TOKEN_TTL_DAYS));
        let user_id = Uuid::new_v4();
        let token = issuer.issue(user_id, "ana").unwrap();

        let identity = issuer.verify(&token).unwrap();
        assert_eq!(identity.user_id, user_id);
        assert_eq!(identity.username, "ana");
    }

    #[test]
    fn expired_token_is_invalid() {
        let issuer = TokenIssuer::new("secret", Duration::seconds(-5));
        let token = issuer.issue(Uuid::new_v4(), "ana").unwrap();
        assert_eq!(issuer.verify(&token), Err(AuthError::Invalid));
    }

    #[test]
    fn foreign_secret_is_invalid() {
        let ours = TokenIssuer::new("secret", Duration::days(1));
        let theirs = TokenIssuer::new("other", Duration::days(1));
        let token = theirs.issue(Uuid::new_v4(), "mallory").unwrap();
        assert_eq!(ours.verify(&token), Err(AuthError::Invalid));
        assert_eq!(ours.verify("not-a-jwt"), Err(AuthError::Invalid));
    }

    #[test]
    fn absent_credential_is_missing() {
        let issuer = TokenIssuer::new("secret", Duration::days(1));
        assert_eq!(issuer.verify_credential(None), Err(AuthError::Missing));
        assert_eq!(issuer.verify_credential(Some("")), Err(AuthError::Missing));
    }

    #[test]
    fn bearer_prefix_is_required() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
    }
}
