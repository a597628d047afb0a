use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{ServiceError, ServiceResult};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

/// Verifies the token carried by an `authenticate` message and yields the
/// user it belongs to. The session layer that issues tokens is an external
/// collaborator; the sync core only needs this one seam.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> ServiceResult<Uuid>;
}

/// HS256 JWT verification against a shared secret.
pub struct JwtVerifier {
    secret: String,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.to_string(),
        }
    }

    /// Issue a token for the given user. Used by tests and by deployments
    /// where the session layer shares this crate's secret.
    pub fn generate_token(&self, user_id: Uuid, ttl_minutes: i64) -> ServiceResult<String> {
        let now = chrono::Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            iat: now.timestamp(),
            exp: (now + chrono::Duration::minutes(ttl_minutes)).timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| ServiceError::Configuration(format!("JWT encoding error: {}", e)))
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> ServiceResult<Uuid> {
        let token_data = jsonwebtoken::decode::<Claims>(
            token,
            &jsonwebtoken::DecodingKey::from_secret(self.secret.as_bytes()),
            &jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256),
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => ServiceError::SessionExpired,
            _ => ServiceError::Authentication(format!("Invalid token: {}", e)),
        })?;

        Uuid::parse_str(&token_data.claims.sub)
            .map_err(|_| ServiceError::Authentication("Token subject is not a UUID".to_string()))
    }
}
