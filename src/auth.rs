use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::Role;

/// JWT claims shared with the external auth collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Role (`speaker`, `admin`, `audience`).
    pub role: String,
    /// Issued at (Unix timestamp).
    pub iat: i64,
    /// Expiration time (Unix timestamp).
    pub exp: i64,
}

/// Validates (and signs) the HS256 bearer tokens carried on the WebSocket
/// query string and the operator API.
pub struct TokenValidator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
    expire_hours: i64,
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator")
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

impl TokenValidator {
    pub fn new(secret: &str, expire_hours: i64) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::Config("JWT secret cannot be empty".to_owned()));
        }
        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            algorithm: Algorithm::HS256,
            expire_hours,
        })
    }

    /// Verify a token and return the authenticated user id and role.
    pub fn validate(&self, token: &str) -> Result<(Uuid, Role)> {
        let mut validation = Validation::new(self.algorithm);
        validation.validate_exp = true;
        validation.leeway = 60;

        let data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    Error::Auth("token expired".to_owned())
                }
                _ => Error::Auth("invalid token".to_owned()),
            }
        })?;

        let user_id = Uuid::parse_str(&data.claims.sub)
            .map_err(|_| Error::Auth("invalid subject".to_owned()))?;
        let role = data
            .claims
            .role
            .parse::<Role>()
            .map_err(|_| Error::Auth(format!("unknown role: {}", data.claims.role)))?;
        Ok((user_id, role))
    }

    /// Sign a token for a user. The external auth service issues tokens the
    /// same way; this is used by tests and token refresh.
    pub fn sign(&self, user_id: Uuid, role: Role) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            role: role.as_str().to_owned(),
            iat: now.timestamp(),
            exp: (now + Duration::hours(self.expire_hours)).timestamp(),
        };
        encode(&Header::new(self.algorithm), &claims, &self.encoding_key)
            .map_err(|e| Error::Auth(format!("failed to sign token: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> TokenValidator {
        TokenValidator::new("test-secret-key", 24).unwrap()
    }

    #[test]
    fn sign_and_validate() {
        let v = validator();
        let user_id = Uuid::new_v4();
        let token = v.sign(user_id, Role::Speaker).unwrap();
        let (got_id, got_role) = v.validate(&token).unwrap();
        assert_eq!(got_id, user_id);
        assert_eq!(got_role, Role::Speaker);
    }

    #[test]
    fn expired_token_rejected() {
        let v = validator();
        let now = Utc::now();
        let claims = Claims {
            sub: Uuid::new_v4().to_string(),
            role: "audience".to_owned(),
            iat: (now - Duration::hours(3)).timestamp(),
            exp: (now - Duration::hours(2)).timestamp(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"test-secret-key"),
        )
        .unwrap();
        assert!(matches!(v.validate(&token), Err(Error::Auth(_))));
    }

    #[test]
    fn tampered_token_rejected() {
        let v = validator();
        let token = v.sign(Uuid::new_v4(), Role::Admin).unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();
        parts[1] = "tampered";
        assert!(v.validate(&parts.join(".")).is_err());
    }

    #[test]
    fn unknown_role_rejected() {
        let v = validator();
        let now = Utc::now();
        let claims = Claims {
            sub: Uuid::new_v4().to_string(),
            role: "superuser".to_owned(),
            iat: now.timestamp(),
            exp: (now + Duration::hours(1)).timestamp(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"test-secret-key"),
        )
        .unwrap();
        assert!(v.validate(&token).is_err());
    }

    #[test]
    fn empty_secret_rejected() {
        assert!(TokenValidator::new("", 24).is_err());
    }
}
