//! # JWT Validation
//!
//! Turns an HS256 bearer token into the principal of a `QueryContext`.
//! `sub` becomes the user id; every other non-registered claim is copied
//! into the principal's claims so policy rules can reference it.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::AuthUser;

use super::errors::{AuthError, AuthResult};

/// Registered claims never copied into the principal
const REGISTERED: [&str; 5] = ["iat", "exp", "nbf", "aud", "iss"];

/// Access token claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Subject (user ID)
    pub sub: String,

    /// Expiration timestamp (Unix epoch seconds)
    pub exp: i64,

    /// Application claims
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// JWT configuration
#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: String,

    /// Required issuer, if any
    pub issuer: Option<String>,

    /// Required audience, if any
    pub audience: Option<String>,

    /// Lifetime of tokens issued by `issue`
    pub access_token_ttl: Duration,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: "CHANGE_THIS_SECRET_IN_PRODUCTION".to_string(),
            issuer: None,
            audience: None,
            access_token_ttl: Duration::minutes(15),
        }
    }
}

/// Token validation (and issuing, for tooling and tests)
#[derive(Clone)]
pub struct JwtManager {
    config: JwtConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtManager {
    pub fn new(config: JwtConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());

        Self {
            config,
            encoding_key,
            decoding_key,
        }
    }

    /// Issue a token for `sub` carrying `claims`
    pub fn issue(&self, sub: &str, claims: Map<String, Value>) -> AuthResult<String> {
        let now = Utc::now();
        let mut extra = claims;
        extra.insert("iat".to_string(), Value::from(now.timestamp()));
        if let Some(iss) = &self.config.issuer {
            extra.insert("iss".to_string(), Value::String(iss.clone()));
        }
        if let Some(aud) = &self.config.audience {
            extra.insert("aud".to_string(), Value::String(aud.clone()));
        }

        let claims = JwtClaims {
            sub: sub.to_string(),
            exp: (now + self.config.access_token_ttl).timestamp(),
            extra,
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|_| AuthError::TokenGenerationFailed)
    }

    /// Validate a token and extract its claims. Stateless.
    pub fn validate_token(&self, token: &str) -> AuthResult<JwtClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        match &self.config.audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }
        if let Some(iss) = &self.config.issuer {
            validation.set_issuer(&[iss]);
        }

        let token_data =
            decode::<JwtClaims>(token, &self.decoding_key, &validation).map_err(|e| {
                match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                    jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                        AuthError::InvalidSignature
                    }
                    _ => AuthError::MalformedToken,
                }
            })?;

        Ok(token_data.claims)
    }

    /// Resolve an `Authorization` header value into a principal
    pub fn principal(&self, header: &str) -> AuthResult<AuthUser> {
        let token = header
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MalformedHeader)?;

        let claims = self.validate_token(token)?;
        let mut user = AuthUser::new(claims.sub);
        for (name, value) in claims.extra {
            if !REGISTERED.contains(&name.as_str()) {
                user = user.with_claim(name, value);
            }
        }
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> JwtManager {
        JwtManager::new(JwtConfig {
            secret: "test_secret_key_for_testing_only".to_string(),
            issuer: Some("test".to_string()),
            audience: Some("test".to_string()),
            ..JwtConfig::default()
        })
    }

    fn claims(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_principal_from_bearer() {
        let manager = manager();
        let token = manager
            .issue("u1", claims(json!({"role": "admin"})))
            .unwrap();

        let user = manager.principal(&format!("Bearer {}", token)).unwrap();
        assert_eq!(user.id, "u1");
        assert_eq!(user.claims.get("role"), Some(&json!("admin")));
        assert!(!user.claims.contains_key("exp"));
        assert!(!user.claims.contains_key("iss"));
    }

    #[test]
    fn test_malformed_header_rejected() {
        let manager = manager();
        assert!(matches!(
            manager.principal("Basic abc"),
            Err(AuthError::MalformedHeader)
        ));
        assert!(matches!(
            manager.principal("Bearer "),
            Err(AuthError::MalformedHeader)
        ));
        assert!(matches!(
            manager.principal("Bearer invalid.token.here"),
            Err(AuthError::MalformedToken) | Err(AuthError::InvalidSignature)
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let other = JwtManager::new(JwtConfig {
            secret: "secret_two".to_string(),
            issuer: Some("test".to_string()),
            audience: Some("test".to_string()),
            ..JwtConfig::default()
        });
        let token = other.issue("u1", Map::new()).unwrap();

        assert!(matches!(
            manager().validate_token(&token),
            Err(AuthError::InvalidSignature)
        ));
    }

    #[test]
    fn test_wrong_audience_rejected() {
        let other = JwtManager::new(JwtConfig {
            secret: "test_secret_key_for_testing_only".to_string(),
            issuer: Some("test".to_string()),
            audience: Some("elsewhere".to_string()),
            ..JwtConfig::default()
        });
        let token = other.issue("u1", Map::new()).unwrap();

        assert!(manager().validate_token(&token).is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let expired = JwtManager::new(JwtConfig {
            secret: "test_secret_key_for_testing_only".to_string(),
            issuer: Some("test".to_string()),
            audience: Some("test".to_string()),
            access_token_ttl: Duration::hours(-1),
        });
        let token = expired.issue("u1", Map::new()).unwrap();

        assert!(matches!(
            manager().validate_token(&token),
            Err(AuthError::TokenExpired)
        ));
    }
}
