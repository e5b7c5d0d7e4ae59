use anyhow::Result;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// A verified session credentials set.
///
/// This is constructed by cryptographically verifying a session token.
#[derive(Clone, Debug)]
pub struct SessionCredentials {
    /// The verified claims of the session.
    pub claims: SessionClaims,
    /// The raw string form of the token.
    pub token: String,
}

impl SessionCredentials {
    /// Verify the given raw session token using the given key.
    pub fn verify(token: &str, key: &DecodingKey) -> Result<Self> {
        let claims = SessionClaims::decode(token, key).map_err(|err| AppError::InvalidCredentials(err.to_string()))?;
        Ok(Self {
            claims,
            token: token.to_string(),
        })
    }

    /// The name of the account which owns this session.
    pub fn account(&self) -> &str {
        self.claims.sub.as_str()
    }
}

/// The model of a session JWT.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionClaims {
    /// The name of the account which owns the session.
    pub sub: String,
    /// The seconds timestamp at which this session was issued.
    pub iat: i64,
}

impl SessionClaims {
    /// Create a new instance.
    pub fn new(account: &str) -> Self {
        Self {
            sub: account.into(),
            iat: time::OffsetDateTime::now_utc().unix_timestamp(),
        }
    }

    /// Encode this claims body as a JWT.
    pub fn encode(&self, key: &EncodingKey) -> jsonwebtoken::errors::Result<String> {
        let header = Header::new(Algorithm::HS512);
        jsonwebtoken::encode(&header, &self, key)
    }

    /// Decode the given string as a JWT with a `SessionClaims` body.
    pub fn decode(token: impl AsRef<str>, key: &DecodingKey) -> jsonwebtoken::errors::Result<Self> {
        let mut validation = Validation::new(Algorithm::HS512);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        jsonwebtoken::decode(token.as_ref(), key, &validation).map(|body| body.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_verifies_with_matching_key() -> Result<()> {
        let claims = SessionClaims::new("jysperm");
        let token = claims.encode(&EncodingKey::from_secret(b"secret"))?;

        let creds = SessionCredentials::verify(&token, &DecodingKey::from_secret(b"secret"))?;

        assert_eq!(creds.account(), "jysperm", "unexpected account, got {}", creds.account());
        assert_eq!(creds.claims, claims, "expected decoded claims to match");
        Ok(())
    }

    #[test]
    fn session_rejects_foreign_key() -> Result<()> {
        let token = SessionClaims::new("jysperm").encode(&EncodingKey::from_secret(b"secret"))?;

        let res = SessionCredentials::verify(&token, &DecodingKey::from_secret(b"other"));

        let err = res.expect_err("expected verification to fail");
        assert!(
            matches!(err.downcast_ref::<AppError>(), Some(AppError::InvalidCredentials(_))),
            "unexpected error returned: {:?}",
            err
        );
        Ok(())
    }
}
