//! Authentication primitives.
//!
//! Two credential kinds are accepted by the control plane. Sessions are HS512 JWTs minted by the
//! account layer and identify an account. Agent tokens are opaque per-data-source secrets which
//! node agents present when registering and polling.

mod agent;
mod session;

use anyhow::{bail, Result};

pub use agent::AgentToken;
pub use session::{SessionClaims, SessionCredentials};

use crate::error::AppError;

/// The authorization header bearer prefix.
const BEARER_PREFIX: &str = "bearer ";

/// Extract the token from the given `authorization` header value.
///
/// The bearer prefix is matched case-insensitively.
pub fn bearer_token(header: &str) -> Result<&str> {
    if header.len() < BEARER_PREFIX.len() || !header.is_char_boundary(BEARER_PREFIX.len()) {
        bail!(AppError::InvalidCredentials("authorization header value must begin with 'bearer '".into()));
    }
    let (prefix, token) = header.split_at(BEARER_PREFIX.len());
    if !prefix.eq_ignore_ascii_case(BEARER_PREFIX) {
        bail!(AppError::InvalidCredentials("authorization header value must begin with 'bearer '".into()));
    }
    let token = token.trim();
    if token.is_empty() {
        bail!(AppError::InvalidCredentials("no token detected in header".into()));
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_extracts_token() -> Result<()> {
        let token = bearer_token("Bearer abc.def")?;
        assert_eq!(token, "abc.def", "unexpected token extracted, got {}", token);
        let token = bearer_token("bearer xyz")?;
        assert_eq!(token, "xyz", "unexpected token extracted, got {}", token);
        Ok(())
    }

    #[test]
    fn bearer_token_rejects_malformed_headers() {
        for header in ["", "Basic abc", "Bearer ", "Bearer    ", "tok"] {
            let res = bearer_token(header);
            assert!(
                matches!(res.as_ref().map_err(|err| err.downcast_ref::<AppError>()), Err(Some(AppError::InvalidCredentials(_)))),
                "expected invalid credentials error for header {:?}",
                header
            );
        }
    }
}
