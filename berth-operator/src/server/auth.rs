//! Request credential extraction.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use crate::error::{ApiError, AppError};
use crate::server::AppState;
use berth_core::auth::{bearer_token, SessionCredentials};

/// The account of a verified session.
pub struct Session(pub SessionCredentials);

impl Session {
    pub fn account(&self) -> &str {
        self.0.account()
    }
}

#[async_trait]
impl FromRequestParts<AppState> for Session {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = authorization_bearer(parts)?;
        let creds = SessionCredentials::verify(token, &state.session_key)?;
        Ok(Session(creds))
    }
}

/// The raw token presented by a node agent.
///
/// Agent tokens are opaque; they are verified against the data source named by the request.
pub struct AgentCredential(pub String);

#[async_trait]
impl FromRequestParts<AppState> for AgentCredential {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &AppState) -> Result<Self, Self::Rejection> {
        let token = authorization_bearer(parts)?;
        Ok(AgentCredential(token.to_string()))
    }
}

/// Extract the bearer token of the given request's authorization header.
fn authorization_bearer(parts: &Parts) -> Result<&str, ApiError> {
    let header = parts.headers.get(AUTHORIZATION).ok_or(AppError::Unauthorized)?;
    let header = header
        .to_str()
        .map_err(|_| AppError::InvalidCredentials("authorization header must be valid ascii".into()))?;
    Ok(bearer_token(header)?)
}
