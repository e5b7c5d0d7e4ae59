//! Berth error abstractions.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

pub use berth_core::AppError;

// Error messages.
pub const ERR_ITER_FAILURE: &str = "error returned during key/value iteration from database";
pub const ERR_DB_FLUSH: &str = "error flushing database state";

/// An extension trait for the Berth core `AppError`.
pub trait AppErrorExt {
    /// Get the HTTP status code for this error.
    fn status(&self) -> StatusCode;

    /// Translate the given error as an app error, falling back to an internal error.
    fn from_anyhow(err: anyhow::Error) -> Self;
}

impl AppErrorExt for AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized | AppError::InvalidCredentials(_) => StatusCode::UNAUTHORIZED,
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::ResourceNotFound(_) => StatusCode::NOT_FOUND,
            AppError::ClusterRemoved => StatusCode::GONE,
            AppError::Ise(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn from_anyhow(err: anyhow::Error) -> Self {
        err.downcast::<Self>().unwrap_or_else(Self::Ise)
    }
}

/// A newtype to make anyhow errors work with axum.
#[derive(Debug)]
pub struct ApiError(pub anyhow::Error);

impl From<anyhow::Error> for ApiError {
    fn from(src: anyhow::Error) -> Self {
        ApiError(src)
    }
}

impl From<AppError> for ApiError {
    fn from(src: AppError) -> Self {
        ApiError(src.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = AppError::from_anyhow(self.0);
        let status = err.status();
        if let AppError::Ise(inner) = &err {
            tracing::error!(error = ?inner, "error handling request");
        }
        (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
    }
}

/// A result type used with the HTTP system.
pub type ApiResult<T> = ::std::result::Result<T, ApiError>;

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;
