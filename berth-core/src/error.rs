//! Berth error abstractions.

use thiserror::Error;

/// Application error variants.
///
/// Each variant maps onto a fixed HTTP status at the boundary of the system; see the operator's
/// `AppErrorExt` for the mapping.
#[derive(Debug, Error)]
pub enum AppError {
    /// The caller is unauthorized to perform the requested action.
    #[error("unauthorized to perform the requested action")]
    Unauthorized,
    /// The caller's credentials are malformed or invalid.
    #[error("the given authorization credentials are malformed or invalid: {0}")]
    InvalidCredentials(String),
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// A uniqueness constraint was violated or an optimistic concurrency check was lost.
    #[error("update conflict: {0}")]
    Conflict(String),
    /// The referenced resource was not found.
    #[error("resource not found: {0}")]
    ResourceNotFound(String),
    /// The data source backing a blocked request has been removed.
    #[error("the data source has been removed")]
    ClusterRemoved,
    /// The server has hit an internal error, but will remain online.
    #[error("internal server error")]
    Ise(anyhow::Error),
}

impl AppError {
    /// Check if the given error is a conflict error.
    pub fn is_conflict(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<AppError>(), Some(AppError::Conflict(_)))
    }

    /// Check if the given error is a not found error.
    pub fn is_not_found(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<AppError>(), Some(AppError::ResourceNotFound(_)))
    }
}
