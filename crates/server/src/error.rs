//! API error types.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

/// API error type.
///
/// Every handler funnels failures into one of these kinds; the response
/// body is `{"error": "<message>"}` unless the message is empty, in which
/// case only the status goes out.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    /// Branch CAS exhausted after its retries.
    #[error("{0}")]
    Conflict(String),

    /// Malformed or unsatisfiable byte range; carries the file size for
    /// the `Content-Range: bytes */size` header.
    #[error("requested range not satisfiable")]
    RangeNotSatisfiable { file_size: u64 },

    #[error("Out of quota.")]
    QuotaExceeded,

    #[error("File size is too large.")]
    TooLarge,

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// Internal error with no user-visible message.
    pub fn internal(cause: impl std::fmt::Display) -> Self {
        tracing::error!(error = %cause, "internal error");
        Self::Internal(String::new())
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            // Nonstandard statuses the sync clients have always spoken.
            Self::QuotaExceeded => StatusCode::from_u16(443).unwrap(),
            Self::TooLarge => StatusCode::from_u16(442).unwrap(),
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if let Self::RangeNotSatisfiable { file_size } = self {
            return (
                status,
                [(header::CONTENT_RANGE, format!("bytes */{file_size}"))],
            )
                .into_response();
        }

        let message = self.to_string();
        if message.is_empty() {
            return status.into_response();
        }
        (
            status,
            [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
            serde_json::json!({ "error": message }).to_string(),
        )
            .into_response()
    }
}

impl From<reef_repo::RepoError> for ApiError {
    fn from(e: reef_repo::RepoError) -> Self {
        use reef_repo::RepoError;
        match e {
            RepoError::NotFound(msg) => Self::NotFound(msg),
            RepoError::BadPath(msg) => Self::BadRequest(msg),
            RepoError::UniqueName(name) => {
                Self::Internal(format!("failed to generate unique name for {name}"))
            }
            RepoError::Contention(repo) => {
                Self::Conflict(format!("concurrent update to repo {repo}"))
            }
            other => Self::internal(other),
        }
    }
}

impl From<reef_metadata::MetadataError> for ApiError {
    fn from(e: reef_metadata::MetadataError) -> Self {
        Self::internal(e)
    }
}

impl From<reef_storage::StorageError> for ApiError {
    fn from(e: reef_storage::StorageError) -> Self {
        match e {
            reef_storage::StorageError::NotFound(key) => Self::NotFound(key),
            other => Self::internal(other),
        }
    }
}

impl From<crate::oracle::OracleError> for ApiError {
    fn from(e: crate::oracle::OracleError) -> Self {
        Self::internal(e)
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
