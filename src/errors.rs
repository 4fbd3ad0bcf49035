use crate::services::error::DriveError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use tracing::error;

/// HTTP-facing error: a status, a message and whether retrying may help.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    pub retryable: bool,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            retryable: false,
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
        }
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16(),
            "retryable": self.retryable,
        }));

        (self.status, body).into_response()
    }
}

impl From<DriveError> for AppError {
    fn from(err: DriveError) -> Self {
        let status = match &err {
            DriveError::Validation(_) => StatusCode::BAD_REQUEST,
            DriveError::TypeNotAllowed(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            DriveError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            DriveError::QuotaExceeded { .. } => StatusCode::INSUFFICIENT_STORAGE,
            DriveError::NotFound(_) => StatusCode::NOT_FOUND,
            // Another user's resources are indistinguishable from missing ones.
            DriveError::AccessDenied => StatusCode::NOT_FOUND,
            DriveError::Conflict(_) => StatusCode::CONFLICT,
            DriveError::Sqlx(_) | DriveError::Io(_) | DriveError::Archive(_) => {
                error!("request failed: {}", err);
                return Self::internal("internal storage error");
            }
        };
        let message = match &err {
            DriveError::AccessDenied => "resource not found".to_string(),
            other => other.to_string(),
        };
        Self {
            status,
            message,
            retryable: err.is_retryable(),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn quota_and_validation_failures_are_final() {
        let quota = AppError::from(DriveError::QuotaExceeded {
            requested: 100,
            available: 50,
        });
        assert_eq!(quota.status, StatusCode::INSUFFICIENT_STORAGE);
        assert!(!quota.retryable);

        let invalid = AppError::from(DriveError::Validation("bad name".into()));
        assert_eq!(invalid.status, StatusCode::BAD_REQUEST);
        assert!(!invalid.retryable);
    }

    #[test]
    fn io_failures_are_retryable_and_hide_details() {
        let err = AppError::from(DriveError::Io(io::Error::other("/data/files/secret: EIO")));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.retryable);
        assert!(!err.message.contains("secret"));
    }

    #[test]
    fn access_denied_looks_like_not_found() {
        let err = AppError::from(DriveError::AccessDenied);
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }
}
