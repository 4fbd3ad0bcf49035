//! Error taxonomy shared by every core service.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("{0}")]
    Validation(String),
    #[error("file type not allowed: `{0}`")]
    TypeNotAllowed(String),
    #[error("file of {size} bytes exceeds the upload limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },
    #[error("storage quota exceeded: {requested} bytes requested, {available} bytes available")]
    QuotaExceeded { requested: u64, available: u64 },
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("access denied")]
    AccessDenied,
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Archive(#[from] zip::result::ZipError),
}

impl DriveError {
    /// True for transient failures where retrying the same request may succeed.
    /// Quota, validation and lookup failures are final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DriveError::Sqlx(_) | DriveError::Io(_) | DriveError::Archive(_)
        )
    }

    /// Map `RowNotFound` onto a typed `NotFound`, leaving other errors intact.
    pub(crate) fn from_lookup(err: sqlx::Error, what: &'static str) -> Self {
        match err {
            sqlx::Error::RowNotFound => DriveError::NotFound(what),
            other => DriveError::Sqlx(other),
        }
    }
}

pub type DriveResult<T> = Result<T, DriveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(DriveError::Io(io::Error::other("disk")).is_retryable());
        assert!(!DriveError::QuotaExceeded { requested: 10, available: 1 }.is_retryable());
        assert!(!DriveError::Validation("bad name".into()).is_retryable());
        assert!(!DriveError::NotFound("file").is_retryable());
    }

    #[test]
    fn row_not_found_becomes_typed_not_found() {
        let err = DriveError::from_lookup(sqlx::Error::RowNotFound, "folder");
        assert!(matches!(err, DriveError::NotFound("folder")));
    }
}
