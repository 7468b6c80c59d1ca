use diesel::result::{DatabaseErrorKind, Error as DieselError};
use thiserror::Error;

/// Failure taxonomy of the capture core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Malformed or out-of-range request.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Active session already exists, or a seq is already taken.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Unknown session, or session owned by another device.
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other storage fault.
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }
}

impl From<DieselError> for CoreError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                Self::Conflict(info.message().to_owned())
            }
            DieselError::NotFound => Self::NotFound("record not found".to_owned()),
            other => Self::Persistence(other.to_string()),
        }
    }
}

impl From<diesel::ConnectionError> for CoreError {
    fn from(err: diesel::ConnectionError) -> Self {
        Self::Persistence(err.to_string())
    }
}
