//! Mining Error Types
//!
//! Domain-specific error variants for the accrual and settlement engine.
//! Every variant belongs to one [`ErrorClass`], which decides the HTTP status
//! and whether the caller may retry with the same idempotency key.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use kernel::error::{app_error::AppError, conversions::kind_for_sqlstate, kind::ErrorKind};
use thiserror::Error;

/// Mining-specific result type alias
pub type MiningResult<T> = Result<T, MiningError>;

/// Coarse error taxonomy exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Conflict,
    NotFound,
    TransientStorage,
    Validation,
    Internal,
}

#[derive(Debug, Error)]
pub enum MiningError {
    /// An open session already exists for the user
    #[error("Mining session already active")]
    SessionAlreadyActive,

    /// The user's session is between Starting/Stopping and Active/Idle
    #[error("Mining session is changing state")]
    SessionTransitionInProgress,

    /// No open session exists for the user
    #[error("No active mining session")]
    NoActiveSession,

    /// Checkpoint targeted a session that is closed or unknown
    #[error("Mining session not found or already closed")]
    SessionNotFound,

    #[error("User not found")]
    UserNotFound,

    #[error("User already exists")]
    UserAlreadyExists,

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task already completed: {0}")]
    TaskAlreadyCompleted(String),

    /// Malformed input (non-positive amounts, bad ids, bad config)
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Store refused the write for a transient reason
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MiningError {
    pub fn class(&self) -> ErrorClass {
        match self {
            MiningError::SessionAlreadyActive
            | MiningError::SessionTransitionInProgress
            | MiningError::UserAlreadyExists
            | MiningError::TaskAlreadyCompleted(_) => ErrorClass::Conflict,
            MiningError::NoActiveSession
            | MiningError::SessionNotFound
            | MiningError::UserNotFound
            | MiningError::TaskNotFound(_) => ErrorClass::NotFound,
            MiningError::Validation(_) => ErrorClass::Validation,
            MiningError::Database(e) => match sqlx_error_kind(e) {
                ErrorKind::Conflict => ErrorClass::Conflict,
                ErrorKind::NotFound => ErrorClass::NotFound,
                ErrorKind::UnprocessableEntity => ErrorClass::Validation,
                // transactions roll back on error, so every other failure is a clean miss
                _ => ErrorClass::TransientStorage,
            },
            MiningError::StorageUnavailable(_) => ErrorClass::TransientStorage,
            MiningError::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Whether the same call may be repeated with the same idempotency key
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::TransientStorage
    }

    pub fn kind(&self) -> ErrorKind {
        match self.class() {
            ErrorClass::Conflict => ErrorKind::Conflict,
            ErrorClass::NotFound => ErrorKind::NotFound,
            ErrorClass::TransientStorage => ErrorKind::ServiceUnavailable,
            ErrorClass::Validation => ErrorKind::UnprocessableEntity,
            ErrorClass::Internal => ErrorKind::InternalServerError,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.kind().status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn to_app_error(&self) -> AppError {
        let err = AppError::new(self.kind(), self.to_string());
        match self {
            MiningError::SessionAlreadyActive => {
                err.with_action("Stop the current mining session first")
            }
            MiningError::SessionTransitionInProgress => err.with_action("Try again shortly"),
            e if e.is_retryable() => err.with_action("Retry the same request"),
            _ => err,
        }
    }

    /// Log the error with appropriate level
    fn log(&self) {
        match self {
            MiningError::Database(e) => {
                tracing::error!(error = %e, "Mining database error");
            }
            MiningError::StorageUnavailable(msg) => {
                tracing::error!(message = %msg, "Mining storage unavailable");
            }
            MiningError::Internal(msg) => {
                tracing::error!(message = %msg, "Mining internal error");
            }
            MiningError::TaskAlreadyCompleted(task_id) => {
                tracing::warn!(task_id = %task_id, "Repeated task completion attempt");
            }
            _ => {
                tracing::debug!(error = %self, "Mining error");
            }
        }
    }
}

/// Kernel classification of a sqlx error, without consuming it.
fn sqlx_error_kind(err: &sqlx::Error) -> ErrorKind {
    match err {
        sqlx::Error::RowNotFound => ErrorKind::NotFound,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            ErrorKind::ServiceUnavailable
        }
        sqlx::Error::Database(db_err) => db_err
            .code()
            .map(|code| kind_for_sqlstate(code.as_ref()))
            .unwrap_or(ErrorKind::InternalServerError),
        _ => ErrorKind::InternalServerError,
    }
}

impl From<MiningError> for AppError {
    fn from(err: MiningError) -> Self {
        err.to_app_error()
    }
}

impl IntoResponse for MiningError {
    fn into_response(self) -> Response {
        self.log();
        self.to_app_error().into_response()
    }
}
