//! Error conversions - From implementations for common error types
//!
//! Provides automatic conversion from common error types to [`AppError`].

use super::app_error::AppError;
use super::kind::ErrorKind;

// ============================================================================
// serde_json conversions
// ============================================================================

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_syntax() || err.is_data() || err.is_eof() {
            AppError::bad_request(format!("JSON parse error: {}", err)).with_source(err)
        } else {
            AppError::internal("JSON serialization error").with_source(err)
        }
    }
}

// ============================================================================
// SQLx conversions (feature-gated)
// ============================================================================

/// Classify a PostgreSQL SQLSTATE code.
///
/// https://www.postgresql.org/docs/current/errcodes-appendix.html
pub fn kind_for_sqlstate(code: &str) -> ErrorKind {
    match code {
        // Class 23: Integrity Constraint Violation
        "23505" | "23503" | "23P01" => ErrorKind::Conflict,
        "23502" | "23514" => ErrorKind::UnprocessableEntity,
        // Class 40: Transaction Rollback (serialization failure, deadlock)
        "40001" | "40P01" => ErrorKind::ServiceUnavailable,
        // Class 08: Connection Exception
        c if c.starts_with("08") => ErrorKind::ServiceUnavailable,
        // Class 53: Insufficient Resources
        "53000" | "53100" | "53200" | "53300" => ErrorKind::ServiceUnavailable,
        // Class 57: Operator Intervention
        "57000" | "57014" | "57P01" | "57P02" | "57P03" => ErrorKind::ServiceUnavailable,
        _ => ErrorKind::InternalServerError,
    }
}

#[cfg(feature = "sqlx")]
impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => AppError::not_found("Record not found").with_source(err),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                AppError::service_unavailable("Database connection pool exhausted").with_source(err)
            }
            sqlx::Error::Io(_) => {
                AppError::service_unavailable("Database connection error").with_source(err)
            }
            sqlx::Error::Database(db_err) => {
                let kind = db_err
                    .code()
                    .map(|code| kind_for_sqlstate(code.as_ref()))
                    .unwrap_or(ErrorKind::InternalServerError);
                let message = match kind {
                    ErrorKind::Conflict => "Database constraint conflict",
                    ErrorKind::UnprocessableEntity => "Database check violation",
                    ErrorKind::ServiceUnavailable => "Database temporarily unavailable",
                    _ => "Database error",
                };
                AppError::new(kind, message).with_source(err)
            }
            _ => AppError::internal("Database error").with_source(err),
        }
    }
}

// ============================================================================
// Axum conversions (feature-gated)
// ============================================================================

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        use axum::Json;
        use axum::http::StatusCode;

        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        // RFC 7807 Problem Details for HTTP APIs
        let body = serde_json::json!({
            "type": format!("https://httpstatuses.io/{}", self.status_code()),
            "title": self.kind().as_str(),
            "status": self.status_code(),
            "detail": self.message(),
            "action": self.action(),
            "retryable": self.is_retryable(),
        });

        (status, Json(body)).into_response()
    }
}
