//! Store error taxonomy.
//!
//! Every database failure is folded into [`StoreError`] at the edge of the
//! reliable-execution layer and given exactly one [`ErrorClass`]. Nothing
//! above this module inspects SQLSTATE codes.

use std::time::Duration;

use thiserror::Error;

const UNIQUE_VIOLATION_SQLSTATE: &str = "23505";
const UNDEFINED_COLUMN_SQLSTATE: &str = "42703";
const UNDEFINED_TABLE_SQLSTATE: &str = "42P01";

#[derive(Debug, Error)]
pub enum StoreError {
    /// A conditional statement matched nothing.
    #[error("no matching rows")]
    NoRows,

    #[error("database error (sqlstate {sqlstate}): {message}", sqlstate = .code.as_deref().unwrap_or("none"))]
    Database {
        code: Option<String>,
        message: String,
    },

    /// The row shape does not match what the query layer expects.
    #[error("schema mismatch: {0}")]
    Schema(String),

    #[error("timed out acquiring a pooled connection after {0:?}")]
    AcquireTimeout(Duration),

    #[error("attempt exceeded its timeout of {0:?}")]
    AttemptTimeout(Duration),

    #[error("caller context cancelled")]
    Cancelled,

    #[error("caller deadline exceeded")]
    DeadlineExceeded,

    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Sqlx(sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NoRows,
            sqlx::Error::Database(db_err) => Self::Database {
                code: db_err.code().map(|code| code.into_owned()),
                message: db_err.message().to_string(),
            },
            sqlx::Error::ColumnNotFound(column) => {
                Self::Schema(format!("column '{column}' not found in result"))
            }
            sqlx::Error::TypeNotFound { type_name } => {
                Self::Schema(format!("type '{type_name}' not found"))
            }
            other => Self::Sqlx(other),
        }
    }
}

/// How the reliable-execution layer treats a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Benign lost race or empty result. Never retried, never fatal.
    ExpectedMiss,
    /// Retrying cannot help. Returned to the caller immediately.
    Permanent,
    /// Retried with backoff until the attempt cap.
    Transient,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

fn is_permanent_sqlstate(code: &str) -> bool {
    matches!(
        code,
        UNIQUE_VIOLATION_SQLSTATE | UNDEFINED_COLUMN_SQLSTATE | UNDEFINED_TABLE_SQLSTATE
    )
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NoRows => ErrorClass::ExpectedMiss,
            Self::Database { code, .. } => {
                if code.as_deref().is_some_and(is_permanent_sqlstate) {
                    ErrorClass::Permanent
                } else {
                    ErrorClass::Transient
                }
            }
            Self::Schema(_) | Self::Cancelled | Self::DeadlineExceeded => ErrorClass::Permanent,
            Self::AcquireTimeout(_) | Self::AttemptTimeout(_) | Self::Message(_) | Self::Sqlx(_) => {
                ErrorClass::Transient
            }
        }
    }

    pub fn is_expected_miss(&self) -> bool {
        self.class() == ErrorClass::ExpectedMiss
    }
}
