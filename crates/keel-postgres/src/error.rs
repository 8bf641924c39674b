//! Error types and utilities for database operations.
//!
//! This module provides the error type shared by the pool wrapper, the driver
//! abstraction and the resilience layer. Whether an error is worth retrying is
//! decided by [`ErrorClassifier`], never by ad-hoc checks at call sites.
//!
//! [`ErrorClassifier`]: crate::ErrorClassifier

use std::borrow::Cow;
use std::time::Duration;

use deadpool::managed::TimeoutType;
use diesel::result::{ConnectionError, Error};
use diesel_async::pooled_connection::PoolError as DieselPoolError;
use diesel_async::pooled_connection::deadpool::PoolError as DeadpoolError;

use crate::resilience::{ErrorClass, ErrorClassifier};

/// Provides contextual hints for error types to aid in debugging and user messaging.
///
/// This trait allows error types to provide additional context about what went wrong
/// and potential remediation steps.
pub trait ErrorHint {
    /// Returns an additional hint for an error type.
    ///
    /// The hint should provide actionable information about the error context
    /// or potential solutions.
    fn hint(&self) -> Cow<'static, str>;
}

impl ErrorHint for TimeoutType {
    fn hint(&self) -> Cow<'static, str> {
        match self {
            TimeoutType::Wait => Cow::Borrowed(
                "Connection pool is exhausted, consider increasing pool size or optimizing query performance",
            ),
            TimeoutType::Create => Cow::Borrowed(
                "Unable to establish new database connection, check connection string and database availability",
            ),
            TimeoutType::Recycle => Cow::Borrowed(
                "Failed to recycle database connection, connection may be in invalid state",
            ),
        }
    }
}

/// Error type for all database access operations.
///
/// The variants distinguish where a failure came from (pool, driver, the
/// executor's own deadline, the caller) so that the classifier can decide
/// whether another attempt may succeed.
#[derive(Debug, thiserror::Error)]
#[must_use = "database errors should be handled appropriately"]
pub enum PgError {
    /// Configuration error.
    ///
    /// This includes invalid configuration parameters, missing required settings,
    /// or other issues related to the database configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A pool operation timed out.
    ///
    /// This can occur during connection creation, waiting for available connections,
    /// or connection recycling operations.
    #[error("Database pool operation timed out ({0:?})")]
    Timeout(TimeoutType),

    /// Failed to establish or maintain a database connection.
    #[error("Database connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Database query execution failed.
    ///
    /// This includes SQL syntax errors, constraint violations, type mismatches,
    /// and other query-related failures.
    #[error("Database query error: {0}")]
    Query(#[from] Error),

    /// Error reported by a driver that exposes SQLSTATE-style codes.
    #[error("Database driver error: {message}")]
    Driver {
        /// Structured error code, if the driver reported one.
        code: Option<String>,
        /// Human readable error message.
        message: String,
    },

    /// The unit of work did not finish before the executor's deadline.
    #[error("Database operation exceeded its deadline of {0:?}")]
    Deadline(Duration),

    /// No live connection handle is available.
    #[error("Database is not connected")]
    NotConnected,

    /// The caller gave up on the operation.
    #[error("Database operation was cancelled")]
    Cancelled,

    /// Every permitted attempt failed with a retryable error.
    #[error("Database query failed after {attempts} attempts: {source}")]
    Exhausted {
        /// Number of attempts made, including the first one.
        attempts: u32,
        /// The error returned by the final attempt.
        source: Box<PgError>,
    },

    /// The selected database client cannot operate in this environment.
    #[error("Database access is not supported in this environment")]
    Unsupported,

    /// The connection manager has been shut down.
    #[error("Database connection manager has been shut down")]
    Closed,

    /// Unexpected error occurred.
    ///
    /// This can occur when an error is encountered that is not covered by the
    /// other error types.
    #[error("Unexpected error: {0}")]
    Unexpected(Cow<'static, str>),
}

impl PgError {
    /// Creates a driver error with an optional structured code.
    pub fn driver(code: Option<&str>, message: impl Into<String>) -> Self {
        Self::Driver {
            code: code.map(str::to_owned),
            message: message.into(),
        }
    }

    /// Returns the retry classification of this error.
    #[inline]
    pub fn class(&self) -> ErrorClass {
        ErrorClassifier::DEFAULT.classify(self)
    }

    /// Returns whether this error indicates a transient failure that might succeed on retry.
    #[inline]
    pub fn is_transient(&self) -> bool {
        self.class().is_retryable()
    }

    /// Returns whether this error indicates a permanent failure that won't succeed on retry.
    #[inline]
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Returns whether this error reports exhausted retries.
    ///
    /// Callers use this to tell "database temporarily unavailable" apart
    /// from a request that failed on its own merits.
    #[inline]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, PgError::Exhausted { .. })
    }

    /// Returns the number of attempts made if retries were exhausted.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            PgError::Exhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

impl ErrorHint for PgError {
    fn hint(&self) -> Cow<'static, str> {
        match self {
            PgError::Timeout(timeout) => timeout.hint(),
            PgError::Config(_) => Cow::Borrowed("Check the database configuration values"),
            PgError::Connection(_) | PgError::NotConnected => Cow::Borrowed(
                "Check the connection string and that the database is reachable",
            ),
            PgError::Deadline(_) => Cow::Borrowed(
                "Query exceeded its deadline, consider optimizing it or raising the timeout",
            ),
            PgError::Exhausted { .. } => Cow::Borrowed(
                "Database is temporarily unavailable, retry the request later",
            ),
            PgError::Cancelled => Cow::Borrowed("The caller cancelled the operation"),
            PgError::Unsupported => {
                Cow::Borrowed("No database driver is available in this environment")
            }
            PgError::Closed => Cow::Borrowed("The connection manager has already been shut down"),
            PgError::Query(_) | PgError::Driver { .. } | PgError::Unexpected(_) => {
                Cow::Borrowed("Inspect the underlying database error for details")
            }
        }
    }
}

impl From<DeadpoolError> for PgError {
    fn from(value: DeadpoolError) -> Self {
        match value {
            DeadpoolError::Timeout(timeout) => Self::Timeout(timeout),
            DeadpoolError::Backend(DieselPoolError::QueryError(error)) => Self::Query(error),
            DeadpoolError::Backend(DieselPoolError::ConnectionError(error)) => {
                Self::Connection(error)
            }
            DeadpoolError::PostCreateHook(err) => {
                // Hooks in this crate only log and never fail.
                tracing::warn!("Unexpected post-create hook error: {}", err);
                Self::Unexpected(err.to_string().into())
            }
            DeadpoolError::NoRuntimeSpecified => {
                tracing::error!("No tokio runtime specified for connection pool");
                Self::Unexpected("No runtime specified".into())
            }
            // The pool was closed underneath the caller, usually because the
            // handle was replaced by a reconnect.
            DeadpoolError::Closed => Self::NotConnected,
        }
    }
}

/// Specialized [`Result`] type for database operations.
///
/// This is a convenience alias that uses [`PgError`] as the error type,
/// making database operation signatures cleaner and more consistent.
pub type PgResult<T, E = PgError> = Result<T, E>;

#[cfg(test)]
mod tests {
    use diesel::result::DatabaseErrorKind;

    use super::*;

    #[test]
    fn exhausted_error_reports_attempt_count() {
        let err = PgError::Exhausted {
            attempts: 6,
            source: Box::new(PgError::NotConnected),
        };

        assert!(err.is_exhausted());
        assert_eq!(err.attempts(), Some(6));
        assert_eq!(
            err.to_string(),
            "Database query failed after 6 attempts: Database is not connected"
        );
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn closed_pool_maps_to_not_connected() {
        let err = PgError::from(DeadpoolError::Closed);
        assert!(matches!(err, PgError::NotConnected));
        assert!(err.is_transient());
    }

    #[test]
    fn pool_wait_timeout_is_transient() {
        let err = PgError::from(DeadpoolError::Timeout(TimeoutType::Wait));
        assert!(err.is_transient());
        assert!(err.hint().contains("pool is exhausted"));
    }

    #[test]
    fn constraint_violation_is_permanent() {
        let err = PgError::Query(Error::DatabaseError(
            DatabaseErrorKind::UniqueViolation,
            Box::new("duplicate key value".to_owned()),
        ));

        assert!(err.is_permanent());
        assert!(err.hint().contains("underlying database error"));
        assert!(err.attempts().is_none());
    }

    #[test]
    fn driver_constructor_keeps_code() {
        let err = PgError::driver(Some("08006"), "connection failure");
        let PgError::Driver { code, message } = &err else {
            panic!("expected a driver error");
        };

        assert_eq!(code.as_deref(), Some("08006"));
        assert_eq!(message, "connection failure");
    }
}
