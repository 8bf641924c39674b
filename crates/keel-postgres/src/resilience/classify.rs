//! Retry eligibility of database errors.
//!
//! [`ErrorClassifier`] is the only place that decides whether a failure is
//! worth another attempt. Structured information (diesel error kinds,
//! SQLSTATE codes) is consulted first; drivers that only report free-form
//! text fall back to substring markers.

use diesel::result::{ConnectionError, DatabaseErrorKind, Error};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::PgError;

/// SQLSTATE codes that indicate a lost or refused connection.
///
/// Class 08 (connection exception), 53300 (too many connections) and the
/// 57P0x operator intervention codes (admin/crash shutdown, cannot connect now).
pub const TRANSIENT_SQLSTATE_CODES: &[&str] = &[
    "08000", "08001", "08003", "08004", "08006", "08007", "08P01", "53300", "57P01", "57P02",
    "57P03",
];

/// Lowercase message fragments that mark an unstructured error as transient.
pub const TRANSIENT_MESSAGE_MARKERS: &[&str] = &["connection", "timeout"];

/// Retry classification of a failed database operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Connection-level failure that may succeed on another attempt.
    Transient,
    /// The executor's own deadline elapsed.
    Timeout,
    /// Failure caused by the request itself; never retried.
    Fatal,
    /// The caller gave up; never retried.
    Cancelled,
}

impl ErrorClass {
    /// Returns whether another attempt may succeed.
    #[inline]
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Transient | ErrorClass::Timeout)
    }
}

/// Maps [`PgError`]s to an [`ErrorClass`].
///
/// The classifier is a pure function of the error: the same error always
/// yields the same class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorClassifier {
    transient_codes: &'static [&'static str],
    message_markers: &'static [&'static str],
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl ErrorClassifier {
    /// Classifier with the PostgreSQL connection codes and default markers.
    pub const DEFAULT: Self = Self::new(TRANSIENT_SQLSTATE_CODES, TRANSIENT_MESSAGE_MARKERS);

    /// Creates a classifier with custom transient codes and message markers.
    ///
    /// Markers must be lowercase; messages are lowercased before matching.
    pub const fn new(
        transient_codes: &'static [&'static str],
        message_markers: &'static [&'static str],
    ) -> Self {
        Self {
            transient_codes,
            message_markers,
        }
    }

    /// Classifies an error.
    pub fn classify(&self, error: &PgError) -> ErrorClass {
        match error {
            PgError::Cancelled => ErrorClass::Cancelled,
            PgError::Deadline(_) => ErrorClass::Timeout,
            PgError::Timeout(_) | PgError::NotConnected => ErrorClass::Transient,
            PgError::Connection(err) => self.classify_connection(err),
            PgError::Query(err) => self.classify_query(err),
            PgError::Driver {
                code: Some(code), ..
            } => {
                if self.is_transient_code(code) {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Fatal
                }
            }
            PgError::Driver {
                code: None,
                message,
            } => self.classify_message(message),
            PgError::Unexpected(message) => self.classify_message(message),
            PgError::Config(_)
            | PgError::Exhausted { .. }
            | PgError::Unsupported
            | PgError::Closed => ErrorClass::Fatal,
        }
    }

    /// Returns whether the SQLSTATE code is a known transient code.
    pub fn is_transient_code(&self, code: &str) -> bool {
        self.transient_codes
            .iter()
            .any(|known| known.eq_ignore_ascii_case(code))
    }

    fn classify_connection(&self, err: &ConnectionError) -> ErrorClass {
        match err {
            ConnectionError::BadConnection(_) => ErrorClass::Transient,
            ConnectionError::InvalidConnectionUrl(_) | ConnectionError::InvalidCString(_) => {
                ErrorClass::Fatal
            }
            ConnectionError::CouldntSetupConfiguration(inner) => self.classify_query(inner),
            other => self.classify_message(&other.to_string()),
        }
    }

    fn classify_query(&self, err: &Error) -> ErrorClass {
        match err {
            Error::DatabaseError(kind, info) => match kind {
                DatabaseErrorKind::ClosedConnection | DatabaseErrorKind::UnableToSendCommand => {
                    ErrorClass::Transient
                }
                DatabaseErrorKind::Unknown => self.classify_message(info.message()),
                _ => ErrorClass::Fatal,
            },
            Error::BrokenTransactionManager => ErrorClass::Transient,
            Error::NotFound
            | Error::InvalidCString(_)
            | Error::QueryBuilderError(_)
            | Error::DeserializationError(_)
            | Error::SerializationError(_)
            | Error::RollbackTransaction
            | Error::AlreadyInTransaction
            | Error::NotInTransaction => ErrorClass::Fatal,
            other => self.classify_message(&other.to_string()),
        }
    }

    fn classify_message(&self, message: &str) -> ErrorClass {
        let message = message.to_ascii_lowercase();
        if self
            .message_markers
            .iter()
            .any(|marker| message.contains(marker))
        {
            ErrorClass::Transient
        } else {
            ErrorClass::Fatal
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use deadpool::managed::TimeoutType;

    use super::*;

    fn db_error(kind: DatabaseErrorKind, message: &str) -> PgError {
        PgError::Query(Error::DatabaseError(kind, Box::new(message.to_owned())))
    }

    fn fixtures() -> Vec<(PgError, ErrorClass)> {
        vec![
            // Connection level.
            (
                PgError::Connection(ConnectionError::BadConnection(
                    "connection refused".into(),
                )),
                ErrorClass::Transient,
            ),
            (
                PgError::Connection(ConnectionError::InvalidConnectionUrl("nope".into())),
                ErrorClass::Fatal,
            ),
            (PgError::Timeout(TimeoutType::Wait), ErrorClass::Transient),
            (PgError::Timeout(TimeoutType::Create), ErrorClass::Transient),
            (PgError::NotConnected, ErrorClass::Transient),
            (
                db_error(DatabaseErrorKind::ClosedConnection, "server closed the connection"),
                ErrorClass::Transient,
            ),
            (
                db_error(DatabaseErrorKind::UnableToSendCommand, "broken pipe"),
                ErrorClass::Transient,
            ),
            (PgError::Query(Error::BrokenTransactionManager), ErrorClass::Transient),
            // Structured driver codes.
            (
                PgError::driver(Some("08006"), "connection failure"),
                ErrorClass::Transient,
            ),
            (
                PgError::driver(Some("57p01"), "terminating connection due to administrator command"),
                ErrorClass::Transient,
            ),
            (
                PgError::driver(Some("53300"), "too many clients already"),
                ErrorClass::Transient,
            ),
            (
                PgError::driver(Some("23505"), "duplicate key value violates unique constraint"),
                ErrorClass::Fatal,
            ),
            (
                PgError::driver(Some("42601"), "syntax error at or near \"SELEC\""),
                ErrorClass::Fatal,
            ),
            // Message fallback.
            (PgError::driver(None, "Connection reset by peer"), ErrorClass::Transient),
            (PgError::driver(None, "read TIMEOUT"), ErrorClass::Transient),
            (PgError::driver(None, "permission denied for table t"), ErrorClass::Fatal),
            (
                db_error(DatabaseErrorKind::Unknown, "could not receive data: connection lost"),
                ErrorClass::Transient,
            ),
            (
                db_error(DatabaseErrorKind::Unknown, "relation \"t\" does not exist"),
                ErrorClass::Fatal,
            ),
            (
                PgError::Unexpected("statement timeout".into()),
                ErrorClass::Transient,
            ),
            // Application errors.
            (
                db_error(DatabaseErrorKind::UniqueViolation, "duplicate key"),
                ErrorClass::Fatal,
            ),
            (
                db_error(DatabaseErrorKind::ForeignKeyViolation, "violates foreign key"),
                ErrorClass::Fatal,
            ),
            (
                db_error(DatabaseErrorKind::CheckViolation, "check constraint"),
                ErrorClass::Fatal,
            ),
            (PgError::Query(Error::NotFound), ErrorClass::Fatal),
            (PgError::Query(Error::RollbackTransaction), ErrorClass::Fatal),
            (PgError::Config("bad".into()), ErrorClass::Fatal),
            (PgError::Unsupported, ErrorClass::Fatal),
            (PgError::Closed, ErrorClass::Fatal),
            (
                PgError::Exhausted {
                    attempts: 3,
                    source: Box::new(PgError::NotConnected),
                },
                ErrorClass::Fatal,
            ),
            // Executor and caller.
            (PgError::Deadline(Duration::from_secs(30)), ErrorClass::Timeout),
            (PgError::Cancelled, ErrorClass::Cancelled),
        ]
    }

    #[test]
    fn fixture_table_is_classified() {
        let classifier = ErrorClassifier::DEFAULT;
        for (error, expected) in fixtures() {
            assert_eq!(classifier.classify(&error), expected, "{error:?}");
        }
    }

    #[test]
    fn classification_is_order_independent() {
        let classifier = ErrorClassifier::default();
        let forward: Vec<_> = fixtures()
            .iter()
            .map(|(err, _)| classifier.classify(err))
            .collect();
        let mut backward: Vec<_> = fixtures()
            .iter()
            .rev()
            .map(|(err, _)| classifier.classify(err))
            .collect();
        backward.reverse();

        assert_eq!(forward, backward);
    }

    #[test]
    fn retryable_classes() {
        assert!(ErrorClass::Transient.is_retryable());
        assert!(ErrorClass::Timeout.is_retryable());
        assert!(!ErrorClass::Fatal.is_retryable());
        assert!(!ErrorClass::Cancelled.is_retryable());
        assert_eq!(ErrorClass::Transient.to_string(), "transient");
    }

    #[test]
    fn custom_classifier_extends_codes() {
        const CODES: &[&str] = &["40001"];
        let classifier = ErrorClassifier::new(CODES, &[]);

        let serialization = PgError::driver(Some("40001"), "could not serialize access");
        assert_eq!(classifier.classify(&serialization), ErrorClass::Transient);
        assert_eq!(
            classifier.classify(&PgError::driver(None, "connection reset")),
            ErrorClass::Fatal
        );
        assert_eq!(
            ErrorClassifier::DEFAULT.classify(&serialization),
            ErrorClass::Fatal
        );
    }
}
