//! Failure records and contract errors.
//!
//! Two kinds of things can go wrong around a query:
//!
//! - **Query failures**: anything reported through
//!   [`QueryController::to_failed`](crate::controller::QueryController::to_failed).
//!   These are captured as an immutable, first-write-wins [`QueryFailure`]
//!   record and drive the state machine to its FAILED terminal state.
//! - **Contract violations**: misuse of the API itself (re-setting output
//!   columns, starting and clearing a transaction in the same request).
//!   These panic at the point of misuse and are deliberately not
//!   representable as query failures.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Classifies the origin of a query failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    /// The user asked for the query to be canceled.
    UserCanceled,
    /// A cleanup collaborator failed while the query was finishing.
    Cleanup,
    /// The auto-commit transaction failed to commit.
    TransactionCommit,
    /// Rescheduling the query after a recovery round failed.
    Reschedule,
    /// Failure reported by an external collaborator (planner, scheduler,
    /// worker, memory manager, ...).
    External,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserCanceled => write!(f, "user_canceled"),
            Self::Cleanup => write!(f, "cleanup"),
            Self::TransactionCommit => write!(f, "transaction_commit"),
            Self::Reschedule => write!(f, "reschedule"),
            Self::External => write!(f, "external"),
        }
    }
}

/// Immutable record of the first failure observed for a query.
///
/// Only the first write into the controller's failure slot survives;
/// subsequent causes are silently dropped. Cancellation is expressed as a
/// failure with [`FailureKind::UserCanceled`], not as a distinct state.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize)]
#[error("{kind}: {message}")]
pub struct QueryFailure {
    kind: FailureKind,
    message: String,
}

impl QueryFailure {
    /// Creates a failure record with an explicit kind.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates the synthetic cancellation failure.
    pub fn user_canceled() -> Self {
        Self::new(FailureKind::UserCanceled, "query was canceled by the user")
    }

    /// Wraps an arbitrary collaborator error as an external failure.
    pub fn external(error: &(dyn std::error::Error + 'static)) -> Self {
        Self::new(FailureKind::External, error.to_string())
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Errors raised by the session mutation surface.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The named prepared statement is absent from the session registry.
    #[error("prepared statement not found: {0}")]
    PreparedStatementNotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_canceled_kind() {
        let failure = QueryFailure::user_canceled();
        assert_eq!(failure.kind(), FailureKind::UserCanceled);
        assert!(failure.message().contains("canceled"));
    }

    #[test]
    fn test_failure_display_carries_kind_and_message() {
        let failure = QueryFailure::new(FailureKind::TransactionCommit, "commit refused");
        assert_eq!(failure.to_string(), "transaction_commit: commit refused");
    }

    #[test]
    fn test_external_wraps_error_message() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "connection reset");
        let failure = QueryFailure::external(&io);
        assert_eq!(failure.kind(), FailureKind::External);
        assert_eq!(failure.message(), "connection reset");
    }
}
