//! Transaction identifiers and the transaction-manager contract.
//!
//! The controller never runs transaction logic itself: it asks the manager
//! to begin an auto-commit transaction at query start when the session has
//! none, and finalizes it on the terminal path (commit on finishing, abort
//! or fail on failure). Commit and abort are asynchronous; the controller
//! attaches continuations and returns to the caller without waiting.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Identifier of a transaction managed on the coordinator.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize)]
pub struct TransactionId(u64);

impl TransactionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Failure reported by the transaction manager.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("transaction error: {0}")]
pub struct TransactionError(pub String);

/// Coordinator-side transaction manager.
///
/// Implementations must be safe to call from any thread. `commit` and
/// `abort` are the asynchronous halves; `fail` marks a transaction as
/// unusable synchronously and must not block.
#[async_trait]
pub trait TransactionManager: Send + Sync + 'static {
    /// Opens a new transaction and returns its id.
    fn begin(&self, auto_commit: bool) -> TransactionId;

    /// Returns true while the transaction is known to the manager.
    fn transaction_exists(&self, id: TransactionId) -> bool;

    /// Returns true if the transaction was opened implicitly for a single
    /// query.
    fn is_auto_commit(&self, id: TransactionId) -> bool;

    /// Commits asynchronously.
    async fn commit(&self, id: TransactionId) -> Result<(), TransactionError>;

    /// Aborts asynchronously.
    async fn abort(&self, id: TransactionId) -> Result<(), TransactionError>;

    /// Marks the transaction failed so it can only roll back.
    fn fail(&self, id: TransactionId);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_id_display() {
        assert_eq!(TransactionId::new(17).to_string(), "tx-17");
    }
}
