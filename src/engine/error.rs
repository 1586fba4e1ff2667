//! Error types for the ledger engine.

use std::time::Duration;

use thiserror::Error;

use crate::Amount;
use crate::model::{AccountId, TransferKey};

/// Failure reported by a storage backend. Always transient.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Error from the account store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccountError {
    #[error("account {0} not found")]
    NotFound(AccountId),

    #[error("account {0} already exists")]
    AlreadyExists(AccountId),

    #[error("malformed account id '{0}'")]
    InvalidId(AccountId),

    #[error("account {0} cannot start with negative balance {1}")]
    NegativeBalance(AccountId, Amount),

    #[error("insufficient funds in account {account}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        account: AccountId,
        balance: Amount,
        requested: Amount,
    },

    #[error("balance of account {0} would overflow")]
    Overflow(AccountId),

    #[error("account {0} still holds {1}")]
    NonZeroBalance(AccountId, Amount),

    #[error("debit of {from} could not be paired with a credit of {to} nor undone")]
    PartialCommit { from: AccountId, to: AccountId },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Error from the lock manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock on account {account}")]
    Timeout { account: AccountId, waited: Duration },
}

/// A failure that left nothing committed; the same request can be retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransientError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("transfer {0} is still being processed, retry shortly")]
    InFlight(TransferKey),
}

/// Top-level error returned by [`Engine`](super::Engine) operations.
///
/// Rejected transfers are not errors; they are returned as settled
/// [`Transfer`](crate::Transfer) values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error(transparent)]
    Account(#[from] AccountError),

    #[error("transient failure: {0}")]
    Transient(#[from] TransientError),

    #[error("internal consistency fault: {0}")]
    InvariantViolation(String),
}

impl EngineError {
    /// Whether resubmitting the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Transient(_) => true,
            EngineError::Account(AccountError::Storage(_)) => true,
            EngineError::Account(_) | EngineError::InvariantViolation(_) => false,
        }
    }
}

impl From<LockError> for EngineError {
    fn from(err: LockError) -> Self {
        EngineError::Transient(err.into())
    }
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        EngineError::Transient(err.into())
    }
}

/// Storage-facing errors the processor may retry in place.
pub(crate) trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        true
    }
}

impl Retryable for AccountError {
    fn is_retryable(&self) -> bool {
        matches!(self, AccountError::Storage(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        let lock = EngineError::from(LockError::Timeout {
            account: "A".into(),
            waited: Duration::from_millis(5),
        });
        assert!(lock.is_retryable());

        let storage = EngineError::from(StorageError::Unavailable("down".into()));
        assert!(storage.is_retryable());

        let in_flight = EngineError::from(TransientError::InFlight("t1".into()));
        assert!(in_flight.is_retryable());
    }

    #[test]
    fn permanent_errors_are_not_retryable() {
        assert!(!EngineError::from(AccountError::NotFound("A".into())).is_retryable());
        assert!(!EngineError::InvariantViolation("torn".into()).is_retryable());
    }

    #[test]
    fn messages_name_the_account() {
        let err = AccountError::InsufficientFunds {
            account: "A".into(),
            balance: Amount::from_minor(10_000),
            requested: Amount::from_minor(15_000),
        };
        let msg = err.to_string();
        assert!(msg.contains("account A"));
        assert!(msg.contains("100.00"));
        assert!(msg.contains("150.00"));
    }
}
