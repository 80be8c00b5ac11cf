//! Error types for the bank ledger
//!
//! This module defines the single error type shared by the store, the
//! orchestration components and the task producer, plus the coarse
//! classification callers use to decide how to react.
//!
//! # Error Categories
//!
//! - **NotFound**: an account, user or verification row is missing
//! - **Conflict**: a unique constraint was violated (duplicate username/email)
//! - **InvalidState**: a business precondition failed (insufficient funds,
//!   currency mismatch, used or expired verification code)
//! - **Transient**: retryable infrastructure failure (lock timeout, broker
//!   unreachable, dropped connection)
//! - **Permanent**: non-retryable failure (malformed payload)
//! - **Internal**: anything the backend reported that fits none of the above

use super::account::AccountId;
use thiserror::Error;

/// Coarse classification of a [`LedgerError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidState,
    Transient,
    Permanent,
    Internal,
}

/// Main error type for the ledger core
///
/// Every backend error is translated into one of these variants at the store
/// boundary, so orchestration code never inspects driver-specific shapes.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    /// A row that the operation depends on does not exist
    #[error("{entity} {key} not found")]
    NotFound {
        /// Kind of row ("account", "user", ...)
        entity: &'static str,
        /// Key that was looked up
        key: String,
    },

    /// A unique constraint was violated
    #[error("duplicate value violates unique constraint \"{constraint}\"")]
    Conflict {
        /// Name of the violated constraint
        constraint: String,
    },

    /// The row exists but is not in a state that allows the operation
    #[error("{0}")]
    InvalidState(String),

    /// Transfer amount is zero or negative
    #[error("invalid transfer amount {amount}: amount must be positive")]
    InvalidAmount {
        /// The rejected amount
        amount: i64,
    },

    /// Source and destination are the same account
    #[error("account {account_id} cannot transfer to itself")]
    SameAccount {
        /// The account on both sides
        account_id: AccountId,
    },

    /// Source balance does not cover the transfer and overdrafts are disabled
    #[error("insufficient funds in account {account_id}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        /// Source account
        account_id: AccountId,
        /// Balance at the time of the check
        balance: i64,
        /// Requested transfer amount
        requested: i64,
    },

    /// Account currency differs from the currency the caller expected
    #[error("account {account_id} currency mismatch: {actual} vs {expected}")]
    CurrencyMismatch {
        /// Account being validated
        account_id: AccountId,
        /// Currency the caller asked for
        expected: String,
        /// Currency of the account
        actual: String,
    },

    /// Applying a delta would overflow the balance
    #[error("balance overflow on account {account_id}")]
    BalanceOverflow {
        /// Account whose balance would overflow
        account_id: AccountId,
    },

    /// Retryable infrastructure failure
    #[error("transient failure: {0}")]
    Transient(String),

    /// Non-retryable failure
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Unclassified backend failure
    #[error("internal error: {0}")]
    Internal(String),

    /// The unit of work failed and rolling it back failed too
    ///
    /// Both errors are kept; the original is never dropped.
    #[error("transaction error: {error}, rollback error: {rollback}")]
    RollbackFailed {
        /// Error returned by the unit of work
        error: Box<LedgerError>,
        /// Error returned by the rollback
        rollback: Box<LedgerError>,
    },
}

impl LedgerError {
    /// Classify the error
    ///
    /// A failed rollback is classified by the original error, since that is
    /// what the caller has to react to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::NotFound { .. } => ErrorKind::NotFound,
            LedgerError::Conflict { .. } => ErrorKind::Conflict,
            LedgerError::InvalidState(_)
            | LedgerError::InvalidAmount { .. }
            | LedgerError::SameAccount { .. }
            | LedgerError::InsufficientFunds { .. }
            | LedgerError::CurrencyMismatch { .. }
            | LedgerError::BalanceOverflow { .. } => ErrorKind::InvalidState,
            LedgerError::Transient(_) => ErrorKind::Transient,
            LedgerError::Permanent(_) => ErrorKind::Permanent,
            LedgerError::Internal(_) => ErrorKind::Internal,
            LedgerError::RollbackFailed { error, .. } => error.kind(),
        }
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

// Helper functions for creating common errors

impl LedgerError {
    /// Create a NotFound error
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        LedgerError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    /// Create a Conflict error
    pub fn conflict(constraint: &str) -> Self {
        LedgerError::Conflict {
            constraint: constraint.to_string(),
        }
    }

    /// Create an InsufficientFunds error
    pub fn insufficient_funds(account_id: AccountId, balance: i64, requested: i64) -> Self {
        LedgerError::InsufficientFunds {
            account_id,
            balance,
            requested,
        }
    }

    /// Create a CurrencyMismatch error
    pub fn currency_mismatch(account_id: AccountId, expected: &str, actual: &str) -> Self {
        LedgerError::CurrencyMismatch {
            account_id,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Combine a unit-of-work error with the error its rollback produced
    pub fn rollback_failed(error: LedgerError, rollback: LedgerError) -> Self {
        LedgerError::RollbackFailed {
            error: Box::new(error),
            rollback: Box::new(rollback),
        }
    }
}
