//! Ledger store abstractions
//!
//! This module defines the trait seam between the orchestration components
//! and the backing store. Every row operation lives on [`Queries`], which is
//! implemented by a transaction handle; there is no way to touch rows outside
//! of a transaction, so everything a unit of work does is isolated and
//! committed (or rolled back) together.
//!
//! # Implementations
//!
//! - [`MemoryStore`]: in-process store with per-row locks, used by tests and
//!   the replay CLI
//! - [`PgStore`]: PostgreSQL store built on sqlx
//!
//! # Row Locking
//!
//! `get_account_for_update`, `add_account_balance`, `update_user` and
//! `consume_verify_email` lock the row they touch until the transaction ends.
//! Callers that lock more than one account must do so in ascending id order.

use async_trait::async_trait;

use crate::types::{
    Account, AccountId, Entry, EntryId, LedgerError, NewAccount, NewUser, NewVerifyEmail,
    Transfer, TransferId, User, UserUpdate, VerifyEmail, VerifyEmailId,
};

pub mod memory;
pub mod postgres;

pub use memory::{FaultPoint, MemoryStore, MemoryStoreConfig, MemoryTx};
pub use postgres::{PgStore, PgTx};

/// Row-level operations available inside a transaction
#[async_trait]
pub trait Queries: Send {
    /// Open a new account
    async fn create_account(&mut self, arg: NewAccount) -> Result<Account, LedgerError>;

    /// Read an account without locking it
    async fn get_account(&mut self, id: AccountId) -> Result<Account, LedgerError>;

    /// Read an account and hold its row lock until the transaction ends
    async fn get_account_for_update(&mut self, id: AccountId) -> Result<Account, LedgerError>;

    /// All accounts ordered by id
    async fn list_accounts(&mut self) -> Result<Vec<Account>, LedgerError>;

    /// Apply a signed delta to an account balance and return the new row
    async fn add_account_balance(
        &mut self,
        id: AccountId,
        delta: i64,
    ) -> Result<Account, LedgerError>;

    /// Append a ledger entry
    async fn create_entry(
        &mut self,
        account_id: AccountId,
        amount: i64,
    ) -> Result<Entry, LedgerError>;

    async fn get_entry(&mut self, id: EntryId) -> Result<Entry, LedgerError>;

    /// Entries of one account ordered by id
    async fn list_entries(&mut self, account_id: AccountId) -> Result<Vec<Entry>, LedgerError>;

    /// Record a transfer
    async fn create_transfer(
        &mut self,
        from_account_id: AccountId,
        to_account_id: AccountId,
        amount: i64,
    ) -> Result<Transfer, LedgerError>;

    async fn get_transfer(&mut self, id: TransferId) -> Result<Transfer, LedgerError>;

    /// Register a user; duplicate username or email is a `Conflict`
    async fn create_user(&mut self, arg: NewUser) -> Result<User, LedgerError>;

    async fn get_user(&mut self, username: &str) -> Result<User, LedgerError>;

    /// Apply a partial update to a user and return the new row
    async fn update_user(&mut self, username: &str, arg: UserUpdate)
        -> Result<User, LedgerError>;

    async fn create_verify_email(
        &mut self,
        arg: NewVerifyEmail,
    ) -> Result<VerifyEmail, LedgerError>;

    /// Mark a verification record used
    ///
    /// Only a record matching `id` and `secret_code` that is unused and not
    /// expired is consumed; anything else is `NotFound`.
    async fn consume_verify_email(
        &mut self,
        id: VerifyEmailId,
        secret_code: &str,
    ) -> Result<VerifyEmail, LedgerError>;
}

/// A transaction handle that can be finished
///
/// Dropping an unfinished handle rolls the transaction back.
#[async_trait]
pub trait StoreTx: Queries {
    async fn commit(self) -> Result<(), LedgerError>;

    async fn rollback(self) -> Result<(), LedgerError>;
}

/// A backing store able to open transactions
#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Tx: StoreTx + 'static;

    /// Open a new transaction
    async fn begin(&self) -> Result<Self::Tx, LedgerError>;
}
