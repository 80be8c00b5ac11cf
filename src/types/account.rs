//! Account-related types for the bank ledger
//!
//! This module defines the Account row and the parameters used to open one.
//! Balances are kept as signed integers in the currency's minor units
//! (cents for USD), so no rounding ever happens inside the ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Account identifier
///
/// Allocated by the store from a monotonically increasing sequence.
pub type AccountId = i64;

/// Currency-denominated account owned by a user
///
/// The balance is only ever changed by a signed delta applied inside a
/// transfer transaction. The currency is fixed when the account is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    /// Unique account identifier
    pub id: AccountId,

    /// Username of the owning user
    pub owner: String,

    /// Current balance in minor units
    ///
    /// May only go negative when the transfer policy allows overdrafts.
    pub balance: i64,

    /// ISO currency code (e.g. "USD")
    pub currency: String,

    /// When the account was opened
    pub created_at: DateTime<Utc>,
}

/// Parameters for opening a new account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    /// Username of the owning user (must exist)
    pub owner: String,
    /// Opening balance in minor units
    pub balance: i64,
    /// ISO currency code
    pub currency: String,
}

impl NewAccount {
    /// Create account parameters
    ///
    /// # Arguments
    ///
    /// * `owner` - Username of the owning user
    /// * `currency` - ISO currency code
    /// * `balance` - Opening balance in minor units
    pub fn new(owner: impl Into<String>, currency: impl Into<String>, balance: i64) -> Self {
        NewAccount {
            owner: owner.into(),
            balance,
            currency: currency.into(),
        }
    }
}
