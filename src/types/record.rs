//! Replay records for the ledger CLI
//!
//! Rows read from the seed and transfer CSV files once their amounts have
//! been converted to minor units, plus the balance row written back out.
//!
//! Account numbers in the files are labels chosen by whoever wrote the file.
//! The store allocates its own ids when the accounts are seeded, so replay
//! keeps a label-to-id mapping and reports balances under the file labels.

use super::account::AccountId;

/// One account to open before replaying transfers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    /// Account number as written in the seed file
    pub account: AccountId,

    /// Username of the owner; missing owners are registered on the fly
    pub owner: String,

    /// ISO currency code, upper-cased
    pub currency: String,

    /// Opening balance in minor units
    pub balance: i64,
}

/// One transfer to replay, referring to accounts by their file labels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRecord {
    pub from: AccountId,
    pub to: AccountId,
    /// Amount in minor units
    pub amount: i64,
}

/// Final state of one account after replay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountBalance {
    pub account: AccountId,
    pub owner: String,
    pub currency: String,
    pub balance: i64,
}
