//! Ledger line types: entries and transfers
//!
//! A transfer is the logical movement of funds between two accounts. It is
//! recorded as one `Transfer` row plus exactly two `Entry` rows whose amounts
//! sum to zero. Both are immutable once written.

use super::account::{Account, AccountId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Entry identifier
pub type EntryId = i64;

/// Transfer identifier
pub type TransferId = i64;

/// Append-only ledger line attached to a single account
///
/// Negative amounts debit the account, positive amounts credit it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Entry {
    pub id: EntryId,
    pub account_id: AccountId,
    /// Signed amount in minor units
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// Record of funds moving from one account to another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Transfer {
    pub id: TransferId,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    /// Strictly positive amount in minor units
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// Input for a funds transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxParams {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: i64,
}

/// Everything a committed transfer produced
///
/// Holds the transfer record, both ledger entries and the post-update
/// snapshots of the two accounts, ready for the caller to render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferTxResult {
    pub transfer: Transfer,
    pub from_account: Account,
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}
