//! Funds transfer engine
//!
//! This module provides `TransferEngine`, which moves funds between two
//! accounts as a single unit of work using double-entry bookkeeping.
//!
//! # Design
//!
//! One transfer writes one `Transfer` row, a debit `Entry` of `-amount` on the
//! source, a credit `Entry` of `+amount` on the destination, and applies both
//! balance deltas. All of it commits together or not at all.
//!
//! # Lock Ordering
//!
//! Both account rows are locked in ascending id order before anything is
//! written, and the balance updates are applied in the same order. Two
//! transfers touching the same pair of accounts in opposite directions
//! therefore queue on the same first lock instead of deadlocking.

use std::sync::Arc;

use crate::store::{Queries, Store};
use crate::types::{Account, AccountId, LedgerError, TransferTxParams, TransferTxResult};

use super::unit_of_work::execute_in_transaction;

/// Overdraft policy applied to the source account
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferPolicy {
    /// Allow the source balance to go below zero
    ///
    /// When `false` (the default) a transfer larger than the source balance
    /// fails with `InsufficientFunds`.
    pub allow_overdraft: bool,
}

/// Double-entry transfer orchestrator
///
/// Cheap to clone; clones share the same store.
#[derive(Debug)]
pub struct TransferEngine<S> {
    store: Arc<S>,
    policy: TransferPolicy,
}

impl<S> Clone for TransferEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            policy: self.policy,
        }
    }
}

impl<S: Store> TransferEngine<S> {
    /// Create a new TransferEngine
    ///
    /// # Arguments
    ///
    /// * `store` - Shared ledger store
    /// * `policy` - Overdraft policy for every transfer run by this engine
    pub fn new(store: Arc<S>, policy: TransferPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn policy(&self) -> TransferPolicy {
        self.policy
    }

    /// Move `amount` from one account to another
    ///
    /// # Arguments
    ///
    /// * `params` - Source, destination and positive amount in minor units
    ///
    /// # Returns
    ///
    /// * `Ok(TransferTxResult)` - The transfer, both entries and both updated accounts
    /// * `Err(LedgerError::InvalidAmount)` - If the amount is zero or negative
    /// * `Err(LedgerError::SameAccount)` - If source and destination are the same
    /// * `Err(LedgerError::NotFound)` - If either account does not exist
    /// * `Err(LedgerError::CurrencyMismatch)` - If the accounts hold different currencies
    /// * `Err(LedgerError::InsufficientFunds)` - If overdrafts are disabled and the
    ///   source balance does not cover the amount
    /// * `Err(LedgerError::Transient)` - If a row lock could not be acquired in time
    pub async fn transfer(&self, params: TransferTxParams) -> Result<TransferTxResult, LedgerError> {
        if params.amount <= 0 {
            return Err(LedgerError::InvalidAmount {
                amount: params.amount,
            });
        }
        if params.from_account_id == params.to_account_id {
            return Err(LedgerError::SameAccount {
                account_id: params.from_account_id,
            });
        }

        let policy = self.policy;
        let result = execute_in_transaction(self.store.as_ref(), move |tx| {
            Box::pin(transfer_tx(tx, params, policy))
        })
        .await?;

        tracing::debug!(
            transfer_id = result.transfer.id,
            from = params.from_account_id,
            to = params.to_account_id,
            amount = params.amount,
            "transfer committed"
        );
        Ok(result)
    }

    /// Check that an account exists and holds the expected currency
    ///
    /// # Returns
    ///
    /// * `Ok(Account)` - The account
    /// * `Err(LedgerError::NotFound)` - If the account does not exist
    /// * `Err(LedgerError::CurrencyMismatch)` - If its currency differs from `currency`
    pub async fn valid_account(
        &self,
        account_id: AccountId,
        currency: &str,
    ) -> Result<Account, LedgerError> {
        let account = execute_in_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move { tx.get_account(account_id).await })
        })
        .await?;

        if account.currency != currency {
            return Err(LedgerError::currency_mismatch(
                account_id,
                currency,
                &account.currency,
            ));
        }
        Ok(account)
    }
}

/// Body of one transfer transaction
async fn transfer_tx<Q: Queries + ?Sized>(
    tx: &mut Q,
    params: TransferTxParams,
    policy: TransferPolicy,
) -> Result<TransferTxResult, LedgerError> {
    let TransferTxParams {
        from_account_id: from,
        to_account_id: to,
        amount,
    } = params;
    let (first, second) = if from < to { (from, to) } else { (to, from) };

    let first_account = tx.get_account_for_update(first).await?;
    let second_account = tx.get_account_for_update(second).await?;
    let (source, destination) = if first == from {
        (first_account, second_account)
    } else {
        (second_account, first_account)
    };

    if source.currency != destination.currency {
        return Err(LedgerError::currency_mismatch(
            to,
            &source.currency,
            &destination.currency,
        ));
    }
    if !policy.allow_overdraft && source.balance < amount {
        return Err(LedgerError::insufficient_funds(from, source.balance, amount));
    }

    let transfer = tx.create_transfer(from, to, amount).await?;
    let from_entry = tx.create_entry(from, -amount).await?;
    let to_entry = tx.create_entry(to, amount).await?;

    let (from_account, to_account) = if from < to {
        let from_account = tx.add_account_balance(from, -amount).await?;
        let to_account = tx.add_account_balance(to, amount).await?;
        (from_account, to_account)
    } else {
        let to_account = tx.add_account_balance(to, amount).await?;
        let from_account = tx.add_account_balance(from, -amount).await?;
        (from_account, to_account)
    };

    Ok(TransferTxResult {
        transfer,
        from_account,
        to_account,
        from_entry,
        to_entry,
    })
}
