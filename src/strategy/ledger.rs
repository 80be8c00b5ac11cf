//! Replay bookkeeping shared by both strategies
//!
//! `ReplayLedger` seeds accounts from the seed file, maps the file's account
//! numbers to the ids the store allocated, and reads the final balances back
//! under the file's numbers.

use std::collections::HashMap;

use crate::core::{execute_in_transaction, TransferEngine};
use crate::store::{Queries, Store};
use crate::types::{
    AccountBalance, AccountId, AccountRecord, ErrorKind, LedgerError, NewAccount, NewUser,
    TransferRecord, TransferTxParams,
};

/// Counters reported once a replay finishes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub accounts_seeded: usize,
    pub transfers_applied: usize,
    pub transfers_rejected: usize,
}

/// Seeded accounts plus the engine transfers run through
#[derive(Debug)]
pub struct ReplayLedger<S> {
    engine: TransferEngine<S>,
    /// File account number -> store account id
    accounts: HashMap<AccountId, AccountId>,
}

/// Placeholder registration for an owner that only appears in the seed file
fn replay_owner(username: &str) -> NewUser {
    NewUser::depositor(
        username,
        "",
        username,
        format!("{}@replay.invalid", username),
    )
}

async fn seed_account<Q: Queries + ?Sized>(
    tx: &mut Q,
    record: AccountRecord,
) -> Result<AccountId, LedgerError> {
    match tx.get_user(&record.owner).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tx.create_user(replay_owner(&record.owner)).await?;
        }
        Err(e) => return Err(e),
    }

    let account = tx
        .create_account(NewAccount::new(
            record.owner,
            record.currency,
            record.balance,
        ))
        .await?;
    Ok(account.id)
}

impl<S: Store> ReplayLedger<S> {
    pub fn new(engine: TransferEngine<S>) -> Self {
        Self {
            engine,
            accounts: HashMap::new(),
        }
    }

    pub fn engine(&self) -> &TransferEngine<S> {
        &self.engine
    }

    /// Open the account described by `record`, registering its owner if needed
    ///
    /// Owner and account are created in one transaction.
    ///
    /// # Errors
    ///
    /// * `Conflict` - The account number was already seeded, or the owner
    ///   already holds an account in that currency
    /// * Any store error from the transaction
    pub async fn seed(&mut self, record: AccountRecord) -> Result<AccountId, LedgerError> {
        let label = record.account;
        if self.accounts.contains_key(&label) {
            return Err(LedgerError::conflict("replay_account_number"));
        }

        let id = execute_in_transaction(self.engine.store().as_ref(), move |tx| {
            Box::pin(seed_account(tx, record))
        })
        .await?;

        self.accounts.insert(label, id);
        tracing::debug!(account = label, account_id = id, "seeded account");
        Ok(id)
    }

    /// Translate a transfer's account numbers into store ids
    ///
    /// # Errors
    ///
    /// * `NotFound` - Either account number was never seeded
    pub fn resolve(&self, record: &TransferRecord) -> Result<TransferTxParams, LedgerError> {
        let lookup = |label: AccountId| {
            self.accounts
                .get(&label)
                .copied()
                .ok_or_else(|| LedgerError::not_found("account", label))
        };

        Ok(TransferTxParams {
            from_account_id: lookup(record.from)?,
            to_account_id: lookup(record.to)?,
            amount: record.amount,
        })
    }

    /// Current balance of every seeded account, under its file number
    pub async fn balances(&self) -> Result<Vec<AccountBalance>, LedgerError> {
        let labels: HashMap<AccountId, AccountId> =
            self.accounts.iter().map(|(label, id)| (*id, *label)).collect();

        let accounts = execute_in_transaction(self.engine.store().as_ref(), |tx| {
            Box::pin(async move { tx.list_accounts().await })
        })
        .await?;

        Ok(accounts
            .into_iter()
            .filter_map(|account| {
                labels.get(&account.id).map(|label| AccountBalance {
                    account: *label,
                    owner: account.owner,
                    currency: account.currency,
                    balance: account.balance,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TransferPolicy;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn ledger() -> ReplayLedger<MemoryStore> {
        ReplayLedger::new(TransferEngine::new(
            Arc::new(MemoryStore::new()),
            TransferPolicy::default(),
        ))
    }

    fn record(account: AccountId, owner: &str, currency: &str, balance: i64) -> AccountRecord {
        AccountRecord {
            account,
            owner: owner.to_string(),
            currency: currency.to_string(),
            balance,
        }
    }

    #[tokio::test]
    async fn test_seed_registers_owner_once() {
        let mut ledger = ledger();

        ledger.seed(record(10, "alice", "USD", 500)).await.unwrap();
        ledger.seed(record(11, "alice", "EUR", 700)).await.unwrap();

        let mut tx = ledger.engine().store().begin().await.unwrap();
        let alice = tx.get_user("alice").await.unwrap();
        assert_eq!(alice.email, "alice@replay.invalid");
        assert!(!alice.is_email_verified);
        assert_eq!(tx.list_accounts().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_seed_rejects_duplicates() {
        let mut ledger = ledger();
        ledger.seed(record(1, "alice", "USD", 0)).await.unwrap();

        let same_number = ledger.seed(record(1, "bob", "USD", 0)).await.unwrap_err();
        let same_currency = ledger.seed(record(2, "alice", "USD", 0)).await.unwrap_err();

        assert_eq!(same_number.kind(), ErrorKind::Conflict);
        assert_eq!(same_currency, LedgerError::conflict("owner_currency_key"));
        // bob's registration rolled back with the failed account
        let mut tx = ledger.engine().store().begin().await.unwrap();
        assert_eq!(
            tx.get_user("bob").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_resolve_and_balances_use_file_numbers() {
        let mut ledger = ledger();
        ledger.seed(record(40, "alice", "USD", 1000)).await.unwrap();
        ledger.seed(record(7, "bob", "USD", 0)).await.unwrap();

        let params = ledger
            .resolve(&TransferRecord {
                from: 40,
                to: 7,
                amount: 250,
            })
            .unwrap();
        assert_eq!((params.from_account_id, params.to_account_id), (1, 2));
        ledger.engine().transfer(params).await.unwrap();

        let mut balances = ledger.balances().await.unwrap();
        balances.sort_by_key(|b| b.account);
        assert_eq!(
            balances
                .iter()
                .map(|b| (b.account, b.balance))
                .collect::<Vec<_>>(),
            vec![(7, 250), (40, 750)]
        );

        let unknown = ledger
            .resolve(&TransferRecord {
                from: 40,
                to: 99,
                amount: 1,
            })
            .unwrap_err();
        assert_eq!(unknown, LedgerError::not_found("account", 99));
    }
}
