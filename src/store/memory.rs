//! In-memory ledger store with transactional semantics
//!
//! This module provides `MemoryStore`, a process-local implementation of the
//! [`Store`] traits that behaves like a row-locking relational database closely
//! enough for the orchestration code to be exercised without one.
//!
//! # Design
//!
//! - Committed rows live in a single `RwLock<Tables>`; a commit takes the
//!   write lock once and applies every staged write, so readers never observe
//!   half a transaction.
//! - Each transaction stages its writes privately and reads its own writes
//!   before falling back to committed rows (read committed isolation).
//! - Row locks are per-row `tokio::sync::Mutex`es kept in a `DashMap`, the same
//!   fine-grained locking the async account manager uses. A lock is held from
//!   first acquisition until the transaction commits, rolls back or is
//!   dropped. Waiting longer than `lock_timeout` fails with a transient error.
//!   A row's entry leaves the table once no transaction holds or awaits it.
//! - Id sequences are atomics and are not rolled back, like database
//!   sequences.
//!
//! # Fault Injection
//!
//! [`MemoryStore::inject_fault`] arms a one-shot failure at a named point so
//! tests can simulate a failed insert, commit or rollback.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{Queries, Store, StoreTx};
use crate::types::{
    Account, AccountId, Entry, EntryId, LedgerError, NewAccount, NewUser, NewVerifyEmail,
    Transfer, TransferId, User, UserUpdate, VerifyEmail, VerifyEmailId,
};

/// Constraint names shared with the PostgreSQL schema
const USERS_PKEY: &str = "users_pkey";
const USERS_EMAIL_KEY: &str = "users_email_key";
const OWNER_CURRENCY_KEY: &str = "owner_currency_key";

/// Configuration for the in-memory store
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Maximum time a transaction waits for a row lock
    pub lock_timeout: Duration,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
        }
    }
}

/// Points at which a one-shot failure can be injected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Begin,
    CreateEntry,
    CreateUser,
    Commit,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RowKey {
    Account(AccountId),
    User(String),
    VerifyEmail(VerifyEmailId),
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowKey::Account(id) => write!(f, "account {}", id),
            RowKey::User(username) => write!(f, "user {}", username),
            RowKey::VerifyEmail(id) => write!(f, "verify_email {}", id),
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    accounts: BTreeMap<AccountId, Account>,
    entries: BTreeMap<EntryId, Entry>,
    transfers: BTreeMap<TransferId, Transfer>,
    users: BTreeMap<String, User>,
    verify_emails: BTreeMap<VerifyEmailId, VerifyEmail>,
}

#[derive(Debug, Default)]
struct Sequences {
    accounts: AtomicI64,
    entries: AtomicI64,
    transfers: AtomicI64,
    verify_emails: AtomicI64,
}

fn next_id(sequence: &AtomicI64) -> i64 {
    sequence.fetch_add(1, Ordering::Relaxed) + 1
}

#[derive(Debug, Default)]
struct Shared {
    config: MemoryStoreConfig,
    tables: RwLock<Tables>,
    sequences: Sequences,
    row_locks: DashMap<RowKey, Arc<Mutex<()>>>,
    faults: DashMap<FaultPoint, usize>,
}

impl Shared {
    fn committed(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn committed_mut(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fire the fault armed at `point`, if its countdown has run out
    fn trip(&self, point: FaultPoint) -> Result<(), LedgerError> {
        let fire = match self.faults.get_mut(&point) {
            Some(mut remaining) if *remaining > 0 => {
                *remaining -= 1;
                false
            }
            Some(_) => true,
            None => false,
        };

        if fire {
            self.faults.remove(&point);
            return Err(LedgerError::Transient(format!(
                "injected fault at {:?}",
                point
            )));
        }
        Ok(())
    }
}

/// Thread-safe in-memory ledger store
///
/// Cloning is cheap and every clone shares the same rows.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Create an empty store with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store with a custom configuration
    pub fn with_config(config: MemoryStoreConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                ..Default::default()
            }),
        }
    }

    /// Arm a one-shot failure
    ///
    /// The first `skip` hits of `point` succeed; the next one fails with a
    /// transient error and disarms the fault.
    pub fn inject_fault(&self, point: FaultPoint, skip: usize) {
        self.shared.faults.insert(point, skip);
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, LedgerError> {
        self.shared.trip(FaultPoint::Begin)?;
        Ok(MemoryTx {
            shared: Arc::clone(&self.shared),
            staged: Staged::default(),
            held: HeldLocks {
                shared: Arc::clone(&self.shared),
                guards: HashMap::new(),
            },
        })
    }
}

/// Writes made by a transaction that are not yet committed
#[derive(Debug, Default)]
struct Staged {
    accounts: BTreeMap<AccountId, Account>,
    new_accounts: BTreeSet<AccountId>,
    entries: BTreeMap<EntryId, Entry>,
    transfers: BTreeMap<TransferId, Transfer>,
    users: BTreeMap<String, User>,
    new_users: BTreeSet<String>,
    verify_emails: BTreeMap<VerifyEmailId, VerifyEmail>,
}

impl Staged {
    /// Re-check unique constraints against rows committed since staging
    fn check_unique(&self, tables: &Tables) -> Result<(), LedgerError> {
        for username in &self.new_users {
            if tables.users.contains_key(username) {
                return Err(LedgerError::conflict(USERS_PKEY));
            }
        }
        for user in self.users.values() {
            let duplicate = tables
                .users
                .values()
                .any(|other| other.username != user.username && other.email == user.email);
            if duplicate {
                return Err(LedgerError::conflict(USERS_EMAIL_KEY));
            }
        }
        for account in self.new_accounts.iter().filter_map(|id| self.accounts.get(id)) {
            let duplicate = tables
                .accounts
                .values()
                .any(|other| other.owner == account.owner && other.currency == account.currency);
            if duplicate {
                return Err(LedgerError::conflict(OWNER_CURRENCY_KEY));
            }
        }
        Ok(())
    }

    /// Move every staged row into the committed tables
    fn apply(self, tables: &mut Tables) {
        tables.accounts.extend(self.accounts);
        tables.entries.extend(self.entries);
        tables.transfers.extend(self.transfers);
        tables.users.extend(self.users);
        tables.verify_emails.extend(self.verify_emails);
    }
}

/// Transaction handle for [`MemoryStore`]
///
/// Dropping the handle without committing discards the staged writes and
/// releases every row lock it holds.
pub struct MemoryTx {
    shared: Arc<Shared>,
    staged: Staged,
    held: HeldLocks,
}

/// Row locks owned by one transaction
///
/// Dropping releases every guard and removes the lock table entry of each
/// row nobody else holds or waits on, so the table only tracks live locks.
struct HeldLocks {
    shared: Arc<Shared>,
    guards: HashMap<RowKey, OwnedMutexGuard<()>>,
}

impl Drop for HeldLocks {
    fn drop(&mut self) {
        for (key, guard) in self.guards.drain() {
            drop(guard);
            // Waiters clone the Arc under the same shard lock, so a count of
            // one means the table holds the last reference.
            self.shared
                .row_locks
                .remove_if(&key, |_, mutex| Arc::strong_count(mutex) == 1);
        }
    }
}

impl MemoryTx {
    /// Acquire the row lock for `key` unless this transaction already holds it
    async fn lock_row(&mut self, key: RowKey) -> Result<(), LedgerError> {
        if self.held.guards.contains_key(&key) {
            return Ok(());
        }

        let mutex = self.shared.row_locks.entry(key.clone()).or_default().value().clone();
        let guard = tokio::time::timeout(self.shared.config.lock_timeout, mutex.lock_owned())
            .await
            .map_err(|_| LedgerError::Transient(format!("lock wait timeout on {}", key)))?;

        self.held.guards.insert(key, guard);
        Ok(())
    }

    fn read_account(&self, id: AccountId) -> Result<Account, LedgerError> {
        if let Some(account) = self.staged.accounts.get(&id) {
            return Ok(account.clone());
        }
        self.shared
            .committed()
            .accounts
            .get(&id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("account", id))
    }

    fn read_user(&self, username: &str) -> Result<User, LedgerError> {
        if let Some(user) = self.staged.users.get(username) {
            return Ok(user.clone());
        }
        self.shared
            .committed()
            .users
            .get(username)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("user", username))
    }

    fn read_verify_email(&self, id: VerifyEmailId) -> Option<VerifyEmail> {
        self.staged
            .verify_emails
            .get(&id)
            .cloned()
            .or_else(|| self.shared.committed().verify_emails.get(&id).cloned())
    }

    /// Whether some user other than `username` already has `email`
    fn email_taken(&self, username: &str, email: &str) -> bool {
        let taken = |user: &User| user.username != username && user.email == email;
        if self.staged.users.values().any(taken) {
            return true;
        }
        self.shared
            .committed()
            .users
            .values()
            .filter(|user| !self.staged.users.contains_key(&user.username))
            .any(taken)
    }
}

#[async_trait]
impl Queries for MemoryTx {
    async fn create_account(&mut self, arg: NewAccount) -> Result<Account, LedgerError> {
        self.read_user(&arg.owner)?;

        let duplicate = {
            let committed = self.shared.committed();
            self.staged
                .accounts
                .values()
                .chain(committed.accounts.values())
                .any(|other| other.owner == arg.owner && other.currency == arg.currency)
        };
        if duplicate {
            return Err(LedgerError::conflict(OWNER_CURRENCY_KEY));
        }

        let account = Account {
            id: next_id(&self.shared.sequences.accounts),
            owner: arg.owner,
            balance: arg.balance,
            currency: arg.currency,
            created_at: Utc::now(),
        };
        self.staged.new_accounts.insert(account.id);
        self.staged.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn get_account(&mut self, id: AccountId) -> Result<Account, LedgerError> {
        self.read_account(id)
    }

    async fn get_account_for_update(&mut self, id: AccountId) -> Result<Account, LedgerError> {
        self.lock_row(RowKey::Account(id)).await?;
        self.read_account(id)
    }

    async fn list_accounts(&mut self) -> Result<Vec<Account>, LedgerError> {
        let mut accounts = self.shared.committed().accounts.clone();
        accounts.extend(
            self.staged
                .accounts
                .iter()
                .map(|(id, account)| (*id, account.clone())),
        );
        Ok(accounts.into_values().collect())
    }

    async fn add_account_balance(
        &mut self,
        id: AccountId,
        delta: i64,
    ) -> Result<Account, LedgerError> {
        self.lock_row(RowKey::Account(id)).await?;
        let mut account = self.read_account(id)?;
        account.balance = account
            .balance
            .checked_add(delta)
            .ok_or(LedgerError::BalanceOverflow { account_id: id })?;
        self.staged.accounts.insert(id, account.clone());
        Ok(account)
    }

    async fn create_entry(
        &mut self,
        account_id: AccountId,
        amount: i64,
    ) -> Result<Entry, LedgerError> {
        self.shared.trip(FaultPoint::CreateEntry)?;
        self.read_account(account_id)?;

        let entry = Entry {
            id: next_id(&self.shared.sequences.entries),
            account_id,
            amount,
            created_at: Utc::now(),
        };
        self.staged.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn get_entry(&mut self, id: EntryId) -> Result<Entry, LedgerError> {
        if let Some(entry) = self.staged.entries.get(&id) {
            return Ok(entry.clone());
        }
        self.shared
            .committed()
            .entries
            .get(&id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("entry", id))
    }

    async fn list_entries(&mut self, account_id: AccountId) -> Result<Vec<Entry>, LedgerError> {
        let mut entries: BTreeMap<EntryId, Entry> = self
            .shared
            .committed()
            .entries
            .values()
            .filter(|entry| entry.account_id == account_id)
            .map(|entry| (entry.id, entry.clone()))
            .collect();
        entries.extend(
            self.staged
                .entries
                .values()
                .filter(|entry| entry.account_id == account_id)
                .map(|entry| (entry.id, entry.clone())),
        );
        Ok(entries.into_values().collect())
    }

    async fn create_transfer(
        &mut self,
        from_account_id: AccountId,
        to_account_id: AccountId,
        amount: i64,
    ) -> Result<Transfer, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount { amount });
        }
        self.read_account(from_account_id)?;
        self.read_account(to_account_id)?;

        let transfer = Transfer {
            id: next_id(&self.shared.sequences.transfers),
            from_account_id,
            to_account_id,
            amount,
            created_at: Utc::now(),
        };
        self.staged.transfers.insert(transfer.id, transfer.clone());
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: TransferId) -> Result<Transfer, LedgerError> {
        if let Some(transfer) = self.staged.transfers.get(&id) {
            return Ok(transfer.clone());
        }
        self.shared
            .committed()
            .transfers
            .get(&id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("transfer", id))
    }

    async fn create_user(&mut self, arg: NewUser) -> Result<User, LedgerError> {
        self.shared.trip(FaultPoint::CreateUser)?;

        if self.read_user(&arg.username).is_ok() {
            return Err(LedgerError::conflict(USERS_PKEY));
        }
        if self.email_taken(&arg.username, &arg.email) {
            return Err(LedgerError::conflict(USERS_EMAIL_KEY));
        }

        let user = User {
            username: arg.username,
            role: arg.role,
            hashed_password: arg.hashed_password,
            full_name: arg.full_name,
            email: arg.email,
            is_email_verified: false,
            password_changed_at: DateTime::<Utc>::default(),
            created_at: Utc::now(),
        };
        self.staged.new_users.insert(user.username.clone());
        self.staged.users.insert(user.username.clone(), user.clone());
        Ok(user)
    }

    async fn get_user(&mut self, username: &str) -> Result<User, LedgerError> {
        self.read_user(username)
    }

    async fn update_user(
        &mut self,
        username: &str,
        arg: UserUpdate,
    ) -> Result<User, LedgerError> {
        self.lock_row(RowKey::User(username.to_string())).await?;
        let mut user = self.read_user(username)?;

        if let Some(email) = arg.email {
            if self.email_taken(username, &email) {
                return Err(LedgerError::conflict(USERS_EMAIL_KEY));
            }
            user.email = email;
        }
        if let Some(hashed_password) = arg.hashed_password {
            user.hashed_password = hashed_password;
            user.password_changed_at = Utc::now();
        }
        if let Some(full_name) = arg.full_name {
            user.full_name = full_name;
        }
        if let Some(verified) = arg.is_email_verified {
            user.is_email_verified = verified;
        }

        self.staged.users.insert(user.username.clone(), user.clone());
        Ok(user)
    }

    async fn create_verify_email(
        &mut self,
        arg: NewVerifyEmail,
    ) -> Result<VerifyEmail, LedgerError> {
        self.read_user(&arg.username)?;

        let verify_email = VerifyEmail {
            id: next_id(&self.shared.sequences.verify_emails),
            username: arg.username,
            email: arg.email,
            secret_code: arg.secret_code,
            is_used: false,
            created_at: Utc::now(),
            expired_at: arg.expired_at,
        };
        self.staged
            .verify_emails
            .insert(verify_email.id, verify_email.clone());
        Ok(verify_email)
    }

    async fn consume_verify_email(
        &mut self,
        id: VerifyEmailId,
        secret_code: &str,
    ) -> Result<VerifyEmail, LedgerError> {
        self.lock_row(RowKey::VerifyEmail(id)).await?;

        let now = Utc::now();
        let mut verify_email = self
            .read_verify_email(id)
            .filter(|row| row.secret_code == secret_code && !row.is_used && row.expired_at > now)
            .ok_or_else(|| LedgerError::not_found("verify_email", id))?;

        verify_email.is_used = true;
        self.staged
            .verify_emails
            .insert(id, verify_email.clone());
        Ok(verify_email)
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn commit(self) -> Result<(), LedgerError> {
        self.shared.trip(FaultPoint::Commit)?;

        let MemoryTx {
            shared,
            staged,
            held,
        } = self;
        let (entries, transfers) = (staged.entries.len(), staged.transfers.len());
        {
            let mut tables = shared.committed_mut();
            staged.check_unique(&tables)?;
            staged.apply(&mut tables);
        }
        drop(held);

        tracing::trace!(entries, transfers, "memory store commit");
        Ok(())
    }

    async fn rollback(self) -> Result<(), LedgerError> {
        self.shared.trip(FaultPoint::Rollback)
    }
}
