//! PostgreSQL ledger store
//!
//! `PgStore` wraps a sqlx connection pool; every [`PgTx`] owns one pooled
//! connection with an open transaction. Row locks are taken with
//! `SELECT ... FOR NO KEY UPDATE` or implicitly by `UPDATE`, so they are held
//! until the transaction commits or rolls back, and dropping a `PgTx` rolls
//! it back.
//!
//! Driver errors are translated into [`LedgerError`] at this boundary; see
//! [`translate`].

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;

use super::{Queries, Store, StoreTx};
use crate::types::{
    Account, AccountId, Entry, EntryId, LedgerError, NewAccount, NewUser, NewVerifyEmail,
    Transfer, TransferId, User, UserUpdate, VerifyEmail, VerifyEmailId,
};

/// Schema applied by [`PgStore::migrate`]
const SCHEMA: &str = include_str!("schema.sql");

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";
const CHECK_VIOLATION: &str = "23514";
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const LOCK_NOT_AVAILABLE: &str = "55P03";

const USER_COLUMNS: &str =
    "username, role, hashed_password, full_name, email, is_email_verified, password_changed_at, created_at";
const VERIFY_EMAIL_COLUMNS: &str =
    "id, username, email, secret_code, is_used, created_at, expired_at";

/// Map a sqlx error onto the ledger error taxonomy
///
/// # Arguments
///
/// * `entity` - Kind of row the statement targeted, used for `NotFound`
/// * `key` - Key of that row
fn translate(entity: &'static str, key: impl ToString) -> impl FnOnce(sqlx::Error) -> LedgerError {
    let key = key.to_string();
    move |error| match error {
        sqlx::Error::RowNotFound => LedgerError::NotFound { entity, key },
        sqlx::Error::Database(db_error) => {
            let code = db_error.code().map(|code| code.into_owned());
            match code.as_deref() {
                Some(UNIQUE_VIOLATION) => {
                    LedgerError::conflict(db_error.constraint().unwrap_or(entity))
                }
                Some(FOREIGN_KEY_VIOLATION) => LedgerError::NotFound {
                    entity,
                    key: format!("{} (violates {})", key, db_error.constraint().unwrap_or("foreign key")),
                },
                Some(CHECK_VIOLATION) => LedgerError::InvalidState(db_error.message().to_string()),
                Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED | LOCK_NOT_AVAILABLE) => {
                    LedgerError::Transient(db_error.message().to_string())
                }
                _ => LedgerError::Internal(db_error.to_string()),
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            LedgerError::Transient(error.to_string())
        }
        other => LedgerError::Internal(other.to_string()),
    }
}

/// PostgreSQL-backed ledger store
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    lock_timeout: Option<Duration>,
}

impl PgStore {
    /// Connect a new pool
    ///
    /// # Arguments
    ///
    /// * `database_url` - PostgreSQL connection string
    /// * `max_connections` - Pool size
    ///
    /// # Errors
    ///
    /// Returns `Transient` when the server cannot be reached.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(translate("database", database_url))?;

        tracing::info!(max_connections, "PostgreSQL connection pool established");
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: None,
        }
    }

    /// Bound how long a transaction waits for a row lock
    ///
    /// Exceeding the bound fails the statement with a `Transient` error.
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = Some(lock_timeout);
        self
    }

    /// Create the ledger tables if they do not exist yet
    pub async fn migrate(&self) -> Result<(), LedgerError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(translate("schema", "ledger"))?;
        tracing::info!("ledger schema ready");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx, LedgerError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(translate("transaction", "begin"))?;

        if let Some(lock_timeout) = self.lock_timeout {
            sqlx::query("SELECT set_config('lock_timeout', $1, true)")
                .bind(format!("{}ms", lock_timeout.as_millis()))
                .execute(&mut *tx)
                .await
                .map_err(translate("transaction", "lock_timeout"))?;
        }

        Ok(PgTx { tx })
    }
}

/// Open PostgreSQL transaction
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl Queries for PgTx {
    async fn create_account(&mut self, arg: NewAccount) -> Result<Account, LedgerError> {
        sqlx::query_as::<_, Account>(
            "INSERT INTO accounts (owner, balance, currency) VALUES ($1, $2, $3) \
             RETURNING id, owner, balance, currency, created_at",
        )
        .bind(&arg.owner)
        .bind(arg.balance)
        .bind(&arg.currency)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(translate("user", &arg.owner))
    }

    async fn get_account(&mut self, id: AccountId) -> Result<Account, LedgerError> {
        sqlx::query_as::<_, Account>(
            "SELECT id, owner, balance, currency, created_at FROM accounts WHERE id = $1",
        )
        .bind(id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(translate("account", id))
    }

    async fn get_account_for_update(&mut self, id: AccountId) -> Result<Account, LedgerError> {
        sqlx::query_as::<_, Account>(
            "SELECT id, owner, balance, currency, created_at FROM accounts \
             WHERE id = $1 FOR NO KEY UPDATE",
        )
        .bind(id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(translate("account", id))
    }

    async fn list_accounts(&mut self) -> Result<Vec<Account>, LedgerError> {
        sqlx::query_as::<_, Account>(
            "SELECT id, owner, balance, currency, created_at FROM accounts ORDER BY id",
        )
        .fetch_all(&mut *self.tx)
        .await
        .map_err(translate("account", "*"))
    }

    async fn add_account_balance(
        &mut self,
        id: AccountId,
        delta: i64,
    ) -> Result<Account, LedgerError> {
        let result = sqlx::query_as::<_, Account>(
            "UPDATE accounts SET balance = balance + $1 WHERE id = $2 \
             RETURNING id, owner, balance, currency, created_at",
        )
        .bind(delta)
        .bind(id)
        .fetch_one(&mut *self.tx)
        .await;

        match result {
            // 22003: numeric_value_out_of_range
            Err(sqlx::Error::Database(db_error)) if db_error.code().as_deref() == Some("22003") => {
                Err(LedgerError::BalanceOverflow { account_id: id })
            }
            other => other.map_err(translate("account", id)),
        }
    }

    async fn create_entry(
        &mut self,
        account_id: AccountId,
        amount: i64,
    ) -> Result<Entry, LedgerError> {
        sqlx::query_as::<_, Entry>(
            "INSERT INTO entries (account_id, amount) VALUES ($1, $2) \
             RETURNING id, account_id, amount, created_at",
        )
        .bind(account_id)
        .bind(amount)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(translate("account", account_id))
    }

    async fn get_entry(&mut self, id: EntryId) -> Result<Entry, LedgerError> {
        sqlx::query_as::<_, Entry>(
            "SELECT id, account_id, amount, created_at FROM entries WHERE id = $1",
        )
        .bind(id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(translate("entry", id))
    }

    async fn list_entries(&mut self, account_id: AccountId) -> Result<Vec<Entry>, LedgerError> {
        sqlx::query_as::<_, Entry>(
            "SELECT id, account_id, amount, created_at FROM entries \
             WHERE account_id = $1 ORDER BY id",
        )
        .bind(account_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(translate("entry", account_id))
    }

    async fn create_transfer(
        &mut self,
        from_account_id: AccountId,
        to_account_id: AccountId,
        amount: i64,
    ) -> Result<Transfer, LedgerError> {
        sqlx::query_as::<_, Transfer>(
            "INSERT INTO transfers (from_account_id, to_account_id, amount) VALUES ($1, $2, $3) \
             RETURNING id, from_account_id, to_account_id, amount, created_at",
        )
        .bind(from_account_id)
        .bind(to_account_id)
        .bind(amount)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(translate("account", format!("{} or {}", from_account_id, to_account_id)))
    }

    async fn get_transfer(&mut self, id: TransferId) -> Result<Transfer, LedgerError> {
        sqlx::query_as::<_, Transfer>(
            "SELECT id, from_account_id, to_account_id, amount, created_at \
             FROM transfers WHERE id = $1",
        )
        .bind(id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(translate("transfer", id))
    }

    async fn create_user(&mut self, arg: NewUser) -> Result<User, LedgerError> {
        sqlx::query_as::<_, User>(&format!(
            "INSERT INTO users (username, role, hashed_password, full_name, email) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {}",
            USER_COLUMNS
        ))
        .bind(&arg.username)
        .bind(arg.role.as_str())
        .bind(&arg.hashed_password)
        .bind(&arg.full_name)
        .bind(&arg.email)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(translate("user", &arg.username))
    }

    async fn get_user(&mut self, username: &str) -> Result<User, LedgerError> {
        sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE username = $1",
            USER_COLUMNS
        ))
        .bind(username)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(translate("user", username))
    }

    async fn update_user(
        &mut self,
        username: &str,
        arg: UserUpdate,
    ) -> Result<User, LedgerError> {
        sqlx::query_as::<_, User>(&format!(
            "UPDATE users SET \
                 full_name = COALESCE($1, full_name), \
                 email = COALESCE($2, email), \
                 hashed_password = COALESCE($3, hashed_password), \
                 password_changed_at = CASE WHEN $3 IS NULL THEN password_changed_at ELSE now() END, \
                 is_email_verified = COALESCE($4, is_email_verified) \
             WHERE username = $5 RETURNING {}",
            USER_COLUMNS
        ))
        .bind(arg.full_name)
        .bind(arg.email)
        .bind(arg.hashed_password)
        .bind(arg.is_email_verified)
        .bind(username)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(translate("user", username))
    }

    async fn create_verify_email(
        &mut self,
        arg: NewVerifyEmail,
    ) -> Result<VerifyEmail, LedgerError> {
        sqlx::query_as::<_, VerifyEmail>(&format!(
            "INSERT INTO verify_emails (username, email, secret_code, expired_at) \
             VALUES ($1, $2, $3, $4) RETURNING {}",
            VERIFY_EMAIL_COLUMNS
        ))
        .bind(&arg.username)
        .bind(&arg.email)
        .bind(&arg.secret_code)
        .bind(arg.expired_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(translate("user", &arg.username))
    }

    async fn consume_verify_email(
        &mut self,
        id: VerifyEmailId,
        secret_code: &str,
    ) -> Result<VerifyEmail, LedgerError> {
        sqlx::query_as::<_, VerifyEmail>(&format!(
            "UPDATE verify_emails SET is_used = TRUE \
             WHERE id = $1 AND secret_code = $2 AND is_used = FALSE AND expired_at > now() \
             RETURNING {}",
            VERIFY_EMAIL_COLUMNS
        ))
        .bind(id)
        .bind(secret_code)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(translate("verify_email", id))
    }
}

#[async_trait]
impl StoreTx for PgTx {
    async fn commit(self) -> Result<(), LedgerError> {
        self.tx
            .commit()
            .await
            .map_err(translate("transaction", "commit"))
    }

    async fn rollback(self) -> Result<(), LedgerError> {
        self.tx
            .rollback()
            .await
            .map_err(translate("transaction", "rollback"))
    }
}
