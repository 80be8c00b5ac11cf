//! Bank Ledger Library
//! # Overview
//!
//! Transactional core of a small banking service: double-entry funds
//! transfers, user registration with an outboxed verification email, and
//! email verification, all built on a unit-of-work executor over a
//! pluggable store.
//!
//! # Architecture
//!
//! - [`types`] - Rows, transfer inputs/outputs, replay records and errors
//! - [`store`] - `Queries`/`Store` traits with in-memory and PostgreSQL backends
//! - [`core`] - Business logic components:
//!   - [`core::unit_of_work`] - Commit-or-rollback transaction executor
//!   - [`core::transfer`] - Funds transfer engine with ordered row locks
//!   - [`core::batch_processor`] - Concurrent transfer batches
//!   - [`core::registration`] - User creation plus verification task
//!   - [`core::verification`] - One-time code consumption
//! - [`worker`] - Task queue: distributor, broker, weighted processor, handlers,
//!   and the long-running worker process
//! - [`mail`] - Outbound email capability
//! - [`io`] - CSV reading and balance output for ledger replay
//! - [`strategy`] - Sequential and concurrent replay pipelines
//! - [`cli`] - CLI arguments parsing
//! - [`logging`] - tracing subscriber setup
//!
//! # Amounts
//!
//! Balances and amounts are `i64` minor units of the account currency.
//! Decimal strings only exist at the CSV boundary.

// Module declarations
pub mod cli;
pub mod core;
pub mod io;
pub mod logging;
pub mod mail;
pub mod store;
pub mod strategy;
pub mod types;
pub mod worker;

pub use core::{execute_in_transaction, Registration, TransferEngine, TransferPolicy};
pub use io::write_accounts_csv;
pub use store::{MemoryStore, PgStore, Queries, Store, StoreTx};
pub use types::{Account, ErrorKind, LedgerError, TransferTxParams, TransferTxResult, User};
