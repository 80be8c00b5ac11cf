//! Types module
//!
//! Contains the row types and errors shared across the ledger.
//! This module organizes types into logical submodules:
//! - `account`: Account rows
//! - `transfer`: Entry and Transfer rows plus transfer inputs/outputs
//! - `user`: User and VerifyEmail rows
//! - `record`: CSV replay records
//! - `error`: Error type and classification

pub mod account;
pub mod error;
pub mod record;
pub mod transfer;
pub mod user;

pub use account::{Account, AccountId, NewAccount};
pub use error::{ErrorKind, LedgerError};
pub use record::{AccountBalance, AccountRecord, TransferRecord};
pub use transfer::{Entry, EntryId, Transfer, TransferId, TransferTxParams, TransferTxResult};
pub use user::{
    NewUser, NewVerifyEmail, Role, User, UserUpdate, VerifyEmail, VerifyEmailId,
    VerifyEmailTxParams, VerifyEmailTxResult,
};
