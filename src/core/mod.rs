//! Core business logic module
//!
//! This module contains the transactional orchestration components:
//! - `unit_of_work` - Runs a closure inside one store transaction
//! - `transfer` - Double-entry funds transfers with ordered row locks
//! - `batch_processor` - Concurrent transfer batches that keep per-account order
//! - `registration` - User creation with the verification-task outbox hook
//! - `verification` - Consumes a verification code and verifies the user

pub mod batch_processor;
pub mod registration;
pub mod transfer;
pub mod unit_of_work;
pub mod verification;

pub use batch_processor::{partition_into_waves, TransferBatchProcessor, TransferOutcome};
pub use registration::{create_user_tx, Registration};
pub use transfer::{TransferEngine, TransferPolicy};
pub use unit_of_work::{execute_in_transaction, UnitOfWork};
pub use verification::{verify_email_tx, INVALID_VERIFICATION};
