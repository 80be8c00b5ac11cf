//! Unit-of-work executor
//!
//! Every multi-statement ledger operation runs through
//! [`execute_in_transaction`]: it opens a transaction, hands the
//! transaction handle to the caller's closure and commits or rolls back
//! depending on the outcome.
//!
//! # Cancellation
//!
//! The transaction handle is owned by the returned future. Dropping the
//! future before it completes (a deadline elapsing, a task being aborted)
//! drops the handle, which rolls the transaction back and releases its row
//! locks.

use futures::future::BoxFuture;

use crate::store::{Store, StoreTx};
use crate::types::LedgerError;

/// Future returned by a unit of work borrowing the transaction for `'t`
pub type UnitOfWork<'t, T> = BoxFuture<'t, Result<T, LedgerError>>;

/// Run `work` inside a single store transaction
///
/// Callers write the closure as `move |tx| Box::pin(async move { ... })`;
/// everything it captures must be owned.
///
/// # Arguments
///
/// * `store` - Store to open the transaction on
/// * `work` - Closure performing every read and write through the handle
///
/// # Returns
///
/// * `Ok(T)` - The closure succeeded and the commit succeeded
/// * `Err(e)` - Beginning the transaction, the closure or the commit failed
/// * `Err(LedgerError::RollbackFailed)` - The closure failed and so did the
///   rollback; both errors are carried
///
/// No retry happens at this layer.
pub async fn execute_in_transaction<S, T, F>(store: &S, work: F) -> Result<T, LedgerError>
where
    S: Store,
    T: Send,
    F: for<'t> FnOnce(&'t mut S::Tx) -> UnitOfWork<'t, T> + Send,
{
    let mut tx = store.begin().await?;

    let result = work(&mut tx).await;
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(error) => match tx.rollback().await {
            Ok(()) => Err(error),
            Err(rollback) => {
                tracing::error!(%error, %rollback, "rollback failed");
                Err(LedgerError::rollback_failed(error, rollback))
            }
        },
    }
}
