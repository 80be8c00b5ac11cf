//! Replay strategy module
//!
//! A replay seeds accounts from one CSV file, runs the transfers from a
//! second CSV file through the `TransferEngine` and writes the final
//! balances as CSV. The Strategy pattern lets the sequential and the
//! concurrent pipelines be selected at runtime.
//!
//! Rows that fail to parse and transfers the engine rejects are logged and
//! skipped; only I/O and store failures abort a replay.

use crate::cli::StrategyType;
use crate::core::TransferEngine;
use crate::store::Store;
use crate::types::{
    AccountRecord, LedgerError, TransferRecord, TransferTxParams, TransferTxResult,
};
use async_trait::async_trait;
use std::io::Write;
use std::path::Path;

pub mod r#async;
pub mod ledger;
pub mod sync;

pub use self::r#async::{AsyncReplayStrategy, BatchConfig};
pub use ledger::{ReplayLedger, ReplaySummary};
pub use sync::SyncReplayStrategy;

/// Replay strategy trait for complete ledger replay pipelines
#[async_trait]
pub trait ReplayStrategy: Send + Sync {
    /// Seed accounts, replay transfers and write final balances to `output`
    ///
    /// # Arguments
    ///
    /// * `accounts_path` - CSV file with `account,owner,currency,balance` rows
    /// * `transfers_path` - CSV file with `from,to,amount` rows
    /// * `output` - Writer receiving the `account,owner,currency,balance` CSV
    ///
    /// # Returns
    ///
    /// * `Ok(ReplaySummary)` with the number of seeded accounts and of
    ///   applied and rejected transfers
    /// * `Err(String)` if a fatal error occurred
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Either input file cannot be opened
    /// - The final balances cannot be read from the store
    /// - Output cannot be written
    async fn replay(
        &self,
        accounts_path: &Path,
        transfers_path: &Path,
        output: &mut (dyn Write + Send),
    ) -> Result<ReplaySummary, String>;
}

/// Create a replay strategy based on the specified strategy type
///
/// # Arguments
///
/// * `strategy_type` - Sequential (`Sync`) or concurrent (`Async`) replay
/// * `engine` - Engine all transfers run through
/// * `config` - Batch configuration for the concurrent strategy (ignored for sync)
pub fn create_strategy<S: Store>(
    strategy_type: StrategyType,
    engine: TransferEngine<S>,
    config: Option<BatchConfig>,
) -> Box<dyn ReplayStrategy> {
    match strategy_type {
        StrategyType::Sync => Box::new(SyncReplayStrategy::new(engine)),
        StrategyType::Async => {
            Box::new(AsyncReplayStrategy::new(engine, config.unwrap_or_default()))
        }
    }
}

async fn seed_or_skip<S: Store>(
    ledger: &mut ReplayLedger<S>,
    record: AccountRecord,
    summary: &mut ReplaySummary,
) {
    let account = record.account;
    match ledger.seed(record).await {
        Ok(_) => summary.accounts_seeded += 1,
        Err(e) => tracing::warn!(account, error = %e, "skipping account"),
    }
}

fn tally(
    summary: &mut ReplaySummary,
    params: &TransferTxParams,
    result: &Result<TransferTxResult, LedgerError>,
) {
    match result {
        Ok(_) => summary.transfers_applied += 1,
        Err(e) => {
            summary.transfers_rejected += 1;
            tracing::warn!(
                from_account_id = params.from_account_id,
                to_account_id = params.to_account_id,
                amount = params.amount,
                kind = ?e.kind(),
                error = %e,
                "transfer rejected"
            );
        }
    }
}

fn reject_unresolved(summary: &mut ReplaySummary, record: &TransferRecord, error: &LedgerError) {
    summary.transfers_rejected += 1;
    tracing::warn!(
        from = record.from,
        to = record.to,
        amount = record.amount,
        error = %error,
        "transfer rejected"
    );
}

fn log_summary(summary: &ReplaySummary) {
    tracing::info!(
        accounts_seeded = summary.accounts_seeded,
        transfers_applied = summary.transfers_applied,
        transfers_rejected = summary.transfers_rejected,
        "replay finished"
    );
}
