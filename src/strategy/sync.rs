//! Sequential replay strategy
//!
//! Streams both files with `SyncReader` and applies one transfer at a time,
//! in file order. The result is the reference the concurrent strategy has
//! to match.

use crate::core::TransferEngine;
use crate::io::csv_format::{write_accounts_csv, AccountCsvRecord, TransferCsvRecord};
use crate::io::sync_reader::SyncReader;
use crate::store::Store;
use crate::strategy::{
    log_summary, reject_unresolved, seed_or_skip, tally, ReplayLedger, ReplayStrategy,
    ReplaySummary,
};
use async_trait::async_trait;
use std::io::Write;
use std::path::Path;

/// Sequential replay strategy
///
/// # Examples
///
/// ```no_run
/// use bank_ledger::core::{TransferEngine, TransferPolicy};
/// use bank_ledger::store::MemoryStore;
/// use bank_ledger::strategy::{ReplayStrategy, SyncReplayStrategy};
/// use std::path::Path;
/// use std::sync::Arc;
///
/// # async fn run() -> Result<(), String> {
/// let engine = TransferEngine::new(Arc::new(MemoryStore::new()), TransferPolicy::default());
/// let strategy = SyncReplayStrategy::new(engine);
/// let mut output = std::io::stdout();
///
/// strategy
///     .replay(Path::new("accounts.csv"), Path::new("transfers.csv"), &mut output)
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SyncReplayStrategy<S> {
    engine: TransferEngine<S>,
}

impl<S: Store> SyncReplayStrategy<S> {
    pub fn new(engine: TransferEngine<S>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl<S: Store> ReplayStrategy for SyncReplayStrategy<S> {
    async fn replay(
        &self,
        accounts_path: &Path,
        transfers_path: &Path,
        output: &mut (dyn Write + Send),
    ) -> Result<ReplaySummary, String> {
        let accounts = SyncReader::<AccountCsvRecord>::new(accounts_path)?;
        let transfers = SyncReader::<TransferCsvRecord>::new(transfers_path)?;

        let mut ledger = ReplayLedger::new(self.engine.clone());
        let mut summary = ReplaySummary::default();

        for result in accounts {
            match result {
                Ok(record) => seed_or_skip(&mut ledger, record, &mut summary).await,
                Err(e) => tracing::warn!(error = %e, "skipping account row"),
            }
        }

        for result in transfers {
            let record = match result {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping transfer row");
                    continue;
                }
            };
            match ledger.resolve(&record) {
                Ok(params) => {
                    let result = ledger.engine().transfer(params).await;
                    tally(&mut summary, &params, &result);
                }
                Err(e) => reject_unresolved(&mut summary, &record, &e),
            }
        }

        let balances = ledger
            .balances()
            .await
            .map_err(|e| format!("Failed to read balances: {}", e))?;
        write_accounts_csv(&balances, output)?;

        log_summary(&summary);
        Ok(summary)
    }
}
