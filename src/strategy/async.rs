//! Concurrent batch replay strategy
//!
//! # Architecture
//!
//! ```text
//! AsyncReplayStrategy
//!     ├── BatchConfig (batch_size, max_concurrent)
//!     ├── AsyncReader (batch CSV reading over tokio files)
//!     ├── ReplayLedger (account seeding, number mapping)
//!     └── TransferBatchProcessor (account-disjoint waves, bounded concurrency)
//! ```
//!
//! Batches are processed one after another; inside a batch, transfers that
//! share no account run concurrently. Per-account order is kept both within
//! and across batches, so the final balances match the sequential strategy.

use crate::core::{TransferBatchProcessor, TransferEngine};
use crate::io::async_reader::AsyncReader;
use crate::io::csv_format::{write_accounts_csv, AccountCsvRecord, TransferCsvRecord};
use crate::store::Store;
use crate::strategy::{
    log_summary, reject_unresolved, seed_or_skip, tally, ReplayLedger, ReplayStrategy,
    ReplaySummary,
};
use async_trait::async_trait;
use std::io::Write;
use std::path::Path;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

/// Configuration for batch processing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchConfig {
    /// Number of transfers read per batch
    pub batch_size: usize,
    /// Maximum number of transfers in flight at once
    pub max_concurrent: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            max_concurrent: num_cpus::get(),
        }
    }
}

impl BatchConfig {
    /// Create a new BatchConfig with custom values
    ///
    /// Zero values fall back to the defaults with a warning.
    pub fn new(batch_size: usize, max_concurrent: usize) -> Self {
        let default = Self::default();

        let batch_size = if batch_size == 0 {
            tracing::warn!(
                batch_size,
                default = default.batch_size,
                "invalid batch size, using default"
            );
            default.batch_size
        } else {
            batch_size
        };

        let max_concurrent = if max_concurrent == 0 {
            tracing::warn!(
                max_concurrent,
                default = default.max_concurrent,
                "invalid concurrency limit, using default"
            );
            default.max_concurrent
        } else {
            max_concurrent
        };

        Self {
            batch_size,
            max_concurrent,
        }
    }
}

/// Concurrent batch replay strategy
#[derive(Debug)]
pub struct AsyncReplayStrategy<S> {
    engine: TransferEngine<S>,
    config: BatchConfig,
}

async fn open(path: &Path) -> Result<Compat<tokio::fs::File>, String> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| format!("Failed to open file '{}': {}", path.display(), e))?;
    Ok(file.compat())
}

impl<S: Store> AsyncReplayStrategy<S> {
    /// Create a new AsyncReplayStrategy
    ///
    /// # Arguments
    ///
    /// * `engine` - Engine all transfers run through
    /// * `config` - Batch size and concurrency limit
    pub fn new(engine: TransferEngine<S>, config: BatchConfig) -> Self {
        Self { engine, config }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }
}

#[async_trait]
impl<S: Store> ReplayStrategy for AsyncReplayStrategy<S> {
    async fn replay(
        &self,
        accounts_path: &Path,
        transfers_path: &Path,
        output: &mut (dyn Write + Send),
    ) -> Result<ReplaySummary, String> {
        let mut accounts: AsyncReader<_, AccountCsvRecord> =
            AsyncReader::new(open(accounts_path).await?);
        let mut transfers: AsyncReader<_, TransferCsvRecord> =
            AsyncReader::new(open(transfers_path).await?);

        let mut ledger = ReplayLedger::new(self.engine.clone());
        let mut summary = ReplaySummary::default();

        // Seeding stays sequential so account numbers map in file order
        loop {
            let batch = accounts.read_batch(self.config.batch_size).await;
            if batch.is_empty() {
                break;
            }
            for record in batch {
                seed_or_skip(&mut ledger, record, &mut summary).await;
            }
        }

        let processor =
            TransferBatchProcessor::new(self.engine.clone(), self.config.max_concurrent);
        loop {
            let batch = transfers.read_batch(self.config.batch_size).await;
            if batch.is_empty() {
                break;
            }

            let mut resolved = Vec::with_capacity(batch.len());
            for record in &batch {
                match ledger.resolve(record) {
                    Ok(params) => resolved.push(params),
                    Err(e) => reject_unresolved(&mut summary, record, &e),
                }
            }

            for outcome in processor.process_batch(resolved).await {
                tally(&mut summary, &outcome.params, &outcome.result);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TransferPolicy;
    use crate::store::MemoryStore;
    use crate::strategy::SyncReplayStrategy;
    use rstest::rstest;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    /// Helper function to create a temporary CSV file for testing
    fn create_temp_csv(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("Failed to create temp file");
        file.write_all(content.as_bytes())
            .expect("Failed to write to temp file");
        file.flush().expect("Failed to flush temp file");
        file
    }

    fn engine() -> TransferEngine<MemoryStore> {
        TransferEngine::new(Arc::new(MemoryStore::new()), TransferPolicy::default())
    }

    #[rstest]
    #[case::custom(2000, 8, BatchConfig { batch_size: 2000, max_concurrent: 8 })]
    #[case::zero_batch_size(0, 8, BatchConfig { batch_size: 1000, max_concurrent: 8 })]
    #[case::zero_concurrency(50, 0, BatchConfig { batch_size: 50, max_concurrent: num_cpus::get() })]
    fn test_batch_config_new(
        #[case] batch_size: usize,
        #[case] max_concurrent: usize,
        #[case] expected: BatchConfig,
    ) {
        assert_eq!(BatchConfig::new(batch_size, max_concurrent), expected);
    }

    #[tokio::test]
    async fn test_async_strategy_handles_missing_file() {
        let strategy = AsyncReplayStrategy::new(engine(), BatchConfig::default());
        let transfers = create_temp_csv("from,to,amount\n");
        let mut output = Vec::new();

        let error = strategy
            .replay(Path::new("nonexistent.csv"), transfers.path(), &mut output)
            .await
            .unwrap_err();

        assert!(error.contains("Failed to open file"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_async_strategy_matches_sync_across_batches() {
        // Several transfers depend on funds that arrive earlier in the file,
        // and the dependencies straddle batch boundaries
        let accounts = create_temp_csv(
            "account,owner,currency,balance\n\
             1,alice,USD,100.00\n\
             2,bob,USD,0.00\n\
             3,carol,USD,0.00\n\
             4,dave,USD,10.00\n",
        );
        let transfers = create_temp_csv(
            "from,to,amount\n\
             1,2,60.00\n\
             2,3,50.00\n\
             4,1,10.00\n\
             3,4,45.00\n\
             2,1,20.00\n\
             1,3,50.00\n\
             4,2,45.00\n",
        );

        let mut expected = Vec::new();
        let sync_summary = SyncReplayStrategy::new(engine())
            .replay(accounts.path(), transfers.path(), &mut expected)
            .await
            .unwrap();

        let mut output = Vec::new();
        let async_summary = AsyncReplayStrategy::new(engine(), BatchConfig::new(2, 4))
            .replay(accounts.path(), transfers.path(), &mut output)
            .await
            .unwrap();

        assert_eq!(async_summary, sync_summary);
        assert_eq!(sync_summary.transfers_rejected, 1);
        assert_eq!(
            String::from_utf8(output).unwrap(),
            String::from_utf8(expected).unwrap()
        );
    }
}
