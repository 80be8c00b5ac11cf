//! Concurrent transfer batch processing
//!
//! `TransferBatchProcessor` runs a batch of transfers through the
//! `TransferEngine` concurrently while keeping every account's transfers in
//! their original order.
//!
//! # Waves
//!
//! A batch is split into waves. Each transfer goes into the wave after the
//! last one that already touches either of its accounts, so:
//! - transfers inside a wave share no account and run concurrently
//! - waves run one after another
//! - for any single account, transfers apply in input order
//!
//! The outcome of a batch is therefore the same as applying it sequentially,
//! including which transfers are rejected for insufficient funds.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::store::Store;
use crate::types::{AccountId, LedgerError, TransferTxParams, TransferTxResult};

use super::transfer::TransferEngine;

/// Outcome of one transfer in a batch
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub params: TransferTxParams,
    pub result: Result<TransferTxResult, LedgerError>,
}

/// Batch processor for concurrent transfers
#[derive(Debug)]
pub struct TransferBatchProcessor<S> {
    engine: TransferEngine<S>,
    permits: Arc<Semaphore>,
}

impl<S> Clone for TransferBatchProcessor<S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            permits: Arc::clone(&self.permits),
        }
    }
}

/// Split a batch into account-disjoint waves
///
/// # Arguments
///
/// * `batch` - Transfers in input order
///
/// # Returns
///
/// Waves in execution order. Every transfer appears in exactly one wave,
/// and two transfers sharing an account keep their relative order.
pub fn partition_into_waves(batch: Vec<TransferTxParams>) -> Vec<Vec<TransferTxParams>> {
    let mut waves: Vec<Vec<TransferTxParams>> = Vec::new();
    // Index of the next wave each account may join
    let mut next_wave: HashMap<AccountId, usize> = HashMap::new();

    for params in batch {
        let wave = [params.from_account_id, params.to_account_id]
            .iter()
            .filter_map(|id| next_wave.get(id).copied())
            .max()
            .unwrap_or(0);

        if wave == waves.len() {
            waves.push(Vec::new());
        }
        waves[wave].push(params);
        next_wave.insert(params.from_account_id, wave + 1);
        next_wave.insert(params.to_account_id, wave + 1);
    }

    waves
}

impl<S: Store> TransferBatchProcessor<S> {
    /// Create a new TransferBatchProcessor
    ///
    /// # Arguments
    ///
    /// * `engine` - Engine every transfer runs through
    /// * `max_concurrent` - Upper bound on transfers in flight; 0 is treated as 1
    pub fn new(engine: TransferEngine<S>, max_concurrent: usize) -> Self {
        Self {
            engine,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Run a batch of transfers
    ///
    /// # Returns
    ///
    /// One outcome per transfer that ran to completion. Outcomes are grouped
    /// by wave; order within a wave follows completion.
    pub async fn process_batch(&self, batch: Vec<TransferTxParams>) -> Vec<TransferOutcome> {
        let mut outcomes = Vec::with_capacity(batch.len());

        for wave in partition_into_waves(batch) {
            let mut tasks = JoinSet::new();
            for params in wave {
                let engine = self.engine.clone();
                let permits = Arc::clone(&self.permits);
                tasks.spawn(async move {
                    let result = match permits.acquire_owned().await {
                        Ok(_permit) => engine.transfer(params).await,
                        Err(_) => Err(LedgerError::Internal(
                            "transfer permits closed".to_string(),
                        )),
                    };
                    TransferOutcome { params, result }
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => tracing::error!(error = %e, "transfer task failed"),
                }
            }
        }

        outcomes
    }
}
