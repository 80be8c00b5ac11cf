//! End-to-end replay tests
//!
//! Each fixture directory under tests/fixtures/ holds:
//! - `accounts.csv` - accounts to seed
//! - `transfers.csv` - transfers to replay
//! - `expected.csv` - final balances
//!
//! Fixtures cover:
//! - Happy path transfers in two currencies
//! - Rejections (insufficient funds, currency mismatch, unknown or identical
//!   accounts, non-positive and over-precise amounts)
//! - Transfers that depend on funds received earlier in the file
//! - Seeding edge cases (shared owners, duplicate numbers, bad rows)
//! - Opposing transfers between the same pair of accounts
//!
//! Each fixture is replayed with the sequential strategy and with the
//! concurrent strategy, once with default batches and once with tiny ones.

#[cfg(test)]
mod tests {
    use bank_ledger::cli::StrategyType;
    use bank_ledger::core::{TransferEngine, TransferPolicy};
    use bank_ledger::store::MemoryStore;
    use bank_ledger::strategy::{create_strategy, BatchConfig};
    use rstest::rstest;
    use std::fs;
    use std::io::Write;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    /// Replay a fixture and compare the output with expected.csv
    ///
    /// # Panics
    ///
    /// Panics if a fixture file is missing, the replay fails or the output
    /// differs from the expected balances.
    async fn run_test_fixture(
        fixture_name: &str,
        strategy_type: StrategyType,
        config: Option<BatchConfig>,
    ) {
        let fixture_dir = Path::new("tests/fixtures").join(fixture_name);
        let accounts_path = fixture_dir.join("accounts.csv");
        let transfers_path = fixture_dir.join("transfers.csv");
        let expected_path = fixture_dir.join("expected.csv");

        for path in [&accounts_path, &transfers_path, &expected_path] {
            assert!(path.exists(), "Fixture file not found: {}", path.display());
        }

        let engine = TransferEngine::new(Arc::new(MemoryStore::new()), TransferPolicy::default());
        let strategy = create_strategy(strategy_type, engine, config);

        let mut temp_output = NamedTempFile::new().expect("Failed to create temp file");
        strategy
            .replay(&accounts_path, &transfers_path, temp_output.as_file_mut())
            .await
            .unwrap_or_else(|e| panic!("Failed to replay transfers: {}", e));
        temp_output.flush().expect("Failed to flush temp file");

        let actual = fs::read_to_string(temp_output.path()).expect("Failed to read output");
        let expected = fs::read_to_string(&expected_path).expect("Failed to read expected file");

        assert_eq!(
            normalize(&actual),
            normalize(&expected),
            "Output mismatch for fixture '{}' with {:?}",
            fixture_name,
            strategy_type
        );
    }

    /// Trim line whitespace and drop blank lines
    fn normalize(csv: &str) -> Vec<String> {
        csv.lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect()
    }

    #[rstest]
    #[case::happy_path("happy_path")]
    #[case::rejected_transfers("rejected_transfers")]
    #[case::ordering_dependencies("ordering_dependencies")]
    #[case::seeding_edge_cases("seeding_edge_cases")]
    #[case::opposing_transfers("opposing_transfers")]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fixture(#[case] fixture_name: &str) {
        run_test_fixture(fixture_name, StrategyType::Sync, None).await;
        run_test_fixture(fixture_name, StrategyType::Async, None).await;
        run_test_fixture(fixture_name, StrategyType::Async, Some(BatchConfig::new(2, 4))).await;
    }
}
