//! Structured logging setup
//!
//! Logs go to stderr; stdout carries the CSV output. `RUST_LOG`, when set,
//! overrides the level passed on the command line.

use clap::ValueEnum;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log line format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Filter built from `RUST_LOG`, falling back to `level`
fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global tracing subscriber
///
/// # Arguments
///
/// * `format` - Text or JSON output
/// * `level` - Filter directive used when `RUST_LOG` is unset (e.g. `info`,
///   `bank_ledger=debug`)
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logging(format: LogFormat, level: &str) -> Result<(), String> {
    let registry = tracing_subscriber::registry().with(env_filter(level));

    let result = match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Text => registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };

    result.map_err(|e| format!("Failed to initialize logging: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        // The first call may lose to another test that installed a subscriber
        let _ = init_logging(LogFormat::Text, "warn");

        let error = init_logging(LogFormat::Json, "warn").unwrap_err();
        assert!(error.starts_with("Failed to initialize logging"));
    }
}
