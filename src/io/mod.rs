//! I/O module
//!
//! Handles CSV parsing and output for ledger replay and user registration.
//!
//! # Components
//!
//! - `csv_format` - Row formats, amount conversion, balance output
//! - `sync_reader` - Synchronous CSV reader with iterator interface
//! - `async_reader` - Asynchronous CSV reader with batch reading interface

pub mod async_reader;
pub mod csv_format;
pub mod sync_reader;

pub use async_reader::AsyncReader;
pub use csv_format::{
    format_minor_units, parse_minor_units, write_accounts_csv, AccountCsvRecord, CsvRow,
    TransferCsvRecord, UserCsvRecord,
};
pub use sync_reader::SyncReader;
