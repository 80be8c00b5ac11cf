//! Synchronous CSV reader with iterator interface
//!
//! Provides a streaming iterator over replay records from a CSV file. The
//! row format is chosen by the `CsvRow` type parameter, so the same reader
//! serves the account seed file and the transfer file.
//!
//! ```no_run
//! use bank_ledger::io::csv_format::TransferCsvRecord;
//! use bank_ledger::io::sync_reader::SyncReader;
//! use std::path::Path;
//!
//! let reader = SyncReader::<TransferCsvRecord>::new(Path::new("transfers.csv")).unwrap();
//! for result in reader {
//!     match result {
//!         Ok(record) => println!("Replaying transfer: {:?}", record),
//!         Err(e) => eprintln!("Error: {}", e),
//!     }
//! }
//! ```
//!
//! # Error Handling
//!
//! - Fatal errors (file not found) are returned from `new()`
//! - Individual row errors are yielded as Err variants in the iterator
//! - Line numbers are included in error messages for debugging

use crate::io::csv_format::CsvRow;
use csv::{ReaderBuilder, Trim};
use std::fs::File;
use std::marker::PhantomData;
use std::path::Path;

/// Synchronous CSV reader
///
/// Reads one row at a time; memory use does not grow with the file.
#[derive(Debug)]
pub struct SyncReader<C> {
    reader: csv::Reader<File>,
    line_num: usize,
    _row: PhantomData<C>,
}

impl<C: CsvRow> SyncReader<C> {
    /// Create a new SyncReader from a file path
    ///
    /// Fields are trimmed and the reader uses an 8KB buffer.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the CSV file
    ///
    /// # Returns
    ///
    /// * `Ok(SyncReader)` if file opened successfully
    /// * `Err(String)` if file could not be opened
    pub fn new(path: &Path) -> Result<Self, String> {
        let file = File::open(path)
            .map_err(|e| format!("Failed to open file '{}': {}", path.display(), e))?;

        let reader = ReaderBuilder::new()
            .trim(Trim::All)
            .buffer_capacity(8 * 1024)
            .from_reader(file);

        Ok(Self {
            reader,
            line_num: 0,
            _row: PhantomData,
        })
    }
}

impl<C: CsvRow> Iterator for SyncReader<C> {
    type Item = Result<C::Record, String>;

    /// Get the next record from the CSV file
    ///
    /// # Returns
    ///
    /// * `Some(Ok(record))` - Successfully parsed record
    /// * `Some(Err(String))` - Parse or conversion error with line number
    /// * `None` - End of file reached
    fn next(&mut self) -> Option<Self::Item> {
        let row = self.reader.deserialize::<C>().next()?;
        self.line_num += 1;
        // The header occupies line 1
        let line = self.line_num + 1;

        Some(match row {
            Ok(row) => row.convert().map_err(|e| format!("Line {}: {}", line, e)),
            Err(e) => Err(format!("Line {}: CSV parse error: {}", line, e)),
        })
    }
}
