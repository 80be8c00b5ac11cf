//! Asynchronous CSV reader with batch reading interface
//!
//! Reads replay records in batches from any `futures::io::AsyncRead`
//! source. Tokio files are adapted with `tokio_util::compat`.
//!
//! Rows that fail to parse or convert are logged with their line number and
//! skipped, so a batch only ever contains valid records.

use crate::io::csv_format::CsvRow;
use csv_async::AsyncReaderBuilder;
use futures::io::AsyncRead;
use futures::stream::StreamExt;
use std::marker::PhantomData;

/// Asynchronous CSV reader
pub struct AsyncReader<R: AsyncRead + Unpin, C> {
    csv_reader: csv_async::AsyncDeserializer<R>,
    line_num: usize,
    _row: PhantomData<C>,
}

impl<R, C> AsyncReader<R, C>
where
    R: AsyncRead + Unpin + Send + 'static,
    C: CsvRow,
{
    /// Create a new AsyncReader over `reader`
    ///
    /// The first line is treated as the header.
    pub fn new(reader: R) -> Self {
        let csv_reader = AsyncReaderBuilder::new()
            .trim(csv_async::Trim::All)
            .create_deserializer(reader);

        Self {
            csv_reader,
            line_num: 1,
            _row: PhantomData,
        }
    }

    /// Read up to `batch_size` valid records
    ///
    /// # Returns
    ///
    /// The records in file order. An empty batch means the input is exhausted.
    pub async fn read_batch(&mut self, batch_size: usize) -> Vec<C::Record> {
        let mut batch = Vec::with_capacity(batch_size);
        let mut rows = self.csv_reader.deserialize::<C>();

        while batch.len() < batch_size {
            let Some(row) = rows.next().await else {
                break;
            };
            self.line_num += 1;
            match row.map_err(|e| e.to_string()).and_then(C::convert) {
                Ok(record) => batch.push(record),
                Err(e) => tracing::warn!(line = self.line_num, error = %e, "skipping CSV row"),
            }
        }

        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::csv_format::{AccountCsvRecord, TransferCsvRecord};
    use futures::io::Cursor;

    fn transfers(content: &'static str) -> AsyncReader<Cursor<&'static [u8]>, TransferCsvRecord> {
        AsyncReader::new(Cursor::new(content.as_bytes()))
    }

    #[tokio::test]
    async fn test_async_reader_multiple_batches() {
        let mut reader = transfers(
            "from,to,amount\n\
             1,2,1.00\n\
             1,2,2.00\n\
             1,2,3.00\n",
        );

        let batch = reader.read_batch(2).await;
        assert_eq!(
            batch.iter().map(|t| t.amount).collect::<Vec<_>>(),
            vec![100, 200]
        );

        let batch = reader.read_batch(2).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].amount, 300);

        assert!(reader.read_batch(2).await.is_empty());
    }

    #[tokio::test]
    async fn test_async_reader_empty_csv() {
        let mut reader = transfers("from,to,amount\n");
        assert!(reader.read_batch(10).await.is_empty());
    }

    #[tokio::test]
    async fn test_async_reader_skips_invalid_rows() {
        let mut reader = transfers(
            "from,to,amount\n\
             one,2,1.00\n\
             1,2,1.999\n\
             2,1,4.00\n",
        );

        let batch = reader.read_batch(10).await;
        assert_eq!(batch.len(), 1);
        assert_eq!((batch[0].from, batch[0].to, batch[0].amount), (2, 1, 400));
        assert_eq!(reader.line_num, 4);
    }

    #[tokio::test]
    async fn test_async_reader_reads_accounts_with_whitespace() {
        let mut reader: AsyncReader<_, AccountCsvRecord> = AsyncReader::new(Cursor::new(
            "account,owner,currency,balance\n  5 , carol , eur , 12.5 \n".as_bytes(),
        ));

        let batch = reader.read_batch(10).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].owner, "carol");
        assert_eq!(batch[0].currency, "EUR");
        assert_eq!(batch[0].balance, 1250);
    }
}
