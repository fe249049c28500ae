use csv_async::{AsyncReader, ByteRecord, ErrorKind};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{debug, trace};

use super::options::Dialect;
use super::quotes::{QuoteTracking, ScanProgress};
use super::record::{Header, InvalidReason, InvalidRow, Record};
use crate::error::{ConfigError, PipelineError};

/// One item produced by the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedRow {
    /// The header record, produced at most once and only in header mode.
    Header(Header),
    /// A data row: a record, or the reason it could not become one.
    Data(Result<Record, InvalidRow>),
}

/// Turns a byte stream into records, one logical CSV record at a time.
///
/// Quoted fields may hold delimiters, quotes and newlines. Blank lines are
/// skipped and never numbered. Nothing is read ahead beyond the reader's own
/// buffer. A quoted field still open at end of input makes its row invalid.
pub struct RowDecoder<R> {
    reader: AsyncReader<QuoteTracking<R>>,
    quotes: Arc<ScanProgress>,
    has_headers: bool,
    header: Option<Header>,
    record: ByteRecord,
    rows_read: u64,
}

impl<R> RowDecoder<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(reader: R, has_headers: bool, dialect: &Dialect) -> Result<Self, ConfigError> {
        let builder = dialect.reader_builder()?;
        let (tracked, quotes) = QuoteTracking::new(reader, dialect);
        Ok(Self {
            reader: builder.create_reader(tracked),
            quotes,
            has_headers,
            header: None,
            record: ByteRecord::new(),
            rows_read: 0,
        })
    }

    /// The captured header, once the first record has been read in header mode.
    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    /// Data rows decoded so far, valid or not.
    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    /// Decode the next record. `Ok(None)` is the clean end of the stream.
    pub async fn next_row(&mut self) -> Result<Option<DecodedRow>, PipelineError> {
        let more = self
            .reader
            .read_byte_record(&mut self.record)
            .await
            .map_err(|e| classify_error(e, Some(self.rows_read + 1)))?;
        if !more {
            debug!(rows = self.rows_read, "end of csv stream");
            return Ok(None);
        }

        let unterminated = self
            .quotes
            .unterminated_at(self.reader.position().byte());

        if self.has_headers && self.header.is_none() {
            let header = self.capture_header(unterminated)?;
            return Ok(Some(DecodedRow::Header(header)));
        }

        self.rows_read += 1;
        let row_number = self.rows_read;
        let (fields, bad_field) = decode_fields(&self.record);

        if unterminated {
            debug!(row_number, "quoted field open at end of input");
            return Ok(Some(DecodedRow::Data(Err(InvalidRow {
                row_number,
                fields,
                reason: InvalidReason::UnterminatedQuote,
            }))));
        }
        if let Some(field) = bad_field {
            return Ok(Some(DecodedRow::Data(Err(InvalidRow {
                row_number,
                fields,
                reason: InvalidReason::InvalidUtf8 { field },
            }))));
        }

        let data = match &self.header {
            Some(header) if header.len() != fields.len() => Err(InvalidRow {
                row_number,
                reason: InvalidReason::UnequalLengths {
                    expected: header.len(),
                    found: fields.len(),
                },
                fields,
            }),
            Some(header) => Ok(Record::from_parts(header.clone(), fields)),
            None => Ok(Record::positional(fields)),
        };
        trace!(row_number, valid = data.is_ok(), "decoded row");
        Ok(Some(DecodedRow::Data(data)))
    }

    fn capture_header(&mut self, unterminated: bool) -> Result<Header, PipelineError> {
        if unterminated {
            return Err(PipelineError::Decode {
                row_number: None,
                message: "header ends inside an unterminated quoted field".to_string(),
            });
        }
        let (columns, bad_field) = decode_fields(&self.record);
        if let Some(field) = bad_field {
            return Err(PipelineError::Decode {
                row_number: None,
                message: format!("header column {} is not valid UTF-8", field),
            });
        }

        let header = Header::new(columns);
        if let Some(dup) = header.first_duplicate() {
            return Err(PipelineError::Decode {
                row_number: None,
                message: format!("duplicate header column {:?}", dup),
            });
        }

        debug!(columns = ?header.columns(), "captured csv header");
        self.header = Some(header.clone());
        Ok(header)
    }
}

/// Decode every field as UTF-8, replacing bad bytes lossily.
/// Also returns the index of the first field that was not valid UTF-8.
fn decode_fields(record: &ByteRecord) -> (Vec<String>, Option<usize>) {
    let mut bad_field = None;
    let fields = record
        .iter()
        .enumerate()
        .map(|(idx, raw)| match std::str::from_utf8(raw) {
            Ok(s) => s.to_owned(),
            Err(_) => {
                bad_field.get_or_insert(idx);
                String::from_utf8_lossy(raw).into_owned()
            }
        })
        .collect();
    (fields, bad_field)
}

fn classify_error(err: csv_async::Error, row_number: Option<u64>) -> PipelineError {
    let message = err.to_string();
    match err.into_kind() {
        ErrorKind::Io(io) => PipelineError::StreamIo(io),
        _ => PipelineError::Decode {
            row_number,
            message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    async fn decode_all(
        input: &[u8],
        has_headers: bool,
        dialect: &Dialect,
    ) -> Result<Vec<DecodedRow>, PipelineError> {
        let mut decoder = RowDecoder::new(input, has_headers, dialect)?;
        let mut rows = Vec::new();
        while let Some(row) = decoder.next_row().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    fn values(row: &DecodedRow) -> Vec<String> {
        match row {
            DecodedRow::Data(Ok(record)) => record.values().to_vec(),
            other => panic!("expected a record, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_header_then_keyed_rows() -> Result<()> {
        let rows = decode_all(b"id,name\n1,a\n2,b\n", true, &Dialect::default()).await?;
        assert_eq!(rows.len(), 3);
        match &rows[0] {
            DecodedRow::Header(h) => assert_eq!(h.columns(), ["id", "name"]),
            other => panic!("expected header, got {:?}", other),
        }
        match &rows[2] {
            DecodedRow::Data(Ok(rec)) => {
                assert_eq!(rec.get("id"), Some("2"));
                assert_eq!(rec.get("name"), Some("b"));
            }
            other => panic!("expected record, got {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_positional_rows_allow_any_width() -> Result<()> {
        let rows = decode_all(b"1,a\n2,b,c\n3\n", false, &Dialect::default()).await?;
        assert_eq!(rows.len(), 3);
        assert_eq!(values(&rows[1]), vec!["2", "b", "c"]);
        assert_eq!(values(&rows[2]), vec!["3"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_quoted_fields_keep_delimiters_and_newlines() -> Result<()> {
        let input = b"name,bio\n\"Doe, John\",\"line1\nline2 \"\"quoted\"\"\"\n";
        let rows = decode_all(input, true, &Dialect::default()).await?;
        assert_eq!(rows.len(), 2);
        assert_eq!(
            values(&rows[1]),
            vec!["Doe, John", "line1\nline2 \"quoted\""]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_unequal_lengths_numbered_from_first_data_row() -> Result<()> {
        let rows = decode_all(b"id,name\n1,a\n2,b,extra\n3,c\n", true, &Dialect::default())
            .await?;
        match &rows[2] {
            DecodedRow::Data(Err(invalid)) => {
                assert_eq!(invalid.row_number, 2);
                assert_eq!(invalid.fields, vec!["2", "b", "extra"]);
                assert_eq!(
                    invalid.reason,
                    InvalidReason::UnequalLengths {
                        expected: 2,
                        found: 3
                    }
                );
            }
            other => panic!("expected invalid row, got {:?}", other),
        }
        // decoding carries on after an invalid row
        assert_eq!(values(&rows[3]), vec!["3", "c"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_utf8_field() -> Result<()> {
        let rows = decode_all(b"a,b\nok,\xff\xfe\n", true, &Dialect::default()).await?;
        match &rows[1] {
            DecodedRow::Data(Err(invalid)) => {
                assert_eq!(invalid.row_number, 1);
                assert_eq!(invalid.reason, InvalidReason::InvalidUtf8 { field: 1 });
                assert_eq!(invalid.fields[0], "ok");
            }
            other => panic!("expected invalid row, got {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_blank_lines_skipped() -> Result<()> {
        let rows = decode_all(b"id\n\n1\n\n\n2\n", true, &Dialect::default()).await?;
        assert_eq!(rows.len(), 3);
        assert_eq!(values(&rows[2]), vec!["2"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_input_has_no_header() -> Result<()> {
        let mut decoder = RowDecoder::new(&b""[..], true, &Dialect::default())?;
        assert!(decoder.next_row().await?.is_none());
        assert!(decoder.header().is_none());
        assert_eq!(decoder.rows_read(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_header_is_fatal() {
        let err = decode_all(b"id,id\n1,2\n", true, &Dialect::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Decode { .. }));
        assert!(err.to_string().contains("duplicate header column"));
    }

    #[tokio::test]
    async fn test_custom_dialect() -> Result<()> {
        let dialect = Dialect {
            delimiter: ';',
            quote: '\'',
            trim: true,
            comment: Some('#'),
            ..Dialect::default()
        };
        let input = b"# exported\n id ; name \n 1 ;'a;b'\n";
        let rows = decode_all(input, true, &dialect).await?;
        assert_eq!(rows.len(), 2);
        match &rows[0] {
            DecodedRow::Header(h) => assert_eq!(h.columns(), ["id", "name"]),
            other => panic!("expected header, got {:?}", other),
        }
        assert_eq!(values(&rows[1]), vec!["1", "a;b"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_unterminated_quote_is_invalid() -> Result<()> {
        let input = b"id,name\n1,a\n2,\"b\n3,c\n";
        let rows = decode_all(input, true, &Dialect::default()).await?;
        // the open quote swallows the rest of the input into one row
        assert_eq!(rows.len(), 3);
        assert_eq!(values(&rows[1]), vec!["1", "a"]);
        match &rows[2] {
            DecodedRow::Data(Err(invalid)) => {
                assert_eq!(invalid.row_number, 2);
                assert_eq!(invalid.reason, InvalidReason::UnterminatedQuote);
                assert_eq!(invalid.fields, vec!["2", "b\n3,c\n"]);
            }
            other => panic!("expected invalid row, got {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_unterminated_quote_positional() -> Result<()> {
        let rows = decode_all(b"1,\"open", false, &Dialect::default()).await?;
        match &rows[0] {
            DecodedRow::Data(Err(invalid)) => {
                assert_eq!(invalid.row_number, 1);
                assert_eq!(invalid.reason, InvalidReason::UnterminatedQuote);
            }
            other => panic!("expected invalid row, got {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_unterminated_quote_in_header_is_fatal() {
        let err = decode_all(b"id,\"name\n1,a\n", true, &Dialect::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Decode { row_number: None, .. }));
        assert!(err.to_string().contains("unterminated quoted field"));
    }

    #[tokio::test]
    async fn test_closed_quotes_across_small_buffers_stay_valid() -> Result<()> {
        let dialect = Dialect {
            buffer_capacity: 4,
            ..Dialect::default()
        };
        let input = b"id,note\n1,\"multi\nline, \"\"quoted\"\"\"\n2,5\"\n3,\"last\"";
        let rows = decode_all(input, true, &dialect).await?;
        assert_eq!(rows.len(), 4);
        assert_eq!(values(&rows[1]), vec!["1", "multi\nline, \"quoted\""]);
        assert_eq!(values(&rows[2]), vec!["2", "5\""]);
        assert_eq!(values(&rows[3]), vec!["3", "last"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_crlf_terminators() -> Result<()> {
        let rows = decode_all(b"id,name\r\n1,a\r\n", true, &Dialect::default()).await?;
        assert_eq!(values(&rows[1]), vec!["1", "a"]);
        Ok(())
    }
}
