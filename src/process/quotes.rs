use std::{
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    task::{ready, Context, Poll},
};
use tokio::io::{AsyncRead, ReadBuf};

use super::options::Dialect;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    RecordStart,
    Comment,
    FieldStart,
    Unquoted,
    Quoted,
    Escaped,
    QuoteInQuoted,
}

/// Follows field quoting over raw bytes with the same rules as the CSV engine:
/// a quote only opens a field at its first byte, and a quote inside a quoted
/// field closes it unless doubled.
#[derive(Debug, Clone)]
pub(crate) struct QuoteScanner {
    delimiter: u8,
    quote: u8,
    escape: Option<u8>,
    comment: Option<u8>,
    state: ScanState,
}

impl QuoteScanner {
    /// `dialect` must already be validated (ASCII only).
    pub(crate) fn new(dialect: &Dialect) -> Self {
        Self {
            delimiter: dialect.delimiter as u8,
            quote: dialect.quote as u8,
            escape: dialect.escape.map(|c| c as u8),
            comment: dialect.comment.map(|c| c as u8),
            state: ScanState::RecordStart,
        }
    }

    pub(crate) fn feed(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.state = self.next(b);
        }
    }

    /// Whether the bytes seen so far end inside a quoted field.
    pub(crate) fn in_quotes(&self) -> bool {
        matches!(self.state, ScanState::Quoted | ScanState::Escaped)
    }

    fn next(&self, b: u8) -> ScanState {
        use ScanState::*;
        match self.state {
            RecordStart if is_terminator(b) => RecordStart,
            RecordStart if self.comment == Some(b) => Comment,
            RecordStart | FieldStart => {
                if b == self.quote {
                    Quoted
                } else {
                    self.after_field_byte(b)
                }
            }
            Comment if b == b'\n' => RecordStart,
            Comment => Comment,
            // doubled quotes only apply when no escape character is set
            QuoteInQuoted if self.escape.is_none() && b == self.quote => Quoted,
            Unquoted | QuoteInQuoted => self.after_field_byte(b),
            Quoted if b == self.quote => QuoteInQuoted,
            Quoted if self.escape == Some(b) => Escaped,
            Quoted | Escaped => Quoted,
        }
    }

    fn after_field_byte(&self, b: u8) -> ScanState {
        if b == self.delimiter {
            ScanState::FieldStart
        } else if is_terminator(b) {
            ScanState::RecordStart
        } else {
            ScanState::Unquoted
        }
    }
}

fn is_terminator(b: u8) -> bool {
    b == b'\r' || b == b'\n'
}

/// What [`QuoteTracking`] has seen of the input, shared with the decoder.
#[derive(Debug, Default)]
pub(crate) struct ScanProgress {
    bytes: AtomicU64,
    eof: AtomicBool,
    open_quote: AtomicBool,
}

impl ScanProgress {
    /// True when the input is exhausted, ended inside a quoted field, and
    /// the engine has consumed all of it (`consumed` bytes).
    pub(crate) fn unterminated_at(&self, consumed: u64) -> bool {
        self.eof.load(Ordering::Relaxed)
            && self.open_quote.load(Ordering::Relaxed)
            && self.bytes.load(Ordering::Relaxed) == consumed
    }
}

/// Pass-through reader that runs a [`QuoteScanner`] over every byte read.
pub(crate) struct QuoteTracking<R> {
    inner: R,
    scanner: QuoteScanner,
    progress: Arc<ScanProgress>,
}

impl<R> QuoteTracking<R> {
    pub(crate) fn new(inner: R, dialect: &Dialect) -> (Self, Arc<ScanProgress>) {
        let progress = Arc::new(ScanProgress::default());
        let reader = Self {
            inner,
            scanner: QuoteScanner::new(dialect),
            progress: Arc::clone(&progress),
        };
        (reader, progress)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for QuoteTracking<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let had_room = buf.remaining() > 0;
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;

        let read = &buf.filled()[before..];
        if read.is_empty() {
            if had_room {
                this.progress.eof.store(true, Ordering::Relaxed);
            }
        } else {
            this.scanner.feed(read);
            this.progress
                .bytes
                .fetch_add(read.len() as u64, Ordering::Relaxed);
            this.progress
                .open_quote
                .store(this.scanner.in_quotes(), Ordering::Relaxed);
        }
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn ends_in_quotes(input: &[u8], dialect: &Dialect) -> bool {
        let mut scanner = QuoteScanner::new(dialect);
        scanner.feed(input);
        scanner.in_quotes()
    }

    #[test]
    fn test_scanner_quote_states() {
        let d = Dialect::default();
        assert!(!ends_in_quotes(b"id,name\n1,\"a\"\n", &d));
        assert!(ends_in_quotes(b"id,name\n1,\"a\n2,b\n", &d));
        // doubled quotes stay inside the field
        assert!(ends_in_quotes(b"1,\"say \"\"hi", &d));
        assert!(!ends_in_quotes(b"1,\"say \"\"hi\"\"\"\n", &d));
        // a quote after the first byte of a field is literal
        assert!(!ends_in_quotes(b"size\n5\"\n6\n", &d));
        // closed quote followed by more bytes, as the engine allows
        assert!(!ends_in_quotes(b"\"a\"b,c\n", &d));
    }

    #[test]
    fn test_scanner_escape_and_comment() {
        let d = Dialect {
            escape: Some('\\'),
            comment: Some('#'),
            ..Dialect::default()
        };
        assert!(!ends_in_quotes(b"# note \"quoted\nid\n\"a\\\"b\"\n", &d));
        assert!(ends_in_quotes(b"id\n\"a\\\"", &d));
        // with an escape character set, a second quote is literal text
        assert!(!ends_in_quotes(b"id\n\"a\"\"\n", &d));
    }

    #[tokio::test]
    async fn test_tracking_reports_open_quote_at_eof() -> anyhow::Result<()> {
        let input = b"id\n\"abc\n";
        let (mut reader, progress) = QuoteTracking::new(&input[..], &Dialect::default());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await?;

        assert_eq!(out, input);
        assert!(progress.unterminated_at(input.len() as u64));
        assert!(!progress.unterminated_at(3));
        Ok(())
    }

    #[tokio::test]
    async fn test_tracking_closed_input() -> anyhow::Result<()> {
        let input = b"id\n\"abc\"\n";
        let (mut reader, progress) = QuoteTracking::new(&input[..], &Dialect::default());
        reader.read_to_end(&mut Vec::new()).await?;
        assert!(!progress.unterminated_at(input.len() as u64));
        Ok(())
    }
}
