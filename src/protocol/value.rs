//! Lazy RESP Value Cursor
//!
//! A [`Value`] wraps a byte stream positioned at the start of a RESP value.
//! The kind can be probed as many times as the caller wishes, but the value
//! itself may be extracted only once; a successful extraction resets the
//! cursor so the stream position, not the `Value` object, decides what comes
//! next. This is what lets one long-lived `Value` serve as the reply cursor
//! for an entire connection.
//!
//! ## Kind probing
//!
//! [`Value::kind`] reads exactly one framing byte, and for `$`/`*` headers
//! also the decimal length line. The classification is cached, so repeated
//! probes are free until the next extraction. A declared length of `-1`
//! classifies as [`Kind::Null`] with nothing further consumed.
//!
//! ## Alignment
//!
//! The stream handle carries a skip debt: bytes that must be drained before
//! the next header read. Bulk string extraction charges the payload plus its
//! trailing CRLF to the debt, and the bounded reader repays it as the
//! consumer reads. Whatever is left over — an abandoned reader included —
//! is drained on the next probe, so a sloppy consumer cannot shift the
//! frame for whoever reads next.

use std::fmt;
use std::future::Future;
use std::io::{self, Cursor};
use std::pin::Pin;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};

use crate::protocol::array::{self, ArrayHandle, ArrayStream};
use crate::protocol::forward::BulkReader;
use crate::protocol::prefix;

/// A type-erased handle to the underlying byte stream.
pub type ByteStream = Box<dyn AsyncBufRead + Send + Sync + Unpin>;

/// The RESP kind of a value, or `Unknown`/`Invalid` when no kind applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// No classification yet, or the stream ended cleanly before one.
    Unknown,
    /// The stream produced an unrecognized framing byte or a read error.
    Invalid,
    /// `+OK` style responses.
    SimpleString,
    /// `-ERR ...` responses.
    Error,
    /// `:123` responses.
    Integer,
    /// `$<len>` length-prefixed binary-safe strings.
    BulkString,
    /// `*<len>` sequences of further values.
    Array,
    /// `$-1` or `*-1`.
    Null,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::SimpleString => "simple string",
            Kind::Error => "error",
            Kind::Integer => "integer",
            Kind::BulkString => "bulk string",
            Kind::Array => "array",
            Kind::Null => "null",
            Kind::Unknown => "unknown",
            Kind::Invalid => "invalid",
        };
        f.write_str(name)
    }
}

/// Errors produced while decoding RESP values.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The caller asked for one kind but the value is another. The stream is
    /// untouched; the accessor matching the actual kind may still be called.
    #[error("requested {requested} but value is {actual}")]
    WrongKind { requested: Kind, actual: Kind },

    /// An integer field failed to parse as a signed 64-bit decimal.
    #[error("invalid integer: {0:?}")]
    InvalidInteger(String),

    /// Framing violation (bad prefix, malformed length, missing CRLF, ...).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The stream ended in the middle of a value.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// I/O error from the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// The owned stream handle threaded through every decode step.
///
/// Exactly one of these exists per connection-side stream. It moves into an
/// array producer task while an array is being decoded and is handed back
/// through a oneshot channel when the producer finishes.
pub(crate) struct Source {
    pub(crate) stream: ByteStream,
    /// Bytes still owed to the stream before the next header read.
    pub(crate) debt: u64,
}

impl Source {
    pub(crate) fn new(stream: ByteStream) -> Self {
        Source { stream, debt: 0 }
    }

    /// A source backed by an in-memory buffer, used for elements an array
    /// producer has already pulled off the shared stream.
    pub(crate) fn from_buffer(buf: Vec<u8>) -> Self {
        Source::new(Box::new(Cursor::new(buf)))
    }

    /// Drains the skip debt so the stream sits at a value boundary.
    pub(crate) async fn settle(&mut self) -> io::Result<()> {
        while self.debt > 0 {
            let chunk = self.stream.fill_buf().await?;
            if chunk.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended while draining bulk string remainder",
                ));
            }
            let n = chunk.len().min(self.debt as usize);
            self.stream.consume(n);
            self.debt -= n as u64;
        }
        Ok(())
    }

    /// Reads one byte, or `None` on a clean end of stream.
    pub(crate) async fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let byte = {
            let chunk = self.stream.fill_buf().await?;
            match chunk.first() {
                Some(&b) => b,
                None => return Ok(None),
            }
        };
        self.stream.consume(1);
        Ok(Some(byte))
    }

    /// Reads up to and including CRLF, returning the line without it.
    pub(crate) async fn read_line(&mut self, buf: &mut Vec<u8>) -> Result<(), DecodeError> {
        buf.clear();
        let n = self.stream.read_until(b'\n', buf).await?;
        if n == 0 {
            return Err(DecodeError::UnexpectedEof);
        }
        if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
            return Err(DecodeError::Protocol(
                "line not terminated by CRLF".to_string(),
            ));
        }
        buf.truncate(buf.len() - 2);
        Ok(())
    }

    /// Reads the CRLF-terminated decimal length that follows `$` and `*`.
    pub(crate) async fn read_length(&mut self) -> Result<i64, DecodeError> {
        let mut line = Vec::new();
        self.read_line(&mut line).await?;
        let text = std::str::from_utf8(&line)
            .map_err(|_| DecodeError::Protocol("length header is not ASCII".to_string()))?;
        text.parse::<i64>()
            .map_err(|_| DecodeError::Protocol(format!("malformed length header: {text:?}")))
    }
}

/// One RESP value read lazily from a byte stream.
///
/// The kind may be probed repeatedly via [`Value::kind`]; each typed
/// accessor succeeds at most once and resets the classification so the next
/// probe reads the now-advanced stream.
pub struct Value {
    source: Option<Source>,
    /// Hands the stream back once an array producer task finishes with it.
    reclaim: Option<oneshot::Receiver<Source>>,
    /// An array whose undelivered elements must be flushed before the
    /// stream can be probed again.
    pending: Option<ArrayHandle>,
    /// For array elements produced off the shared stream: the element's own
    /// already-decoded contents.
    content: Option<ArrayHandle>,
    kind: Kind,
    length: i64,
}

impl Value {
    /// Creates a value cursor over the given stream.
    pub fn new<S>(stream: S) -> Value
    where
        S: AsyncBufRead + Send + Sync + Unpin + 'static,
    {
        Value::from_source(Source::new(Box::new(stream)))
    }

    pub(crate) fn from_source(source: Source) -> Value {
        Value {
            source: Some(source),
            reclaim: None,
            pending: None,
            content: None,
            kind: Kind::Unknown,
            length: 0,
        }
    }

    /// A cursor with no backing stream; every probe reports `Invalid`.
    pub(crate) fn detached() -> Value {
        Value {
            source: None,
            reclaim: None,
            pending: None,
            content: None,
            kind: Kind::Unknown,
            length: 0,
        }
    }

    /// An element whose payload already lives in memory.
    pub(crate) fn materialized(kind: Kind, length: i64, payload: Vec<u8>) -> Value {
        Value {
            source: Some(Source::from_buffer(payload)),
            reclaim: None,
            pending: None,
            content: None,
            kind,
            length,
        }
    }

    pub(crate) fn null_value() -> Value {
        Value {
            source: None,
            reclaim: None,
            pending: None,
            content: None,
            kind: Kind::Null,
            length: -1,
        }
    }

    pub(crate) fn invalid() -> Value {
        Value {
            source: None,
            reclaim: None,
            pending: None,
            content: None,
            kind: Kind::Invalid,
            length: 0,
        }
    }

    /// An array element whose own elements were decoded ahead of time.
    pub(crate) fn deferred(length: usize, content: ArrayHandle) -> Value {
        Value {
            source: None,
            reclaim: None,
            pending: None,
            content: Some(content),
            kind: Kind::Array,
            length: length as i64,
        }
    }

    /// Determines the RESP kind of this value.
    ///
    /// The first probe reads one framing byte (plus the length line for `$`
    /// and `*`); later probes return the cached classification until an
    /// accessor extracts the value. If an array from this cursor is still
    /// being decoded, its remaining elements are flushed into the array's
    /// ordered cache first so the stream can move on.
    ///
    /// A clean end of stream before any byte reports [`Kind::Unknown`]; any
    /// other read failure or an unrecognized framing byte reports
    /// [`Kind::Invalid`].
    pub async fn kind(&mut self) -> Kind {
        if let Some(pending) = self.pending.take() {
            pending.flush().await;
        }
        if let Some(reclaim) = self.reclaim.take() {
            match reclaim.await {
                Ok(source) => self.source = Some(source),
                Err(_) => {
                    // Producer died mid-array; the stream is gone with it.
                    self.kind = Kind::Invalid;
                    return self.kind;
                }
            }
        }
        if self.kind != Kind::Unknown {
            return self.kind;
        }
        let Some(source) = self.source.as_mut() else {
            self.kind = Kind::Invalid;
            return self.kind;
        };
        if source.settle().await.is_err() {
            self.kind = Kind::Invalid;
            return self.kind;
        }
        let byte = match source.read_byte().await {
            Ok(Some(byte)) => byte,
            Ok(None) => return Kind::Unknown,
            Err(_) => {
                self.kind = Kind::Invalid;
                return self.kind;
            }
        };
        self.kind = match byte {
            prefix::SIMPLE_STRING => Kind::SimpleString,
            prefix::ERROR => Kind::Error,
            prefix::INTEGER => Kind::Integer,
            prefix::BULK_STRING | prefix::ARRAY => match source.read_length().await {
                Ok(-1) => {
                    self.length = -1;
                    Kind::Null
                }
                Ok(len) if len >= 0 => {
                    self.length = len;
                    if byte == prefix::BULK_STRING {
                        Kind::BulkString
                    } else {
                        Kind::Array
                    }
                }
                _ => Kind::Invalid,
            },
            _ => Kind::Invalid,
        };
        self.kind
    }

    async fn expect(&mut self, requested: Kind) -> Result<(), DecodeError> {
        let actual = self.kind().await;
        if actual != requested {
            return Err(DecodeError::WrongKind { requested, actual });
        }
        Ok(())
    }

    fn source_mut(&mut self) -> Result<&mut Source, DecodeError> {
        self.source
            .as_mut()
            .ok_or_else(|| DecodeError::Protocol("value has no backing stream".to_string()))
    }

    /// Extracts a simple string value.
    pub async fn simple_string(&mut self) -> Result<String, DecodeError> {
        self.expect(Kind::SimpleString).await?;
        self.kind = Kind::Unknown;
        let source = self.source_mut()?;
        let mut line = Vec::new();
        source.read_line(&mut line).await?;
        String::from_utf8(line)
            .map_err(|e| DecodeError::Protocol(format!("invalid UTF-8 in simple string: {e}")))
    }

    /// Extracts an error value's message text.
    pub async fn error_message(&mut self) -> Result<String, DecodeError> {
        self.expect(Kind::Error).await?;
        self.kind = Kind::Unknown;
        let source = self.source_mut()?;
        let mut line = Vec::new();
        source.read_line(&mut line).await?;
        String::from_utf8(line)
            .map_err(|e| DecodeError::Protocol(format!("invalid UTF-8 in error: {e}")))
    }

    /// Extracts an integer value.
    pub async fn integer(&mut self) -> Result<i64, DecodeError> {
        self.expect(Kind::Integer).await?;
        self.kind = Kind::Unknown;
        let source = self.source_mut()?;
        let mut line = Vec::new();
        source.read_line(&mut line).await?;
        let text = std::str::from_utf8(&line)
            .map_err(|_| DecodeError::InvalidInteger(String::from_utf8_lossy(&line).into_owned()))?;
        text.parse::<i64>()
            .map_err(|_| DecodeError::InvalidInteger(text.to_string()))
    }

    /// Acknowledges a null value so the cursor can move to the next one.
    pub async fn take_null(&mut self) -> Result<(), DecodeError> {
        self.expect(Kind::Null).await?;
        self.kind = Kind::Unknown;
        Ok(())
    }

    /// Extracts a bulk string as a bounded reader.
    ///
    /// The reader yields exactly the declared payload length. The trailing
    /// CRLF — and any payload the consumer abandons — is drained from the
    /// stream automatically on the next [`Value::kind`] probe.
    pub async fn bulk_reader(&mut self) -> Result<BulkReader<'_>, DecodeError> {
        self.expect(Kind::BulkString).await?;
        let length = self.length as u64;
        self.kind = Kind::Unknown;
        let source = self.source_mut()?;
        source.debt = length + 2;
        Ok(BulkReader::new(source, length))
    }

    /// Extracts a bulk string fully into memory.
    pub async fn bulk_bytes(&mut self) -> Result<bytes::Bytes, DecodeError> {
        let mut reader = self.bulk_reader().await?;
        let mut buf = Vec::with_capacity(reader.remaining() as usize);
        reader.read_to_end(&mut buf).await?;
        Ok(bytes::Bytes::from(buf))
    }

    /// Extracts an array as a stream of successive element values.
    ///
    /// A background task decodes elements in declaration order and publishes
    /// them one at a time onto a bounded queue; the stream handle returns to
    /// this cursor once the last element has been produced.
    pub async fn array(&mut self) -> Result<ArrayStream, DecodeError> {
        self.expect(Kind::Array).await?;
        let count = self.length as usize;
        self.kind = Kind::Unknown;
        if let Some(content) = self.content.take() {
            return Ok(ArrayStream::new(count, content));
        }
        let source = self
            .source
            .take()
            .ok_or_else(|| DecodeError::Protocol("array has no backing stream".to_string()))?;
        let (tx, rx) = mpsc::channel(1);
        let (done_tx, done_rx) = oneshot::channel();
        let handle = ArrayHandle::with_queue(rx);
        self.pending = Some(handle.clone());
        self.reclaim = Some(done_rx);
        array::spawn_producer(source, count, tx, done_tx);
        Ok(ArrayStream::new(count, handle))
    }

    /// Renders the value for human eyes, consuming it (recursively for
    /// arrays). A diagnostic facility, not a protocol one.
    pub fn render(&mut self) -> Pin<Box<dyn Future<Output = String> + Send + '_>> {
        Box::pin(async move {
            match self.kind().await {
                Kind::SimpleString => match self.simple_string().await {
                    Ok(s) => format!("\"{s}\""),
                    Err(err) => err.to_string(),
                },
                Kind::Error => match self.error_message().await {
                    Ok(s) => format!("(error) {s}"),
                    Err(err) => err.to_string(),
                },
                Kind::Integer => match self.integer().await {
                    Ok(i) => format!("(integer) {i}"),
                    Err(err) => err.to_string(),
                },
                Kind::BulkString => match self.bulk_bytes().await {
                    Ok(payload) => match std::str::from_utf8(&payload) {
                        Ok(s) => format!("\"{s}\""),
                        Err(_) => format!("(binary data, {} bytes)", payload.len()),
                    },
                    Err(err) => err.to_string(),
                },
                Kind::Array => match self.array().await {
                    Ok(mut array) => array.render().await,
                    Err(err) => err.to_string(),
                },
                Kind::Null => {
                    let _ = self.take_null().await;
                    "(nil)".to_string()
                }
                Kind::Unknown | Kind::Invalid => "(invalid)".to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{AsyncWriteExt, BufReader};

    fn value(bytes: &[u8]) -> Value {
        Value::new(Cursor::new(bytes.to_vec()))
    }

    #[tokio::test]
    async fn classifies_and_reads_simple_string() {
        let mut v = value(b"+OK\r\n");
        assert_eq!(v.kind().await, Kind::SimpleString);
        assert_eq!(v.simple_string().await.unwrap(), "OK");
    }

    #[tokio::test]
    async fn kind_probe_is_idempotent() {
        let mut v = value(b"+i'm a simple string\r\n");
        assert_eq!(v.kind().await, Kind::SimpleString);
        assert_eq!(v.kind().await, Kind::SimpleString);
        assert_eq!(v.simple_string().await.unwrap(), "i'm a simple string");
    }

    #[tokio::test]
    async fn reads_error_text() {
        let mut v = value(b"-i'm an error\r\n");
        assert_eq!(v.kind().await, Kind::Error);
        assert_eq!(v.error_message().await.unwrap(), "i'm an error");
    }

    #[tokio::test]
    async fn reads_integers() {
        let mut v = value(b":42\r\n");
        assert_eq!(v.kind().await, Kind::Integer);
        assert_eq!(v.integer().await.unwrap(), 42);

        let mut v = value(b":-42\r\n");
        assert_eq!(v.integer().await.unwrap(), -42);
    }

    #[tokio::test]
    async fn rejects_malformed_integer() {
        let mut v = value(b":not_a_number\r\n");
        assert!(matches!(
            v.integer().await,
            Err(DecodeError::InvalidInteger(_))
        ));
    }

    #[tokio::test]
    async fn reads_bulk_string_via_reader() {
        let mut v = value(b"$17\r\ni'm a bulk string\r\n");
        assert_eq!(v.kind().await, Kind::BulkString);
        let mut reader = v.bulk_reader().await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"i'm a bulk string");
    }

    #[tokio::test]
    async fn null_bulk_and_null_array_classify_as_null() {
        let mut v = value(b"$-1\r\n");
        assert_eq!(v.kind().await, Kind::Null);

        let mut v = value(b"*-1\r\n");
        assert_eq!(v.kind().await, Kind::Null);
    }

    #[tokio::test]
    async fn null_consumes_only_its_header() {
        let mut v = value(b"$-1\r\n+OK\r\n");
        assert_eq!(v.kind().await, Kind::Null);
        v.take_null().await.unwrap();
        assert_eq!(v.kind().await, Kind::SimpleString);
        assert_eq!(v.simple_string().await.unwrap(), "OK");
    }

    #[tokio::test]
    async fn wrong_accessor_leaves_value_readable() {
        let mut v = value(b"+OK\r\n");
        match v.integer().await {
            Err(DecodeError::WrongKind { requested, actual }) => {
                assert_eq!(requested, Kind::Integer);
                assert_eq!(actual, Kind::SimpleString);
            }
            other => panic!("expected wrong-kind error, got {other:?}"),
        }
        assert_eq!(v.simple_string().await.unwrap(), "OK");
    }

    #[tokio::test]
    async fn successive_values_share_one_cursor() {
        let mut v = value(b"+one\r\n:2\r\n$5\r\nthree\r\n");
        assert_eq!(v.simple_string().await.unwrap(), "one");
        assert_eq!(v.integer().await.unwrap(), 2);
        let payload = v.bulk_bytes().await.unwrap();
        assert_eq!(&payload[..], b"three");
        assert_eq!(v.kind().await, Kind::Unknown);
    }

    #[tokio::test]
    async fn exhausted_bulk_reader_leaves_stream_aligned() {
        let mut v = value(b"$5\r\nhello\r\n+OK\r\n");
        let mut reader = v.bulk_reader().await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
        assert_eq!(v.kind().await, Kind::SimpleString);
        assert_eq!(v.simple_string().await.unwrap(), "OK");
    }

    #[tokio::test]
    async fn empty_bulk_string_aligns_too() {
        let mut v = value(b"$0\r\n\r\n:7\r\n");
        let payload = v.bulk_bytes().await.unwrap();
        assert!(payload.is_empty());
        assert_eq!(v.integer().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn abandoned_bulk_reader_is_drained_on_next_probe() {
        let mut v = value(b"$5\r\nhello\r\n+OK\r\n");
        {
            let mut reader = v.bulk_reader().await.unwrap();
            let mut two = [0u8; 2];
            reader.read_exact(&mut two).await.unwrap();
            assert_eq!(&two, b"he");
            // reader dropped with three payload bytes and the CRLF unread
        }
        assert_eq!(v.kind().await, Kind::SimpleString);
        assert_eq!(v.simple_string().await.unwrap(), "OK");
    }

    #[tokio::test]
    async fn unrecognized_prefix_is_invalid() {
        let mut v = value(b"@nope\r\n");
        assert_eq!(v.kind().await, Kind::Invalid);
        assert_eq!(v.kind().await, Kind::Invalid);
    }

    #[tokio::test]
    async fn clean_end_of_stream_is_unknown() {
        let mut v = value(b"");
        assert_eq!(v.kind().await, Kind::Unknown);
    }

    #[tokio::test]
    async fn truncated_bulk_payload_errors() {
        // Header promises five bytes, stream ends after two.
        let mut v = value(b"$5\r\nhe");
        let mut reader = v.bulk_reader().await.unwrap();
        let mut buf = Vec::new();
        assert!(reader.read_to_end(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn decodes_across_fragmented_reads() {
        // The transport hands bytes over in arbitrary chunks.
        let (client, mut server) = tokio::io::duplex(8);
        let writer = tokio::spawn(async move {
            for chunk in [&b"+O"[..], b"K\r", b"\n:12", b"3\r\n"] {
                server.write_all(chunk).await.unwrap();
                server.flush().await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let mut v = Value::new(BufReader::new(client));
        assert_eq!(v.simple_string().await.unwrap(), "OK");
        assert_eq!(v.integer().await.unwrap(), 123);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn renders_scalars() {
        assert_eq!(value(b"+OK\r\n").render().await, "\"OK\"");
        assert_eq!(value(b":5\r\n").render().await, "(integer) 5");
        assert_eq!(value(b"$-1\r\n").render().await, "(nil)");
        assert_eq!(value(b"-ERR no\r\n").render().await, "(error) ERR no");
    }

    #[tokio::test]
    async fn render_consumes_so_the_next_value_is_reachable() {
        let mut v = value(b"*2\r\n:1\r\n:2\r\n+after\r\n");
        assert_eq!(v.render().await, "[(integer) 1,(integer) 2]");
        assert_eq!(v.simple_string().await.unwrap(), "after");
    }
}
