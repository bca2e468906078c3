//! Array Streams
//!
//! An array reply shares its byte stream with every one of its elements, so
//! the elements cannot be handed out as live cursors: whoever read element
//! three would race whoever was still holding element one. Instead a
//! background producer task owns the stream for the duration of the array
//! and re-homes each element onto its own in-memory buffer before
//! publishing it, in declaration order, onto a bounded queue.
//!
//! The consumer side is [`ArrayStream`]. If the parent cursor is probed
//! again while elements remain undelivered, everything left on the queue is
//! pulled into an ordered cache first — elements stay readable, in order,
//! after the connection has moved on to the next reply.
//!
//! Nested arrays are decoded depth-first into their own cache before any
//! later sibling is touched, so two arrays never interleave reads on the
//! one stream.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{trace, warn};

use crate::protocol::value::{Kind, Source, Value};
use crate::protocol::{prefix, DecodeError, CRLF};

/// Shared element store: the producer queue plus the ordered flush cache.
///
/// Cloned between the consumer-facing [`ArrayStream`] and the parent cursor
/// (which flushes through it when it needs the stream back).
#[derive(Clone)]
pub(crate) struct ArrayHandle {
    inner: Arc<Mutex<ArrayInner>>,
}

struct ArrayInner {
    /// Live producer queue; `None` once drained or for arrays that were
    /// decoded ahead of time.
    queue: Option<mpsc::Receiver<Value>>,
    /// Elements pulled off the queue before the consumer asked for them.
    cached: VecDeque<Value>,
}

impl ArrayHandle {
    pub(crate) fn with_queue(queue: mpsc::Receiver<Value>) -> Self {
        ArrayHandle {
            inner: Arc::new(Mutex::new(ArrayInner {
                queue: Some(queue),
                cached: VecDeque::new(),
            })),
        }
    }

    pub(crate) fn with_cache() -> Self {
        ArrayHandle {
            inner: Arc::new(Mutex::new(ArrayInner {
                queue: None,
                cached: VecDeque::new(),
            })),
        }
    }

    pub(crate) async fn push_cached(&self, value: Value) {
        self.inner.lock().await.cached.push_back(value);
    }

    /// Next element in declaration order: cache first, then the queue.
    pub(crate) async fn next(&self) -> Option<Value> {
        let mut inner = self.inner.lock().await;
        if let Some(value) = inner.cached.pop_front() {
            return Some(value);
        }
        let value = match inner.queue.as_mut() {
            Some(queue) => queue.recv().await,
            None => None,
        };
        if value.is_none() {
            inner.queue = None;
        }
        value
    }

    /// Pulls every undelivered element into the ordered cache, blocking
    /// until the producer has published them all. Afterwards the producer
    /// has released the stream and the parent may read past the array.
    pub(crate) fn flush(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            loop {
                let received = match inner.queue.as_mut() {
                    Some(queue) => queue.recv().await,
                    None => break,
                };
                match received {
                    Some(value) => inner.cached.push_back(value),
                    None => break,
                }
            }
            inner.queue = None;
        })
    }
}

/// A decoded RESP array in progress.
///
/// Elements arrive in declaration order, each one self-contained: extracting
/// one element never disturbs another.
pub struct ArrayStream {
    len: usize,
    handle: ArrayHandle,
}

impl ArrayStream {
    pub(crate) fn new(len: usize, handle: ArrayHandle) -> Self {
        ArrayStream { len, handle }
    }

    /// The declared element count, fixed at the array header.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the next element, or `None` once all declared elements have
    /// been delivered.
    pub async fn next(&mut self) -> Option<Value> {
        self.handle.next().await
    }

    /// Renders all remaining elements, consuming them.
    pub async fn render(&mut self) -> String {
        let mut out = String::from("[");
        let mut first = true;
        while let Some(mut element) = self.next().await {
            if !first {
                out.push(',');
            }
            first = false;
            out.push_str(&element.render().await);
        }
        out.push(']');
        out
    }
}

/// Starts the background task that decodes `count` elements off `source`.
pub(crate) fn spawn_producer(
    source: Source,
    count: usize,
    tx: mpsc::Sender<Value>,
    done: oneshot::Sender<Source>,
) {
    tokio::spawn(produce(source, count, tx, done));
}

async fn produce(
    mut source: Source,
    count: usize,
    tx: mpsc::Sender<Value>,
    done: oneshot::Sender<Source>,
) {
    for index in 0..count {
        let element = match materialize(&mut source).await {
            Ok(element) => element,
            Err(err) => {
                warn!(element = index, total = count, error = %err, "array element decode failed");
                // The stream is misaligned; dropping `done` marks the
                // parent cursor invalid.
                let _ = tx.send(Value::invalid()).await;
                return;
            }
        };
        if tx.send(element).await.is_err() {
            // Every receiver is gone; nothing left to deliver to, and the
            // stream goes down with the dropped parent.
            trace!(element = index, total = count, "array consumer went away");
            return;
        }
    }
    let _ = done.send(source);
}

/// Decodes the next value off the shared stream into a self-contained
/// element that re-reads from its own buffer.
fn materialize(
    source: &mut Source,
) -> Pin<Box<dyn Future<Output = Result<Value, DecodeError>> + Send + '_>> {
    Box::pin(async move {
        let byte = source
            .read_byte()
            .await?
            .ok_or(DecodeError::UnexpectedEof)?;
        match byte {
            prefix::SIMPLE_STRING | prefix::ERROR | prefix::INTEGER => {
                let mut line = Vec::new();
                source.read_line(&mut line).await?;
                line.extend_from_slice(CRLF);
                let kind = match byte {
                    prefix::SIMPLE_STRING => Kind::SimpleString,
                    prefix::ERROR => Kind::Error,
                    _ => Kind::Integer,
                };
                Ok(Value::materialized(kind, -1, line))
            }
            prefix::BULK_STRING => {
                let length = source.read_length().await?;
                if length == -1 {
                    return Ok(Value::null_value());
                }
                if length < 0 {
                    return Err(DecodeError::Protocol(format!(
                        "negative bulk string length {length}"
                    )));
                }
                let length = length as usize;
                let mut payload = vec![0u8; length + 2];
                source.stream.read_exact(&mut payload).await?;
                if &payload[length..] != CRLF {
                    return Err(DecodeError::Protocol(
                        "bulk string missing trailing CRLF".to_string(),
                    ));
                }
                Ok(Value::materialized(Kind::BulkString, length as i64, payload))
            }
            prefix::ARRAY => {
                let length = source.read_length().await?;
                if length == -1 {
                    return Ok(Value::null_value());
                }
                if length < 0 {
                    return Err(DecodeError::Protocol(format!(
                        "negative array length {length}"
                    )));
                }
                // Depth-first: the nested array's bytes precede every later
                // sibling on the stream.
                let content = ArrayHandle::with_cache();
                for _ in 0..length {
                    let element = materialize(source).await?;
                    content.push_cached(element).await;
                }
                Ok(Value::deferred(length as usize, content))
            }
            other => Err(DecodeError::Protocol(format!(
                "unknown type prefix: {other:#04x}"
            ))),
        }
    })
}

#[cfg(test)]
mod tests {
    use crate::protocol::{Kind, Value};
    use std::io::Cursor;
    use tokio::io::AsyncReadExt;

    fn value(bytes: &[u8]) -> Value {
        Value::new(Cursor::new(bytes.to_vec()))
    }

    #[tokio::test]
    async fn single_element_array() {
        let mut v = value(b"*1\r\n+foo\r\n");
        assert_eq!(v.kind().await, Kind::Array);
        let mut array = v.array().await.unwrap();
        assert_eq!(array.len(), 1);

        let mut first = array.next().await.unwrap();
        assert_eq!(first.kind().await, Kind::SimpleString);
        assert_eq!(first.simple_string().await.unwrap(), "foo");
        assert!(array.next().await.is_none());
    }

    #[tokio::test]
    async fn mixed_array_in_declaration_order() {
        let mut v = value(b"*2\r\n+simple\r\n$17\r\ni'm a bulk string\r\n");
        let mut array = v.array().await.unwrap();
        assert_eq!(array.len(), 2);

        let mut first = array.next().await.unwrap();
        assert_eq!(first.simple_string().await.unwrap(), "simple");

        let mut second = array.next().await.unwrap();
        assert_eq!(second.kind().await, Kind::BulkString);
        let mut reader = second.bulk_reader().await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"i'm a bulk string");
    }

    #[tokio::test]
    async fn elements_stay_readable_out_of_consumption_order() {
        let mut v = value(b"*2\r\n$3\r\nfoo\r\n$17\r\ni'm a bulk string\r\n");
        let mut array = v.array().await.unwrap();

        let mut first = array.next().await.unwrap();
        let mut second = array.next().await.unwrap();

        // Consume the second element before touching the first.
        let payload = second.bulk_bytes().await.unwrap();
        assert_eq!(&payload[..], b"i'm a bulk string");

        assert_eq!(first.kind().await, Kind::BulkString);
        let payload = first.bulk_bytes().await.unwrap();
        assert_eq!(&payload[..], b"foo");
    }

    #[tokio::test]
    async fn nested_arrays_do_not_interleave() {
        let mut v = value(b"*2\r\n:1\r\n*2\r\n:2\r\n:3\r\n");
        let mut outer = v.array().await.unwrap();

        let mut first = outer.next().await.unwrap();
        assert_eq!(first.integer().await.unwrap(), 1);

        let mut second = outer.next().await.unwrap();
        assert_eq!(second.kind().await, Kind::Array);
        let mut inner = second.array().await.unwrap();
        assert_eq!(inner.len(), 2);
        assert_eq!(inner.next().await.unwrap().integer().await.unwrap(), 2);
        assert_eq!(inner.next().await.unwrap().integer().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn empty_array_releases_the_stream_immediately() {
        let mut v = value(b"*0\r\n+after\r\n");
        let mut array = v.array().await.unwrap();
        assert_eq!(array.len(), 0);
        assert!(array.next().await.is_none());
        assert_eq!(v.simple_string().await.unwrap(), "after");
    }

    #[tokio::test]
    async fn probing_the_parent_flushes_remaining_elements() {
        let mut v = value(b"*2\r\n:1\r\n:2\r\n+after\r\n");
        let mut array = v.array().await.unwrap();

        // Move to the next reply before reading any element.
        assert_eq!(v.kind().await, Kind::SimpleString);
        assert_eq!(v.simple_string().await.unwrap(), "after");

        // The flushed elements replay from the cache, still in order.
        assert_eq!(array.next().await.unwrap().integer().await.unwrap(), 1);
        assert_eq!(array.next().await.unwrap().integer().await.unwrap(), 2);
        assert!(array.next().await.is_none());
    }

    #[tokio::test]
    async fn fully_consumed_array_hands_the_stream_back() {
        let mut v = value(b"*1\r\n:9\r\n:10\r\n");
        let mut array = v.array().await.unwrap();
        assert_eq!(array.next().await.unwrap().integer().await.unwrap(), 9);
        assert_eq!(v.integer().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn null_elements_inside_arrays() {
        let mut v = value(b"*3\r\n$-1\r\n:1\r\n*-1\r\n");
        let mut array = v.array().await.unwrap();
        let mut first = array.next().await.unwrap();
        assert_eq!(first.kind().await, Kind::Null);
        assert_eq!(array.next().await.unwrap().integer().await.unwrap(), 1);
        let mut third = array.next().await.unwrap();
        assert_eq!(third.kind().await, Kind::Null);
    }

    #[tokio::test]
    async fn truncated_array_marks_the_parent_invalid() {
        let mut v = value(b"*2\r\n:1\r\n");
        let mut array = v.array().await.unwrap();
        assert_eq!(array.next().await.unwrap().integer().await.unwrap(), 1);
        let mut bad = array.next().await.unwrap();
        assert_eq!(bad.kind().await, Kind::Invalid);
        assert_eq!(v.kind().await, Kind::Invalid);
    }
}
