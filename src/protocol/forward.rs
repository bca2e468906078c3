//! Bounded Byte Forwarder
//!
//! A bulk string's payload is followed on the wire by a CRLF that belongs to
//! the framing, not to the consumer. [`BulkReader`] exposes exactly the
//! declared payload length; the bytes it hands out are deducted from the
//! stream handle's skip debt, so whatever the consumer leaves behind —
//! including the trailing CRLF — is drained before the next value's header
//! is read. The consumer never skips the delimiter manually.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncBufRead, AsyncRead, ReadBuf};

use crate::protocol::value::Source;

/// An `AsyncRead` bounded to one bulk string payload.
///
/// Reading past the declared length yields end-of-stream; the underlying
/// stream is left for the owning cursor to realign.
pub struct BulkReader<'a> {
    source: &'a mut Source,
    remaining: u64,
}

impl<'a> BulkReader<'a> {
    pub(crate) fn new(source: &'a mut Source, length: u64) -> Self {
        BulkReader { source, remaining: length }
    }

    /// Payload bytes not yet read.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl AsyncRead for BulkReader<'_> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        if me.remaining == 0 || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let chunk = ready!(Pin::new(&mut me.source.stream).poll_fill_buf(cx))?;
        if chunk.is_empty() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside bulk string payload",
            )));
        }
        let n = chunk
            .len()
            .min(buf.remaining())
            .min(me.remaining as usize);
        buf.put_slice(&chunk[..n]);
        Pin::new(&mut me.source.stream).consume(n);
        me.remaining -= n as u64;
        me.source.debt = me.source.debt.saturating_sub(n as u64);
        Poll::Ready(Ok(()))
    }
}
