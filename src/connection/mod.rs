//! Client Connections
//!
//! A [`Conn`] owns one transport stream to a server and keeps its two
//! directions strictly disciplined:
//!
//! - **Write path**: commands are encoded through a [`Pipe`], a write-side
//!   cursor that holds the connection's encode lock. Only one pipe can be
//!   open at a time; a second [`Conn::command`] call blocks until the first
//!   pipe closes, so frames from concurrent tasks never interleave on the
//!   wire.
//! - **Read path**: replies are read through a single long-lived
//!   [`Value`](crate::protocol::Value) cursor returned by [`Conn::resp`].
//!
//! The two paths run concurrently with each other — pipelining more
//! commands while earlier replies are still being read is the point.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! dial / pool ──> Conn ──┬── command()/raw_cmd() ──> server
//!                        │
//!                        └── resp() <── server
//!
//! close(): back to the pool it came from, or destroyed
//! destroy(): transport shut down unconditionally
//! ```

pub mod pool;

use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::protocol::{DecodeError, Kind, Value};

type WriteStream = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// Transport family a connection dials over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    #[cfg(unix)]
    Unix,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => f.write_str("tcp"),
            #[cfg(unix)]
            Network::Unix => f.write_str("unix"),
        }
    }
}

impl FromStr for Network {
    type Err = ConnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Network::Tcp),
            #[cfg(unix)]
            "unix" => Ok(Network::Unix),
            other => Err(ConnError::UnknownNetwork(other.to_string())),
        }
    }
}

/// Errors from connection management and command transport.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Dialing did not complete within the configured timeout
    #[error("connect timed out")]
    ConnectTimeout,

    /// The server rejected the configured credential
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// A reply could not be decoded
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The server answered with a kind the operation cannot handle
    #[error("unexpected {0} reply")]
    UnexpectedReply(Kind),

    /// Unrecognized network family name
    #[error("unknown network type: {0:?}")]
    UnknownNetwork(String),
}

/// An open connection to a server.
pub struct Conn {
    writer: Mutex<BufWriter<WriteStream>>,
    reply: Value,
    whence: Option<Arc<pool::PoolInner>>,
    open_commands: AtomicI64,
    destroyed: AtomicBool,
}

impl Conn {
    /// Connects to the server at `addr` over the given network.
    pub async fn dial(network: Network, addr: &str) -> Result<Conn, ConnError> {
        match network {
            Network::Tcp => {
                let stream = TcpStream::connect(addr).await?;
                // Small command frames should not wait on Nagle.
                stream.set_nodelay(true)?;
                let (read, write) = stream.into_split();
                trace!(%network, addr, "connected");
                Ok(Conn::from_halves(Box::new(read), Box::new(write)))
            }
            #[cfg(unix)]
            Network::Unix => {
                let stream = UnixStream::connect(addr).await?;
                let (read, write) = stream.into_split();
                trace!(%network, addr, "connected");
                Ok(Conn::from_halves(Box::new(read), Box::new(write)))
            }
        }
    }

    /// Like [`Conn::dial`], but gives up after `timeout`.
    pub async fn dial_timeout(
        network: Network,
        addr: &str,
        timeout: Duration,
    ) -> Result<Conn, ConnError> {
        match tokio::time::timeout(timeout, Conn::dial(network, addr)).await {
            Ok(result) => result,
            Err(_) => Err(ConnError::ConnectTimeout),
        }
    }

    fn from_halves(read: Box<dyn AsyncRead + Send + Sync + Unpin>, write: WriteStream) -> Conn {
        Conn {
            writer: Mutex::new(BufWriter::new(write)),
            reply: Value::new(BufReader::new(read)),
            whence: None,
            open_commands: AtomicI64::new(0),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Opens a command with the given number of arguments (not counting the
    /// command name itself) and returns the pipe to write them through.
    ///
    /// Blocks while another pipe is open on this connection.
    pub async fn command(&self, name: &str, args: usize) -> Result<Pipe<'_>, ConnError> {
        let guard = self.writer.lock().await;
        self.open_commands.fetch_add(1, Ordering::Relaxed);
        let mut pipe = Pipe { conn: self, writer: guard };
        if let Err(err) = pipe.write_header(args + 1).await {
            pipe.poison().await;
            return Err(err.into());
        }
        if let Err(err) = pipe.write_argument(name.as_bytes()).await {
            pipe.poison().await;
            return Err(err.into());
        }
        Ok(pipe)
    }

    /// Sends a complete command with string arguments.
    ///
    /// On a write failure the connection is destroyed rather than left with
    /// a partial frame on the wire, and the error is returned.
    pub async fn raw_cmd(&self, command: &str, args: &[&str]) -> Result<(), ConnError> {
        let mut pipe = self.command(command, args.len()).await?;
        for arg in args {
            if let Err(err) = pipe.write_argument(arg.as_bytes()).await {
                pipe.abort().await;
                return Err(err.into());
            }
        }
        if let Err(err) = pipe.close().await {
            self.shutdown_transport().await;
            return Err(err.into());
        }
        Ok(())
    }

    /// The reply cursor.
    ///
    /// Replies carry no correlation identifier: call this exactly once per
    /// command sent, in sending order. The cursor itself is long-lived; each
    /// extracted value advances it to the next reply.
    pub fn resp(&mut self) -> &mut Value {
        self.open_commands.fetch_sub(1, Ordering::Relaxed);
        &mut self.reply
    }

    /// Commands sent whose replies have not been read yet.
    pub fn in_flight(&self) -> i64 {
        self.open_commands.load(Ordering::Relaxed)
    }

    /// Releases the connection back into the pool it came from, or destroys
    /// it if it is not pooled.
    pub async fn close(self) -> Result<(), ConnError> {
        match self.whence.clone() {
            Some(pool) => {
                pool::PoolInner::put(pool, self);
                Ok(())
            }
            None => {
                self.destroy().await;
                Ok(())
            }
        }
    }

    /// Unconditionally shuts the transport down.
    pub async fn destroy(self) {
        self.shutdown_transport().await;
    }

    async fn shutdown_transport(&self) {
        self.destroyed.store(true, Ordering::Relaxed);
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.shutdown().await {
            debug!(error = %err, "transport shutdown failed");
        }
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Relaxed)
    }

    pub(crate) fn attach_pool(&mut self, pool: Arc<pool::PoolInner>) {
        self.whence = Some(pool);
    }

    /// Hands the reply cursor to a dedicated reader (the pub/sub
    /// dispatcher). Afterwards `resp()` yields a dead cursor.
    pub(crate) fn take_reply(&mut self) -> Value {
        std::mem::replace(&mut self.reply, Value::detached())
    }
}

/// A command in the process of being written to a connection.
///
/// Holds the connection's encode lock until [`Pipe::close`]; dropping a pipe
/// without closing releases the lock but leaves the unflushed partial frame
/// buffered, so always close or [`Pipe::abort`].
pub struct Pipe<'a> {
    conn: &'a Conn,
    writer: MutexGuard<'a, BufWriter<WriteStream>>,
}

impl Pipe<'_> {
    async fn write_header(&mut self, count: usize) -> io::Result<()> {
        self.writer
            .write_all(format!("*{count}\r\n").as_bytes())
            .await
    }

    /// Writes one argument as a length-prefixed bulk string.
    pub async fn write_argument(&mut self, arg: &[u8]) -> io::Result<()> {
        self.writer
            .write_all(format!("${}\r\n", arg.len()).as_bytes())
            .await?;
        self.writer.write_all(arg).await?;
        self.writer.write_all(b"\r\n").await
    }

    /// Buffers a reader fully to learn its length, then writes it as one
    /// argument. Prefer [`Pipe::write_argument_len`] when the length is
    /// known up front.
    pub async fn write_argument_reader<R>(&mut self, mut reader: R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        self.write_argument(&buf).await?;
        Ok(buf.len() as u64)
    }

    /// Streams exactly `len` bytes from the reader as one argument.
    pub async fn write_argument_len<R>(&mut self, reader: R, len: u64) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        self.writer
            .write_all(format!("${len}\r\n").as_bytes())
            .await?;
        let mut limited = reader.take(len);
        let copied = tokio::io::copy(&mut limited, &mut *self.writer).await?;
        self.writer.write_all(b"\r\n").await?;
        Ok(copied)
    }

    /// Flushes the command to the wire and releases the encode lock.
    pub async fn close(mut self) -> io::Result<()> {
        self.writer.flush().await
    }

    /// Destroys the connection, abandoning the partial frame.
    pub async fn abort(mut self) {
        self.poison().await;
    }

    async fn poison(&mut self) {
        self.conn.destroyed.store(true, Ordering::Relaxed);
        if let Err(err) = self.writer.shutdown().await {
            debug!(error = %err, "transport shutdown after write failure");
        }
    }
}
