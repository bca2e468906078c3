//! # respline - A Streaming RESP Client
//!
//! respline talks the Redis Serialization Protocol to Redis-compatible
//! servers. Its decoder is built for streams, not buffers: replies are
//! parsed lazily off the live connection, large bulk strings can be read
//! incrementally through a bounded reader, and array elements arrive one at
//! a time from a background decode task — all while guaranteeing each value
//! is consumed exactly once and the stream stays frame-aligned for whatever
//! comes next.
//!
//! ## Features
//!
//! - **Lazy decoding**: a reply's payload is only pulled when asked for
//! - **Pipelining**: one writer lock serializes command frames; replies are
//!   read back in order on a separate path
//! - **Connection pooling**: idle connections are reused, with an idle cap
//!   and optional AUTH on dial
//! - **Pub/sub fan-out**: a dedicated dispatcher demultiplexes published
//!   messages to per-channel subscriber queues
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                           respline                             │
//! │                                                                │
//! │   application ──> Conn::command() ──> Pipe ──────> server      │
//! │                                                                │
//! │   application <── Value <── Conn::resp() <──────── server      │
//! │                     │                                          │
//! │                     └── ArrayStream (background decode task)   │
//! │                                                                │
//! │   Pool ── idle Conns, dial + AUTH on demand                    │
//! │   Subscriber ── dispatcher task ──> per-channel queues         │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use respline::{Pool, PoolConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = Pool::new(PoolConfig {
//!         addr: "127.0.0.1:6379".to_string(),
//!         ..PoolConfig::default()
//!     });
//!
//!     let mut conn = pool.conn().await?;
//!     conn.raw_cmd("SET", &["name", "Ariz"]).await?;
//!     println!("{}", conn.resp().render().await);
//!
//!     conn.raw_cmd("GET", &["name"]).await?;
//!     let value = conn.resp().bulk_bytes().await?;
//!     assert_eq!(&value[..], b"Ariz");
//!
//!     conn.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: the streaming RESP decoder
//! - [`connection`]: connections, command pipes, and the pool
//! - [`pubsub`]: subscription registry and message dispatch
//! - [`cli`]: the argument tokenizer used by the interactive binary
//!
//! ## Reading Discipline
//!
//! One stream serves every reply on a connection, so the decoder enforces
//! two rules: a value may be extracted once, and whatever a consumer leaves
//! unread is drained before the next value is probed. Replies carry no
//! correlation identifiers — [`Conn::resp`] must be called once per command
//! sent, in sending order.

pub mod cli;
pub mod connection;
pub mod protocol;
pub mod pubsub;

// Re-export commonly used types for convenience
pub use connection::pool::{Pool, PoolConfig};
pub use connection::{Conn, ConnError, Network, Pipe};
pub use protocol::{ArrayStream, BulkReader, DecodeError, Kind, Value};
pub use pubsub::{Message, Subscriber, Subscription};

/// The default address clients connect to (same port as Redis)
pub const DEFAULT_ADDR: &str = "127.0.0.1:6379";

/// Version of respline
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
