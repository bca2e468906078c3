//! Connection Pool
//!
//! Keeps a set of idle connections so callers skip the dial (and AUTH)
//! handshake on the hot path. Releasing a connection back into a full pool
//! destroys it instead; `max_idle == 0` means idle connections are retained
//! without bound.
//!
//! The idle set is the only shared state, guarded by a plain mutex that is
//! never held across an await point.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, trace};

use crate::connection::{Conn, ConnError, Network};
use crate::protocol::Kind;
use crate::pubsub::Subscriber;

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Transport family to dial over.
    pub network: Network,
    /// Server address, e.g. "127.0.0.1:6379".
    pub addr: String,
    /// Credential sent via AUTH on every new connection, if set.
    pub password: Option<String>,
    /// How many idle connections to keep; 0 keeps all of them.
    pub max_idle: usize,
    /// Optional dial timeout.
    pub connect_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            network: Network::Tcp,
            addr: "127.0.0.1:6379".to_string(),
            password: None,
            max_idle: 0,
            connect_timeout: None,
        }
    }
}

pub(crate) struct PoolInner {
    config: PoolConfig,
    idle: Mutex<VecDeque<Conn>>,
}

impl PoolInner {
    /// Releases a connection: pooled while under the idle cap, destroyed
    /// otherwise. Destroyed connections are never pooled.
    pub(crate) fn put(inner: Arc<PoolInner>, conn: Conn) {
        if conn.is_destroyed() {
            debug!("discarding destroyed connection");
            return;
        }
        let mut idle = inner.idle.lock().expect("pool mutex poisoned");
        if inner.config.max_idle != 0 && idle.len() >= inner.config.max_idle {
            debug!(max_idle = inner.config.max_idle, "idle cap reached, destroying connection");
            // Dropping the halves closes the transport.
            return;
        }
        idle.push_back(conn);
    }
}

/// A pool of reusable connections to one server.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Creates a pool with the given configuration. No connection is dialed
    /// until the first [`Pool::conn`] call.
    pub fn new(config: PoolConfig) -> Pool {
        Pool {
            inner: Arc::new(PoolInner {
                config,
                idle: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Takes an idle connection, or dials (and authenticates) a new one.
    pub async fn conn(&self) -> Result<Conn, ConnError> {
        if let Some(conn) = self.pop_idle() {
            trace!("reusing idle connection");
            return Ok(conn);
        }
        self.new_conn().await
    }

    /// Dedicates a connection to pub/sub dispatch.
    pub async fn subscriber(&self) -> Result<Subscriber, ConnError> {
        Ok(Subscriber::new(self.conn().await?))
    }

    /// Number of connections currently idle.
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().expect("pool mutex poisoned").len()
    }

    fn pop_idle(&self) -> Option<Conn> {
        self.inner
            .idle
            .lock()
            .expect("pool mutex poisoned")
            .pop_front()
    }

    async fn new_conn(&self) -> Result<Conn, ConnError> {
        let config = &self.inner.config;
        let mut conn = match config.connect_timeout {
            Some(timeout) => Conn::dial_timeout(config.network, &config.addr, timeout).await?,
            None => Conn::dial(config.network, &config.addr).await?,
        };
        if let Some(password) = &config.password {
            authenticate(&mut conn, password).await?;
        }
        conn.attach_pool(Arc::clone(&self.inner));
        debug!(addr = %config.addr, "opened new connection");
        Ok(conn)
    }
}

/// Sends AUTH and consumes the confirmation so the reply cursor stays
/// aligned for the connection's first real command.
async fn authenticate(conn: &mut Conn, password: &str) -> Result<(), ConnError> {
    conn.raw_cmd("AUTH", &[password]).await?;
    let reply = conn.resp();
    match reply.kind().await {
        Kind::Error => Err(ConnError::Auth(reply.error_message().await?)),
        Kind::SimpleString => {
            reply.simple_string().await?;
            Ok(())
        }
        kind => Err(ConnError::UnexpectedReply(kind)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accepts connections forever, reading and discarding client bytes so
    /// writes never back up.
    async fn sink_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut sink = [0u8; 1024];
                    while matches!(socket.read(&mut sink).await, Ok(n) if n > 0) {}
                });
            }
        });
        addr
    }

    fn pool_at(addr: &str, max_idle: usize) -> Pool {
        Pool::new(PoolConfig {
            addr: addr.to_string(),
            max_idle,
            ..PoolConfig::default()
        })
    }

    #[tokio::test]
    async fn idle_count_never_exceeds_max_idle() {
        let addr = sink_server().await;
        let pool = pool_at(&addr, 2);

        let a = pool.conn().await.unwrap();
        let b = pool.conn().await.unwrap();
        let c = pool.conn().await.unwrap();

        a.close().await.unwrap();
        b.close().await.unwrap();
        assert_eq!(pool.idle_count(), 2);

        // The third release hits the cap and destroys instead of pooling.
        c.close().await.unwrap();
        assert_eq!(pool.idle_count(), 2);
    }

    #[tokio::test]
    async fn zero_max_idle_retains_everything() {
        let addr = sink_server().await;
        let pool = pool_at(&addr, 0);

        let conns = vec![
            pool.conn().await.unwrap(),
            pool.conn().await.unwrap(),
            pool.conn().await.unwrap(),
        ];
        for conn in conns {
            conn.close().await.unwrap();
        }
        assert_eq!(pool.idle_count(), 3);
    }

    #[tokio::test]
    async fn released_connections_are_reused() {
        let addr = sink_server().await;
        let pool = pool_at(&addr, 1);

        let conn = pool.conn().await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(pool.idle_count(), 1);

        let _conn = pool.conn().await.unwrap();
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn authenticates_new_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 28];
            socket.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"*2\r\n$4\r\nAUTH\r\n$8\r\nhunter22\r\n");
            socket.write_all(b"+OK\r\n").await.unwrap();
            let mut sink = [0u8; 1024];
            while matches!(socket.read(&mut sink).await, Ok(n) if n > 0) {}
        });

        let pool = Pool::new(PoolConfig {
            addr,
            password: Some("hunter22".to_string()),
            ..PoolConfig::default()
        });
        let conn = pool.conn().await.unwrap();
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn rejected_credential_fails_the_checkout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut sink = [0u8; 256];
            let _ = socket.read(&mut sink).await;
            socket
                .write_all(b"-ERR invalid password\r\n")
                .await
                .unwrap();
        });

        let pool = Pool::new(PoolConfig {
            addr,
            password: Some("wrong".to_string()),
            ..PoolConfig::default()
        });
        match pool.conn().await {
            Err(ConnError::Auth(message)) => assert_eq!(message, "ERR invalid password"),
            other => panic!("expected auth failure, got {:?}", other.map(|_| ())),
        }
    }
}
