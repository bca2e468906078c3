//! Publish/Subscribe Dispatch
//!
//! A connection switched into subscribe mode stops being request/reply: the
//! server pushes frames whenever it likes. A [`Subscriber`] dedicates one
//! connection to that mode and runs a background dispatcher that reads each
//! incoming frame, ignores control confirmations, and fans "message" frames
//! out to every queue registered for the frame's channel.
//!
//! ## Delivery guarantees
//!
//! - Messages for one channel reach its queues in the order the dispatcher
//!   read them off the stream.
//! - Delivery happens under the registry's read lock while registration and
//!   removal take the write lock, so once [`Subscriber::unsubscribe`]
//!   returns, the removed queue will never see another message for that
//!   channel — even one that was already in flight from the server.
//! - An invalid or unexpected frame is a protocol violation and halts the
//!   dispatcher; subscribe-mode streams carry nothing else legitimately.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::connection::{Conn, ConnError};
use crate::protocol::{DecodeError, Kind, Value};

/// One published message, delivered to every subscriber of its channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: String,
    pub payload: Bytes,
}

/// Receipt for one registered queue; redeem it to unsubscribe.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    id: u64,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

struct Entry {
    id: u64,
    queue: mpsc::Sender<Message>,
}

/// Channel name -> subscriber queues, with reader/writer locking so
/// deliveries run concurrently with each other but exclude (un)subscribes.
struct Registry {
    channels: RwLock<HashMap<String, Vec<Entry>>>,
    next_id: AtomicU64,
}

impl Registry {
    fn new() -> Registry {
        Registry {
            channels: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    async fn register(&self, channel: &str, queue: mpsc::Sender<Message>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut channels = self.channels.write().await;
        channels
            .entry(channel.to_string())
            .or_default()
            .push(Entry { id, queue });
        id
    }

    /// Removes the queue; returns true when the channel has no subscribers
    /// left. Acquiring the write lock waits out any delivery in progress,
    /// which is what makes the no-delivery-after-return guarantee hold.
    async fn unregister(&self, channel: &str, id: u64) -> bool {
        let mut channels = self.channels.write().await;
        let Some(entries) = channels.get_mut(channel) else {
            return false;
        };
        entries.retain(|entry| entry.id != id);
        if entries.is_empty() {
            channels.remove(channel);
            true
        } else {
            false
        }
    }

    async fn deliver(&self, channel: &str, payload: &Bytes) {
        let channels = self.channels.read().await;
        let Some(entries) = channels.get(channel) else {
            trace!(channel, "message for channel with no local subscribers");
            return;
        };
        for entry in entries {
            let message = Message {
                channel: channel.to_string(),
                payload: payload.clone(),
            };
            if entry.queue.send(message).await.is_err() {
                debug!(channel, subscriber = entry.id, "subscriber queue closed");
            }
        }
    }
}

/// A connection dedicated to pub/sub, plus its dispatcher.
pub struct Subscriber {
    conn: Conn,
    registry: Arc<Registry>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Subscriber {
    /// Wraps a connection for subscribe-mode use. The connection's reply
    /// cursor is taken over by the dispatcher on the first subscription;
    /// from then on the connection must not serve request/reply traffic.
    pub fn new(conn: Conn) -> Subscriber {
        Subscriber {
            conn,
            registry: Arc::new(Registry::new()),
            dispatcher: None,
        }
    }

    /// Registers `queue` for `channel` and sends SUBSCRIBE. The first
    /// subscription starts the background dispatcher.
    pub async fn subscribe(
        &mut self,
        channel: &str,
        queue: mpsc::Sender<Message>,
    ) -> Result<Subscription, ConnError> {
        let id = self.registry.register(channel, queue).await;
        if let Err(err) = self.conn.raw_cmd("SUBSCRIBE", &[channel]).await {
            self.registry.unregister(channel, id).await;
            return Err(err);
        }
        if self.dispatcher.is_none() {
            self.start();
        }
        debug!(channel, "subscribed");
        Ok(Subscription {
            channel: channel.to_string(),
            id,
        })
    }

    /// Removes the subscription's queue. Takes effect locally and
    /// immediately; when the channel's last queue goes, an UNSUBSCRIBE is
    /// sent to the server as well, best-effort.
    pub async fn unsubscribe(&mut self, subscription: Subscription) {
        let now_empty = self
            .registry
            .unregister(&subscription.channel, subscription.id)
            .await;
        debug!(channel = %subscription.channel, "unsubscribed");
        if now_empty {
            if let Err(err) = self
                .conn
                .raw_cmd("UNSUBSCRIBE", &[&subscription.channel])
                .await
            {
                debug!(channel = %subscription.channel, error = %err, "UNSUBSCRIBE send failed");
            }
        }
    }

    /// Stops the dispatcher and destroys the dedicated connection.
    pub async fn close(self) {
        if let Some(dispatcher) = self.dispatcher {
            dispatcher.abort();
        }
        self.conn.destroy().await;
    }

    fn start(&mut self) {
        let reply = self.conn.take_reply();
        let registry = Arc::clone(&self.registry);
        self.dispatcher = Some(tokio::spawn(dispatch_loop(reply, registry)));
    }
}

async fn dispatch_loop(mut reply: Value, registry: Arc<Registry>) {
    loop {
        match reply.kind().await {
            Kind::Array => {
                if let Err(err) = dispatch_frame(&mut reply, &registry).await {
                    error!(error = %err, "subscription frame decode failed");
                    return;
                }
            }
            Kind::Unknown => {
                debug!("subscription stream closed");
                return;
            }
            Kind::Invalid => {
                error!("invalid frame on subscription stream");
                return;
            }
            kind => {
                error!(%kind, "unexpected reply kind on subscription stream");
                return;
            }
        }
    }
}

/// Decodes one pushed frame. Control confirmations short-circuit; "message"
/// frames are fanned out to the channel's queues.
async fn dispatch_frame(reply: &mut Value, registry: &Registry) -> Result<(), DecodeError> {
    let mut frame = reply.array().await?;
    let mut first = frame
        .next()
        .await
        .ok_or_else(|| DecodeError::Protocol("empty subscription frame".to_string()))?;
    let word = element_text(&mut first).await?;
    match word.as_str() {
        "subscribe" | "unsubscribe" | "psubscribe" | "punsubscribe" => {
            // Confirmation frames carry the channel and a count; the parent
            // cursor flushes those fields on its next probe.
            trace!(control = %word, "control frame acknowledged");
            Ok(())
        }
        "message" => {
            let mut channel = frame
                .next()
                .await
                .ok_or_else(|| DecodeError::Protocol("message frame missing channel".to_string()))?;
            let channel = element_text(&mut channel).await?;
            let mut payload = frame
                .next()
                .await
                .ok_or_else(|| DecodeError::Protocol("message frame missing payload".to_string()))?;
            let payload = element_bytes(&mut payload).await?;
            trace!(channel = %channel, bytes = payload.len(), "dispatching message");
            registry.deliver(&channel, &payload).await;
            Ok(())
        }
        other => Err(DecodeError::Protocol(format!(
            "unknown control word {other:?}"
        ))),
    }
}

/// Frame fields arrive as bulk strings from real servers, but simple
/// strings are accepted too.
async fn element_text(value: &mut Value) -> Result<String, DecodeError> {
    match value.kind().await {
        Kind::SimpleString => value.simple_string().await,
        Kind::BulkString => {
            let bytes = value.bulk_bytes().await?;
            String::from_utf8(bytes.to_vec())
                .map_err(|e| DecodeError::Protocol(format!("invalid UTF-8 in frame field: {e}")))
        }
        kind => Err(DecodeError::WrongKind {
            requested: Kind::BulkString,
            actual: kind,
        }),
    }
}

async fn element_bytes(value: &mut Value) -> Result<Bytes, DecodeError> {
    match value.kind().await {
        Kind::BulkString => value.bulk_bytes().await,
        Kind::SimpleString => Ok(Bytes::from(value.simple_string().await?)),
        Kind::Null => {
            value.take_null().await?;
            Ok(Bytes::new())
        }
        kind => Err(DecodeError::WrongKind {
            requested: Kind::BulkString,
            actual: kind,
        }),
    }
}
