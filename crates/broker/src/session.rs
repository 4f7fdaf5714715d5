//! Transport session traits shared by every broker backend.

use std::time::Duration;

use async_trait::async_trait;
use hpc_core::{MessageProperties, OutboundMessage};

use crate::config::BrokerConfig;

/// Broker-assigned handle for an unacknowledged delivery.
pub type DeliveryTag = u64;

/// A message fetched from a queue but not yet acknowledged.
///
/// Until [`Session::acknowledge`] or [`Session::requeue`] is called (or the
/// session closes) the message is invisible to every other consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// Opens broker sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a connection and a channel.
    ///
    /// Fails with [`TransportError::Connection`] when the host is
    /// unreachable or authentication is refused.
    async fn open(&self, config: &BrokerConfig) -> Result<Box<dyn Session>, TransportError>;
}

/// One connection plus one channel, owned by a single job invocation.
///
/// All methods take `&mut self`: a session must not be used from two tasks
/// at once.
#[async_trait]
pub trait Session: Send {
    /// Declare a durable queue. Idempotent.
    async fn declare_queue(&mut self, name: &str) -> Result<(), TransportError>;

    /// Publish a message to `queue` through the default exchange.
    ///
    /// Fire-and-forget: the broker's durability acknowledgement is not
    /// awaited.
    async fn publish(&mut self, queue: &str, message: OutboundMessage)
        -> Result<(), TransportError>;

    /// Fetch at most one message without blocking and without
    /// acknowledging it. Returns `None` when the queue is empty.
    async fn try_receive(&mut self, queue: &str) -> Result<Option<Delivery>, TransportError>;

    /// Permanently remove a fetched message from its queue.
    async fn acknowledge(&mut self, tag: DeliveryTag) -> Result<(), TransportError>;

    /// Return a fetched message to its queue so other consumers can read it.
    async fn requeue(&mut self, tag: DeliveryTag) -> Result<(), TransportError>;

    /// Suspend until a new message may be available on `queue`, or until
    /// `limit` elapses.
    ///
    /// Backends without delivery notifications just sleep for `limit`.
    async fn wait_for_delivery(&mut self, _queue: &str, limit: Duration) {
        tokio::time::sleep(limit).await;
    }

    /// Close the channel and the connection.
    ///
    /// Every message fetched but not acknowledged is returned to its queue
    /// by the broker. Calling `close` again is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;
}

impl std::fmt::Debug for dyn Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Session")
    }
}

/// Errors raised by broker sessions.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection could not be established or was lost.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A channel-level operation failed on an open connection.
    #[error("Channel error: {0}")]
    Channel(String),

    /// The queue has not been declared on this broker.
    #[error("Queue '{0}' not found")]
    QueueNotFound(String),

    /// The delivery tag is not held by this session.
    #[error("Unknown delivery tag {0}")]
    UnknownDelivery(DeliveryTag),

    /// The session has already been closed.
    #[error("Session is closed")]
    Closed,
}
