use async_trait::async_trait;
use thiserror::Error;

/// How a published message reaches its consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// Delivered to the single queue with the binding's name
    Direct,
    /// Copied to every queue bound to the binding's exchange
    Fanout,
}

/// A named, durable queue plus the way messages are routed into it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue: String,
    pub routing: Routing,
}

impl QueueBinding {
    pub fn direct(queue: impl Into<String>) -> Self {
        Self { queue: queue.into(), routing: Routing::Direct }
    }

    pub fn fanout(queue: impl Into<String>) -> Self {
        Self { queue: queue.into(), routing: Routing::Fanout }
    }

    pub fn is_fanout(&self) -> bool {
        self.routing == Routing::Fanout
    }
}

/// Result of publishing one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Routed,
    /// Nothing was bound to accept the message; the caller may retry
    Unroutable,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("failed to declare queue {queue}: {message}")]
    Declare { queue: String, message: String },

    #[error("failed to publish to {queue}: {message}")]
    Publish { queue: String, message: String },

    #[error("failed to consume from {queue}: {message}")]
    Consume { queue: String, message: String },

    #[error("failed to acknowledge delivery: {0}")]
    Acknowledge(String),
}

/// Broker connection shared by every channel of a process.
///
/// Subscriptions never hold more than one unacknowledged delivery.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Declare the queue (and exchange, for fanout) behind a binding
    async fn declare(&self, binding: &QueueBinding) -> Result<(), TransportError>;

    /// Drop every message waiting in the queue
    async fn purge(&self, binding: &QueueBinding) -> Result<(), TransportError>;

    /// Publish one persistent message
    async fn send(&self, binding: &QueueBinding, body: Vec<u8>) -> Result<SendOutcome, TransportError>;

    /// Start consuming with prefetch = 1
    async fn subscribe(&self, binding: &QueueBinding) -> Result<Box<dyn Subscription>, TransportError>;

    /// Release the connection
    async fn close(&self) -> Result<(), TransportError>;
}

/// A running consumer on one queue
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery, `None` once the subscription has ended
    async fn next_delivery(&mut self) -> Result<Option<RawDelivery>, TransportError>;

    /// Stop the consumer on the broker side
    async fn cancel(self: Box<Self>) -> Result<(), TransportError>;
}

/// Settles one delivery. Both methods consume the acker, so a delivery can
/// only be settled once. Dropping it leaves the delivery pending.
#[async_trait]
pub trait Acker: Send {
    async fn ack(self: Box<Self>) -> Result<(), TransportError>;

    async fn nack(self: Box<Self>) -> Result<(), TransportError>;
}

pub struct RawDelivery {
    pub body: Vec<u8>,
    pub acker: Box<dyn Acker>,
}
