use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::queue::codec::{self, CodecError};
use crate::queue::transport::{Acker, QueueBinding, SendOutcome, Subscription, Transport, TransportError};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("could not encode message for {queue}: {source}")]
    Encode {
        queue: String,
        #[source]
        source: CodecError,
    },

    #[error("malformed message body on {queue}: {source}")]
    Malformed {
        queue: String,
        #[source]
        source: CodecError,
    },
}

/// Typed endpoint for one queue
pub struct Channel<T> {
    transport: Arc<dyn Transport>,
    binding: QueueBinding,
    send_lock: Mutex<()>,
    max_message_bytes: usize,
    _message: PhantomData<fn() -> T>,
}

impl<T> Channel<T>
where
    T: Serialize + DeserializeOwned + Send,
{
    /// Bind a channel to `queue`, clearing residual messages when `purge` is set
    pub async fn open(
        transport: Arc<dyn Transport>,
        queue: &str,
        purge: bool,
        fanout: bool,
    ) -> Result<Self, ChannelError> {
        let binding = if fanout {
            QueueBinding::fanout(queue)
        } else {
            QueueBinding::direct(queue)
        };

        transport.declare(&binding).await?;

        if purge {
            transport.purge(&binding).await?;
            debug!("Purged queue: {}", queue);
        }

        Ok(Self {
            transport,
            binding,
            send_lock: Mutex::new(()),
            max_message_bytes: codec::DEFAULT_MAX_MESSAGE_BYTES,
            _message: PhantomData,
        })
    }

    /// Reject consumed bodies that inflate past `limit` bytes
    pub fn with_max_message_bytes(mut self, limit: usize) -> Self {
        self.max_message_bytes = limit;
        self
    }

    pub fn queue(&self) -> &str {
        &self.binding.queue
    }

    /// Publish one message as a persistent delivery
    pub async fn send(&self, message: &T) -> Result<SendOutcome, ChannelError> {
        let body = codec::encode(message).map_err(|source| ChannelError::Encode {
            queue: self.binding.queue.clone(),
            source,
        })?;

        let _guard = self.send_lock.lock().await;
        let outcome = self.transport.send(&self.binding, body).await?;

        Ok(outcome)
    }

    /// Publish, waiting `backoff` between attempts for as long as the
    /// message is unroutable. Never gives up on its own.
    pub async fn send_with_retry(&self, message: &T, backoff: Duration) -> Result<(), ChannelError> {
        loop {
            match self.send(message).await? {
                SendOutcome::Routed => return Ok(()),
                SendOutcome::Unroutable => {
                    warn!(
                        "Message to {} is unroutable, retrying in {:?}",
                        self.binding.queue, backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Subscribe to the queue with one unacknowledged delivery at a time
    pub async fn consume(&self) -> Result<Consumer<T>, ChannelError> {
        let subscription = self.transport.subscribe(&self.binding).await?;

        Ok(Consumer {
            subscription,
            queue: self.binding.queue.clone(),
            max_message_bytes: self.max_message_bytes,
            _message: PhantomData,
        })
    }
}

/// Pull side of a channel
pub struct Consumer<T> {
    subscription: Box<dyn Subscription>,
    queue: String,
    max_message_bytes: usize,
    _message: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Consumer<T> {
    /// Next decoded delivery, or `None` when the subscription is closed
    pub async fn next_delivery(&mut self) -> Result<Option<Delivery<T>>, ChannelError> {
        let Some(raw) = self.subscription.next_delivery().await? else {
            return Ok(None);
        };

        let message = codec::decode(&raw.body, self.max_message_bytes).map_err(|source| ChannelError::Malformed {
            queue: self.queue.clone(),
            source,
        })?;

        Ok(Some(Delivery {
            message,
            handle: AckHandle(raw.acker),
        }))
    }

    pub async fn cancel(self) -> Result<(), ChannelError> {
        self.subscription.cancel().await?;
        debug!("Cancelled consumer on {}", self.queue);
        Ok(())
    }
}

/// A decoded message together with the capability to settle it
pub struct Delivery<T> {
    pub message: T,
    handle: AckHandle,
}

impl<T> Delivery<T> {
    pub fn into_parts(self) -> (T, AckHandle) {
        (self.message, self.handle)
    }
}

pub struct AckHandle(Box<dyn Acker>);

impl AckHandle {
    pub async fn ack(self) -> Result<(), ChannelError> {
        self.0.ack().await?;
        Ok(())
    }

    pub async fn nack(self) -> Result<(), ChannelError> {
        self.0.nack().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::MemoryTransport;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: u32,
    }

    #[tokio::test]
    async fn test_direct_send_and_consume() {
        let transport = Arc::new(MemoryTransport::new());
        let channel: Channel<Note> = Channel::open(transport.clone(), "notes", true, false).await.unwrap();

        assert_eq!(channel.send(&Note { id: 1 }).await.unwrap(), SendOutcome::Routed);

        let mut consumer = channel.consume().await.unwrap();
        let delivery = consumer.next_delivery().await.unwrap().unwrap();
        let (note, handle) = delivery.into_parts();
        assert_eq!(note, Note { id: 1 });

        tokio_test::assert_ok!(handle.ack().await);
        assert_eq!(transport.ack_count(), 1);
        assert_eq!(transport.nack_count(), 0);
    }

    #[tokio::test]
    async fn test_purge_on_open_clears_residual_messages() {
        let transport = Arc::new(MemoryTransport::new());
        let first: Channel<Note> = Channel::open(transport.clone(), "notes", false, false).await.unwrap();
        first.send(&Note { id: 1 }).await.unwrap();
        first.send(&Note { id: 2 }).await.unwrap();

        let resumed: Channel<Note> = Channel::open(transport.clone(), "notes", false, false).await.unwrap();
        assert_eq!(transport.pending("notes"), 2);
        drop(resumed);

        let _fresh: Channel<Note> = Channel::open(transport.clone(), "notes", true, false).await.unwrap();
        assert_eq!(transport.pending("notes"), 0);
    }

    #[tokio::test]
    async fn test_fanout_without_subscribers_is_unroutable_until_one_binds() {
        let transport = Arc::new(MemoryTransport::new());
        let sender: Arc<Channel<Note>> =
            Arc::new(Channel::open(transport.clone(), "results", true, true).await.unwrap());

        assert_eq!(sender.send(&Note { id: 1 }).await.unwrap(), SendOutcome::Unroutable);

        let retrying = {
            let sender = sender.clone();
            tokio::spawn(async move { sender.send_with_retry(&Note { id: 2 }, Duration::from_millis(10)).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        let receiver: Channel<Note> = Channel::open(transport.clone(), "results", false, true).await.unwrap();
        let mut consumer = receiver.consume().await.unwrap();

        retrying.await.unwrap().unwrap();

        let (note, handle) = consumer.next_delivery().await.unwrap().unwrap().into_parts();
        assert_eq!(note, Note { id: 2 });
        handle.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_body_is_fatal() {
        let transport = Arc::new(MemoryTransport::new());
        let channel: Channel<Note> = Channel::open(transport.clone(), "notes", true, false).await.unwrap();

        transport
            .send(&QueueBinding::direct("notes"), b"not zlib".to_vec())
            .await
            .unwrap();

        let mut consumer = channel.consume().await.unwrap();
        let err = consumer.next_delivery().await.err().unwrap();
        assert!(matches!(err, ChannelError::Malformed { .. }));
    }

    #[tokio::test]
    async fn test_oversized_body_is_malformed() {
        let transport = Arc::new(MemoryTransport::new());
        let channel: Channel<Note> = Channel::open(transport.clone(), "notes", true, false)
            .await
            .unwrap()
            .with_max_message_bytes(4);

        channel.send(&Note { id: 123456 }).await.unwrap();

        let mut consumer = channel.consume().await.unwrap();
        let err = consumer.next_delivery().await.err().unwrap();
        assert!(matches!(
            err,
            ChannelError::Malformed { source: CodecError::TooLarge { limit: 4 }, .. }
        ));
    }
}
