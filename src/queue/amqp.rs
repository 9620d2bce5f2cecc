use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::*, publisher_confirm::Confirmation, types::FieldTable, BasicProperties, Channel, Connection,
    ConnectionProperties, Consumer, ExchangeKind,
};
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use crate::queue::transport::{
    Acker, QueueBinding, RawDelivery, SendOutcome, Subscription, Transport, TransportError,
};

/// AMQP delivery mode for messages that survive a broker restart
const PERSISTENT: u8 = 2;

/// Broker address and credentials
#[derive(Debug, Clone)]
pub struct AmqpParams {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub username: String,
    pub password: String,
}

impl AmqpParams {
    /// Connection URI with credentials and vhost percent-encoded
    pub fn uri(&self) -> Result<String, TransportError> {
        let mut url = Url::parse(&format!("amqp://{}:{}", self.host, self.port))
            .map_err(|e| TransportError::Connection(format!("invalid broker host {}: {}", self.host, e)))?;

        url.set_username(&self.username)
            .and_then(|_| url.set_password(Some(&self.password)))
            .map_err(|_| TransportError::Connection(format!("cannot set credentials for {}", self.host)))?;

        url.path_segments_mut()
            .map_err(|_| TransportError::Connection(format!("cannot set vhost for {}", self.host)))?
            .push(&self.vhost);

        Ok(url.to_string())
    }
}

/// Name of the exchange that broadcasts to every queue bound for `queue`
fn fanout_exchange(queue: &str) -> String {
    format!("{}.fanout", queue)
}

/// RabbitMQ transport. One connection per process; the publishing channel
/// is shared behind a mutex and every subscription gets its own channel.
pub struct AmqpTransport {
    connection: Connection,
    publisher: Mutex<Channel>,
}

impl AmqpTransport {
    pub async fn connect(params: &AmqpParams) -> Result<Self, TransportError> {
        let uri = params.uri()?;

        let connection = Connection::connect(&uri, ConnectionProperties::default())
            .await
            .map_err(|e| TransportError::Connection(format!("failed to connect to RabbitMQ at {}: {}", params.host, e)))?;

        let publisher = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::Connection(format!("failed to create channel: {}", e)))?;

        // Confirms let us see returned (unroutable) mandatory messages
        publisher
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| TransportError::Connection(format!("failed to enable publisher confirms: {}", e)))?;

        info!("Connected to RabbitMQ at {}:{}", params.host, params.port);

        Ok(Self {
            connection,
            publisher: Mutex::new(publisher),
        })
    }

    async fn declare_on(channel: &Channel, binding: &QueueBinding) -> Result<(), TransportError> {
        let declare_err = |e: lapin::Error| TransportError::Declare {
            queue: binding.queue.clone(),
            message: e.to_string(),
        };

        channel
            .queue_declare(
                &binding.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(declare_err)?;

        if binding.is_fanout() {
            channel
                .exchange_declare(
                    &fanout_exchange(&binding.queue),
                    ExchangeKind::Fanout,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(declare_err)?;
        }

        Ok(())
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn declare(&self, binding: &QueueBinding) -> Result<(), TransportError> {
        let channel = self.publisher.lock().await;
        Self::declare_on(&channel, binding).await
    }

    async fn purge(&self, binding: &QueueBinding) -> Result<(), TransportError> {
        let channel = self.publisher.lock().await;

        let purged = channel
            .queue_purge(&binding.queue, QueuePurgeOptions::default())
            .await
            .map_err(|e| TransportError::Declare { queue: binding.queue.clone(), message: e.to_string() })?;

        debug!("Purged {} message(s) from {}", purged, binding.queue);
        Ok(())
    }

    async fn send(&self, binding: &QueueBinding, body: Vec<u8>) -> Result<SendOutcome, TransportError> {
        let publish_err = |e: lapin::Error| TransportError::Publish {
            queue: binding.queue.clone(),
            message: e.to_string(),
        };

        let (exchange, routing_key) = if binding.is_fanout() {
            (fanout_exchange(&binding.queue), binding.queue.clone())
        } else {
            (String::new(), binding.queue.clone())
        };

        let channel = self.publisher.lock().await;

        let confirmation = channel
            .basic_publish(
                &exchange,
                &routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                &body,
                BasicProperties::default().with_delivery_mode(PERSISTENT),
            )
            .await
            .map_err(publish_err)?
            .await
            .map_err(publish_err)?;

        match confirmation {
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(SendOutcome::Routed),
            Confirmation::Ack(Some(_)) | Confirmation::Nack(Some(_)) => Ok(SendOutcome::Unroutable),
            Confirmation::Nack(None) => Err(TransportError::Publish {
                queue: binding.queue.clone(),
                message: "broker rejected the message".to_string(),
            }),
        }
    }

    async fn subscribe(&self, binding: &QueueBinding) -> Result<Box<dyn Subscription>, TransportError> {
        let consume_err = |e: lapin::Error| TransportError::Consume {
            queue: binding.queue.clone(),
            message: e.to_string(),
        };

        let channel = self.connection.create_channel().await.map_err(consume_err)?;

        Self::declare_on(&channel, binding).await?;

        if binding.is_fanout() {
            channel
                .queue_bind(
                    &binding.queue,
                    &fanout_exchange(&binding.queue),
                    &binding.queue,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(consume_err)?;
        }

        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(consume_err)?;

        let tag = format!("sampler-{}", Uuid::new_v4());
        let consumer = channel
            .basic_consume(&binding.queue, &tag, BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(consume_err)?;

        debug!("Consumer {} subscribed to {}", tag, binding.queue);

        Ok(Box::new(AmqpSubscription {
            channel,
            consumer,
            tag,
            queue: binding.queue.clone(),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connection
            .close(200, "shutting down")
            .await
            .map_err(|e| TransportError::Connection(format!("failed to close connection: {}", e)))?;

        info!("Closed RabbitMQ connection");
        Ok(())
    }
}

struct AmqpSubscription {
    channel: Channel,
    consumer: Consumer,
    tag: String,
    queue: String,
}

#[async_trait]
impl Subscription for AmqpSubscription {
    async fn next_delivery(&mut self) -> Result<Option<RawDelivery>, TransportError> {
        match self.consumer.next().await {
            Some(Ok(delivery)) => Ok(Some(RawDelivery {
                body: delivery.data,
                acker: Box::new(AmqpAcker(delivery.acker)),
            })),
            Some(Err(e)) => Err(TransportError::Consume {
                queue: self.queue.clone(),
                message: e.to_string(),
            }),
            None => Ok(None),
        }
    }

    async fn cancel(self: Box<Self>) -> Result<(), TransportError> {
        self.channel
            .basic_cancel(&self.tag, BasicCancelOptions::default())
            .await
            .map_err(|e| TransportError::Consume { queue: self.queue.clone(), message: e.to_string() })?;

        self.channel
            .close(200, "consumer cancelled")
            .await
            .map_err(|e| TransportError::Consume { queue: self.queue.clone(), message: e.to_string() })?;

        Ok(())
    }
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| TransportError::Acknowledge(e.to_string()))
    }

    async fn nack(self: Box<Self>) -> Result<(), TransportError> {
        self.0
            .nack(BasicNackOptions {
                requeue: true,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(|e| TransportError::Acknowledge(e.to_string()))
    }
}
