use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, Client, RedisResult};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::queue::transport::{
    Acker, QueueBinding, RawDelivery, SendOutcome, Subscription, Transport, TransportError,
};

/// Seconds a blocking pop waits before polling again
const POP_TIMEOUT_SECS: usize = 1;

/// A consumer whose heartbeat key has expired is considered dead
const HEARTBEAT_TTL_SECS: usize = 30;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Redis-backed transport using the reliable-list pattern.
///
/// Messages live in `sampler:queue:<name>`. A consumer atomically moves one
/// message into its own `sampler:processing:<name>:<consumer>` list and only
/// removes it from there on ack. Every live consumer refreshes
/// `sampler:consumer:<name>:<consumer>`; a new subscriber moves the
/// processing lists of consumers without that key back onto the queue.
pub struct RedisTransport {
    client: Client,
    conn: Arc<Mutex<MultiplexedConnection>>,
}

fn queue_key(queue: &str) -> String {
    format!("sampler:queue:{}", queue)
}

fn processing_key(queue: &str, consumer: &str) -> String {
    format!("sampler:processing:{}:{}", queue, consumer)
}

fn heartbeat_key(queue: &str, consumer: &str) -> String {
    format!("sampler:consumer:{}:{}", queue, consumer)
}

/// Consumer id of a processing list of `queue`
fn consumer_of<'k>(queue: &str, key: &'k str) -> Option<&'k str> {
    let consumer = key.strip_prefix(&processing_key(queue, ""))?;
    // Keys of a queue whose name extends this one do not parse
    Uuid::parse_str(consumer).ok().map(|_| consumer)
}

/// Set of queues declared through this transport
const DECLARED_KEY: &str = "sampler:declared";

/// Set of queue lists bound to a fanout binding
fn bindings_key(queue: &str) -> String {
    format!("sampler:fanout:{}", queue)
}

/// Move every message of `processing` back onto `queue`
async fn requeue_all(conn: &mut MultiplexedConnection, processing: &str, queue: &str) -> RedisResult<usize> {
    let mut moved = 0;
    loop {
        let body: Option<Vec<u8>> = redis::cmd("RPOPLPUSH")
            .arg(processing)
            .arg(queue_key(queue))
            .query_async(&mut *conn)
            .await?;

        match body {
            Some(_) => moved += 1,
            None => return Ok(moved),
        }
    }
}

/// Requeue the processing lists of consumers of `queue` that stopped heartbeating
async fn sweep_dead_consumers(conn: &mut MultiplexedConnection, queue: &str) -> RedisResult<usize> {
    let pattern = processing_key(queue, "*");
    let mut cursor: u64 = 0;
    let mut lists = Vec::new();

    loop {
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(&pattern)
            .arg("COUNT")
            .arg(100)
            .query_async(&mut *conn)
            .await?;

        lists.extend(keys);
        if next == 0 {
            break;
        }
        cursor = next;
    }

    let mut requeued = 0;
    for key in &lists {
        let Some(consumer) = consumer_of(queue, key) else {
            continue;
        };

        let alive: bool = redis::cmd("EXISTS")
            .arg(heartbeat_key(queue, consumer))
            .query_async(&mut *conn)
            .await?;

        if !alive {
            requeued += requeue_all(conn, key, queue).await?;
        }
    }

    Ok(requeued)
}

async fn beat(conn: &Mutex<MultiplexedConnection>, key: &str) -> RedisResult<()> {
    let mut conn = conn.lock().await;
    redis::cmd("SET")
        .arg(key)
        .arg(1)
        .arg("EX")
        .arg(HEARTBEAT_TTL_SECS)
        .query_async(&mut *conn)
        .await
}

fn spawn_heartbeat(conn: Arc<Mutex<MultiplexedConnection>>, key: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        // The first tick completes at once and the key was just set
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = beat(&conn, &key).await {
                warn!("Failed to refresh consumer heartbeat {}: {}", key, e);
            }
        }
    })
}

impl RedisTransport {
    pub async fn connect(redis_url: &str) -> Result<Self, TransportError> {
        let client = Client::open(redis_url)
            .map_err(|e| TransportError::Connection(format!("invalid Redis URL {}: {}", redis_url, e)))?;

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| TransportError::Connection(format!("failed to connect to Redis at {}: {}", redis_url, e)))?;

        debug!("Connected to Redis at {}", redis_url);

        Ok(Self {
            client,
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn declare(&self, binding: &QueueBinding) -> Result<(), TransportError> {
        let mut conn = self.conn.lock().await;

        redis::cmd("SADD")
            .arg(DECLARED_KEY)
            .arg(&binding.queue)
            .query_async::<_, ()>(&mut *conn)
            .await
            .map_err(|e| TransportError::Declare { queue: binding.queue.clone(), message: e.to_string() })?;

        Ok(())
    }

    async fn purge(&self, binding: &QueueBinding) -> Result<(), TransportError> {
        let mut conn = self.conn.lock().await;

        redis::cmd("DEL")
            .arg(queue_key(&binding.queue))
            .query_async::<_, ()>(&mut *conn)
            .await
            .map_err(|e| TransportError::Declare { queue: binding.queue.clone(), message: e.to_string() })?;

        Ok(())
    }

    async fn send(&self, binding: &QueueBinding, body: Vec<u8>) -> Result<SendOutcome, TransportError> {
        let publish_err = |e: redis::RedisError| TransportError::Publish {
            queue: binding.queue.clone(),
            message: e.to_string(),
        };

        let mut conn = self.conn.lock().await;

        let targets: Vec<String> = if binding.is_fanout() {
            redis::cmd("SMEMBERS")
                .arg(bindings_key(&binding.queue))
                .query_async(&mut *conn)
                .await
                .map_err(publish_err)?
        } else {
            let declared: bool = redis::cmd("SISMEMBER")
                .arg(DECLARED_KEY)
                .arg(&binding.queue)
                .query_async(&mut *conn)
                .await
                .map_err(publish_err)?;

            if declared {
                vec![queue_key(&binding.queue)]
            } else {
                Vec::new()
            }
        };

        if targets.is_empty() {
            return Ok(SendOutcome::Unroutable);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for target in &targets {
            pipe.cmd("LPUSH").arg(target).arg(&body).ignore();
        }
        pipe.query_async::<_, ()>(&mut *conn).await.map_err(publish_err)?;

        debug!("Pushed message to {} list(s) for {}", targets.len(), binding.queue);

        Ok(SendOutcome::Routed)
    }

    async fn subscribe(&self, binding: &QueueBinding) -> Result<Box<dyn Subscription>, TransportError> {
        let consume_err = |e: redis::RedisError| TransportError::Consume {
            queue: binding.queue.clone(),
            message: e.to_string(),
        };

        if binding.is_fanout() {
            let mut conn = self.conn.lock().await;
            redis::cmd("SADD")
                .arg(bindings_key(&binding.queue))
                .arg(queue_key(&binding.queue))
                .query_async::<_, ()>(&mut *conn)
                .await
                .map_err(consume_err)?;
        }

        let consumer = Uuid::new_v4().to_string();
        let heartbeat = heartbeat_key(&binding.queue, &consumer);
        beat(&self.conn, &heartbeat).await.map_err(consume_err)?;

        let requeued = {
            let mut conn = self.conn.lock().await;
            sweep_dead_consumers(&mut conn, &binding.queue).await.map_err(consume_err)?
        };
        if requeued > 0 {
            info!("Requeued {} message(s) left by dead consumers of {}", requeued, binding.queue);
        }

        // Blocking pops would stall every other command on a shared connection
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(consume_err)?;

        debug!("Consumer {} subscribed to {}", consumer, binding.queue);

        Ok(Box::new(RedisSubscription {
            conn: Arc::new(Mutex::new(conn)),
            shared: self.conn.clone(),
            queue: binding.queue.clone(),
            processing: processing_key(&binding.queue, &consumer),
            heartbeat: heartbeat.clone(),
            prefetch: Arc::new(Semaphore::new(1)),
            keepalive: spawn_heartbeat(self.conn.clone(), heartbeat),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        // Connections are released when the last handle drops
        debug!("Closing Redis transport");
        Ok(())
    }
}

struct RedisSubscription {
    /// Dedicated to blocking pops
    conn: Arc<Mutex<MultiplexedConnection>>,
    shared: Arc<Mutex<MultiplexedConnection>>,
    queue: String,
    processing: String,
    heartbeat: String,
    /// One permit, held by the acker of the outstanding delivery
    prefetch: Arc<Semaphore>,
    keepalive: JoinHandle<()>,
}

impl Drop for RedisSubscription {
    fn drop(&mut self) {
        self.keepalive.abort();
    }
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next_delivery(&mut self) -> Result<Option<RawDelivery>, TransportError> {
        let Ok(permit) = self.prefetch.clone().acquire_owned().await else {
            return Ok(None);
        };

        loop {
            let popped: Option<Vec<u8>> = {
                let mut conn = self.conn.lock().await;
                redis::cmd("BRPOPLPUSH")
                    .arg(queue_key(&self.queue))
                    .arg(&self.processing)
                    .arg(POP_TIMEOUT_SECS)
                    .query_async(&mut *conn)
                    .await
                    .map_err(|e| TransportError::Consume { queue: self.queue.clone(), message: e.to_string() })?
            };

            if let Some(body) = popped {
                return Ok(Some(RawDelivery {
                    acker: Box::new(RedisAcker {
                        conn: self.conn.clone(),
                        queue: self.queue.clone(),
                        processing: self.processing.clone(),
                        body: body.clone(),
                        _permit: permit,
                    }),
                    body,
                }));
            }
        }
    }

    /// Unsettled messages, including one popped by an abandoned
    /// `next_delivery`, go back onto the queue
    async fn cancel(self: Box<Self>) -> Result<(), TransportError> {
        let consume_err = |e: redis::RedisError| TransportError::Consume {
            queue: self.queue.clone(),
            message: e.to_string(),
        };

        self.prefetch.close();
        self.keepalive.abort();

        let mut conn = self.shared.lock().await;

        let requeued = requeue_all(&mut conn, &self.processing, &self.queue)
            .await
            .map_err(consume_err)?;
        if requeued > 0 {
            warn!("Requeued {} unsettled message(s) while cancelling a consumer on {}", requeued, self.queue);
        }

        redis::cmd("DEL")
            .arg(&self.heartbeat)
            .query_async::<_, ()>(&mut *conn)
            .await
            .map_err(consume_err)?;

        Ok(())
    }
}

struct RedisAcker {
    conn: Arc<Mutex<MultiplexedConnection>>,
    queue: String,
    processing: String,
    body: Vec<u8>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

#[async_trait]
impl Acker for RedisAcker {
    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        let mut conn = self.conn.lock().await;

        redis::cmd("LREM")
            .arg(&self.processing)
            .arg(1)
            .arg(&self.body)
            .query_async::<_, ()>(&mut *conn)
            .await
            .map_err(|e| TransportError::Acknowledge(e.to_string()))?;

        Ok(())
    }

    async fn nack(self: Box<Self>) -> Result<(), TransportError> {
        let mut conn = self.conn.lock().await;

        // Back to the consuming end of the queue so it is redelivered next
        redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(&self.processing)
            .arg(1)
            .arg(&self.body)
            .ignore()
            .cmd("RPUSH")
            .arg(queue_key(&self.queue))
            .arg(&self.body)
            .ignore()
            .query_async::<_, ()>(&mut *conn)
            .await
            .map_err(|e| TransportError::Acknowledge(e.to_string()))?;

        Ok(())
    }
}
