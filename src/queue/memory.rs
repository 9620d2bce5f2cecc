use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::queue::transport::{
    Acker, QueueBinding, RawDelivery, SendOutcome, Subscription, Transport, TransportError,
};

/// In-process broker with the same delivery rules as the networked backends
#[derive(Clone, Default)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, MemoryQueue>,
    unacked: HashMap<u64, (String, Vec<u8>)>,
    next_tag: u64,
    acks: usize,
    nacks: usize,
}

#[derive(Default)]
struct MemoryQueue {
    messages: VecDeque<Vec<u8>>,
    /// Bound to its fanout exchange by at least one consumer
    bound: bool,
    closed: bool,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let consumers of `queue` finish once it has drained
    pub fn close_queue(&self, queue: &str) {
        self.shared.state().queues.entry(queue.to_string()).or_default().closed = true;
        self.shared.notify.notify_waiters();
    }

    /// Put every unsettled delivery back at the head of its queue, as a
    /// broker does when a consumer connection dies
    #[cfg(test)]
    pub fn recover(&self) -> usize {
        let mut state = self.shared.state();
        let unacked: Vec<_> = state.unacked.drain().collect();
        let count = unacked.len();

        for (_, (queue, body)) in unacked {
            state.queues.entry(queue).or_default().messages.push_front(body);
        }

        drop(state);
        self.shared.notify.notify_waiters();
        count
    }

    #[cfg(test)]
    pub fn pending(&self, queue: &str) -> usize {
        self.shared
            .state()
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    #[cfg(test)]
    pub fn unacked(&self) -> usize {
        self.shared.state().unacked.len()
    }

    #[cfg(test)]
    pub fn ack_count(&self) -> usize {
        self.shared.state().acks
    }

    #[cfg(test)]
    pub fn nack_count(&self) -> usize {
        self.shared.state().nacks
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn declare(&self, binding: &QueueBinding) -> Result<(), TransportError> {
        self.shared.state().queues.entry(binding.queue.clone()).or_default();
        Ok(())
    }

    async fn purge(&self, binding: &QueueBinding) -> Result<(), TransportError> {
        if let Some(queue) = self.shared.state().queues.get_mut(&binding.queue) {
            queue.messages.clear();
        }
        Ok(())
    }

    async fn send(&self, binding: &QueueBinding, body: Vec<u8>) -> Result<SendOutcome, TransportError> {
        let mut state = self.shared.state();

        let queue = match state.queues.get_mut(&binding.queue) {
            Some(queue) if !binding.is_fanout() || queue.bound => queue,
            _ => return Ok(SendOutcome::Unroutable),
        };

        queue.messages.push_back(body);
        drop(state);

        self.shared.notify.notify_waiters();
        Ok(SendOutcome::Routed)
    }

    async fn subscribe(&self, binding: &QueueBinding) -> Result<Box<dyn Subscription>, TransportError> {
        {
            let mut state = self.shared.state();
            let queue = state.queues.entry(binding.queue.clone()).or_default();
            if binding.is_fanout() {
                queue.bound = true;
            }
        }

        debug!("Subscribed to in-memory queue {}", binding.queue);

        Ok(Box::new(MemorySubscription {
            shared: self.shared.clone(),
            queue: binding.queue.clone(),
            prefetch: Arc::new(Semaphore::new(1)),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.shared.state();
        for queue in state.queues.values_mut() {
            queue.closed = true;
        }
        debug!(
            "In-memory broker closed: {} ack(s), {} nack(s), {} unsettled",
            state.acks,
            state.nacks,
            state.unacked.len()
        );
        drop(state);

        self.shared.notify.notify_waiters();
        Ok(())
    }
}

struct MemorySubscription {
    shared: Arc<Shared>,
    queue: String,
    prefetch: Arc<Semaphore>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_delivery(&mut self) -> Result<Option<RawDelivery>, TransportError> {
        // Held by the acker until the delivery is settled
        let permit = self
            .prefetch
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| TransportError::Consume { queue: self.queue.clone(), message: e.to_string() })?;

        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state();
                let queue = state.queues.entry(self.queue.clone()).or_default();

                if let Some(body) = queue.messages.pop_front() {
                    state.next_tag += 1;
                    let tag = state.next_tag;
                    state.unacked.insert(tag, (self.queue.clone(), body.clone()));

                    return Ok(Some(RawDelivery {
                        body,
                        acker: Box::new(MemoryAcker {
                            shared: self.shared.clone(),
                            tag,
                            _permit: permit,
                        }),
                    }));
                }

                if queue.closed {
                    return Ok(None);
                }
            }

            notified.await;
        }
    }

    async fn cancel(self: Box<Self>) -> Result<(), TransportError> {
        self.prefetch.close();
        Ok(())
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    tag: u64,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        let mut state = self.shared.state();
        state
            .unacked
            .remove(&self.tag)
            .ok_or_else(|| TransportError::Acknowledge(format!("unknown delivery tag {}", self.tag)))?;
        state.acks += 1;
        Ok(())
    }

    async fn nack(self: Box<Self>) -> Result<(), TransportError> {
        let mut state = self.shared.state();
        let (queue, body) = state
            .unacked
            .remove(&self.tag)
            .ok_or_else(|| TransportError::Acknowledge(format!("unknown delivery tag {}", self.tag)))?;
        state.nacks += 1;
        state.queues.entry(queue).or_default().messages.push_front(body);
        drop(state);

        self.shared.notify.notify_waiters();
        Ok(())
    }
}
