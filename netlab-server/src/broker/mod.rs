//! Message broker boundary
//!
//! The daemon consumes requests from named queues and publishes replies and
//! update events by routing key. [`LocalBroker`] is the in-process
//! implementation; remote producers reach it through the TCP [`bridge`].

pub mod bridge;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

pub use bridge::Bridge;

/// Capacity of each queue's delivery channel
const QUEUE_CAPACITY: usize = 64;

/// Capacity of the publish fan-out
const PUBLISH_CAPACITY: usize = 256;

/// A message taken from a queue
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub queue: String,
    /// Routing key the producer expects the reply on
    pub reply_to: Option<String>,
    pub payload: Bytes,
}

/// A message published by the daemon
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub routing_key: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("Queue {0} already has a consumer")]
    AlreadySubscribed(String),

    #[error("Queue {0} has no consumer")]
    NoConsumer(String),
}

/// Queue consumption and publishing
#[async_trait]
pub trait Broker: Send + Sync {
    /// Become the consumer of `queue`
    async fn subscribe(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, BrokerError>;

    /// Stop consuming `queue`; its receiver sees the end of the stream
    async fn unsubscribe(&self, queue: &str) -> Result<(), BrokerError>;

    async fn publish(&self, routing_key: &str, payload: Bytes) -> Result<(), BrokerError>;
}

/// In-process broker
#[derive(Debug)]
pub struct LocalBroker {
    queues: DashMap<String, mpsc::Sender<Delivery>>,
    published: broadcast::Sender<Published>,
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBroker {
    pub fn new() -> Self {
        let (published, _) = broadcast::channel(PUBLISH_CAPACITY);
        Self {
            queues: DashMap::new(),
            published,
        }
    }

    /// Hand a message to the consumer of `queue`
    pub async fn deliver(
        &self,
        queue: &str,
        reply_to: Option<String>,
        payload: Bytes,
    ) -> Result<(), BrokerError> {
        let sender = self
            .queues
            .get(queue)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BrokerError::NoConsumer(queue.to_string()))?;

        let delivery = Delivery {
            queue: queue.to_string(),
            reply_to,
            payload,
        };
        sender
            .send(delivery)
            .await
            .map_err(|_| BrokerError::NoConsumer(queue.to_string()))?;
        trace!(queue, "Delivered message");
        Ok(())
    }

    /// Observe everything published from now on
    pub fn watch(&self) -> broadcast::Receiver<Published> {
        self.published.subscribe()
    }

    #[cfg(test)]
    pub fn has_consumer(&self, queue: &str) -> bool {
        self.queues.contains_key(queue)
    }
}

#[async_trait]
impl Broker for LocalBroker {
    async fn subscribe(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, BrokerError> {
        match self.queues.entry(queue.to_string()) {
            Entry::Occupied(_) => Err(BrokerError::AlreadySubscribed(queue.to_string())),
            Entry::Vacant(entry) => {
                let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
                entry.insert(tx);
                debug!(queue, "Queue subscribed");
                Ok(rx)
            }
        }
    }

    async fn unsubscribe(&self, queue: &str) -> Result<(), BrokerError> {
        match self.queues.remove(queue) {
            Some(_) => {
                debug!(queue, "Queue unsubscribed");
                Ok(())
            }
            None => Err(BrokerError::NoConsumer(queue.to_string())),
        }
    }

    async fn publish(&self, routing_key: &str, payload: Bytes) -> Result<(), BrokerError> {
        let message = Published {
            routing_key: routing_key.to_string(),
            payload,
        };
        // Nobody listening is fine; the message is simply gone
        if self.published.send(message).is_err() {
            trace!(routing_key, "Published with no observers");
        }
        Ok(())
    }
}
