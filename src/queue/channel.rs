//! In-process transport
//!
//! Unbounded mpsc channel with redelivery. A nacked message goes back to
//! the tail of the queue until it has been delivered `max_deliveries`
//! times, after which it is moved to the dead-letter list.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Acknowledger, Delivery, QueueError, Subscription};

struct Envelope {
    payload: Vec<u8>,
    attempt: u32,
}

type DeadLetters = Arc<Mutex<Vec<Vec<u8>>>>;

/// Publishing side. The subscription closes once every `ChannelQueue`
/// clone is dropped.
#[derive(Clone)]
pub struct ChannelQueue {
    name: String,
    tx: mpsc::UnboundedSender<Envelope>,
    dead_letters: DeadLetters,
}

impl ChannelQueue {
    pub fn new(name: impl Into<String>, max_deliveries: u32) -> (Self, ChannelSubscription) {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let dead_letters: DeadLetters = Arc::new(Mutex::new(Vec::new()));

        let subscription = ChannelSubscription {
            name: name.clone(),
            rx,
            requeue: tx.downgrade(),
            dead_letters: dead_letters.clone(),
            max_deliveries: max_deliveries.max(1),
        };
        let queue = Self {
            name,
            tx,
            dead_letters,
        };
        (queue, subscription)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn publish(&self, payload: impl Into<Vec<u8>>) -> Result<(), QueueError> {
        self.tx
            .send(Envelope {
                payload: payload.into(),
                attempt: 0,
            })
            .map_err(|_| QueueError::Closed(self.name.clone()))
    }

    /// Messages that exhausted their deliveries
    pub fn dead_letters(&self) -> Vec<Vec<u8>> {
        match self.dead_letters.lock() {
            Ok(dead) => dead.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

pub struct ChannelSubscription {
    name: String,
    rx: mpsc::UnboundedReceiver<Envelope>,
    requeue: mpsc::WeakUnboundedSender<Envelope>,
    dead_letters: DeadLetters,
    max_deliveries: u32,
}

#[async_trait]
impl Subscription for ChannelSubscription {
    fn queue(&self) -> &str {
        &self.name
    }

    async fn next(&mut self) -> Option<Delivery> {
        let envelope = self.rx.recv().await?;
        let attempt = envelope.attempt + 1;
        let acker = ChannelAck {
            queue: self.name.clone(),
            payload: envelope.payload.clone(),
            attempt,
            max_deliveries: self.max_deliveries,
            requeue: self.requeue.clone(),
            dead_letters: self.dead_letters.clone(),
        };
        Some(Delivery::new(envelope.payload, attempt, Box::new(acker)))
    }
}

struct ChannelAck {
    queue: String,
    payload: Vec<u8>,
    attempt: u32,
    max_deliveries: u32,
    requeue: mpsc::WeakUnboundedSender<Envelope>,
    dead_letters: DeadLetters,
}

impl ChannelAck {
    fn dead_letter(self) {
        warn!(
            queue = %self.queue,
            attempt = self.attempt,
            "Message exhausted deliveries, dead-lettering"
        );
        match self.dead_letters.lock() {
            Ok(mut dead) => dead.push(self.payload),
            Err(poisoned) => poisoned.into_inner().push(self.payload),
        }
    }
}

#[async_trait]
impl Acknowledger for ChannelAck {
    async fn ack(self: Box<Self>) -> Result<(), QueueError> {
        debug!(queue = %self.queue, attempt = self.attempt, "Message acknowledged");
        Ok(())
    }

    async fn nack(self: Box<Self>) -> Result<(), QueueError> {
        if self.attempt >= self.max_deliveries {
            self.dead_letter();
            return Ok(());
        }

        let Some(tx) = self.requeue.upgrade() else {
            let queue = self.queue.clone();
            self.dead_letter();
            return Err(QueueError::Closed(queue));
        };
        debug!(queue = %self.queue, attempt = self.attempt, "Message nacked, redelivering");
        tx.send(Envelope {
            payload: self.payload.clone(),
            attempt: self.attempt,
        })
        .map_err(|_| QueueError::Closed(self.queue.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ack_removes_message() {
        let (queue, mut sub) = ChannelQueue::new("executions", 3);
        queue.publish(b"one".to_vec()).unwrap();
        drop(queue);

        let d = sub.next().await.unwrap();
        assert_eq!(d.payload(), b"one");
        assert_eq!(d.attempt(), 1);
        d.ack().await.unwrap();

        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_nack_redelivers_then_dead_letters() {
        let (queue, mut sub) = ChannelQueue::new("executions", 2);
        queue.publish(b"poison".to_vec()).unwrap();

        let first = sub.next().await.unwrap();
        assert_eq!(first.attempt(), 1);
        first.nack().await.unwrap();

        let second = sub.next().await.unwrap();
        assert_eq!(second.attempt(), 2);
        second.nack().await.unwrap();

        assert_eq!(queue.dead_letters(), vec![b"poison".to_vec()]);
        drop(queue);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_publish_after_subscription_dropped_fails() {
        let (queue, sub) = ChannelQueue::new("cancel_rejections", 1);
        drop(sub);
        assert_eq!(
            queue.publish(b"x".to_vec()),
            Err(QueueError::Closed("cancel_rejections".to_string()))
        );
    }
}
