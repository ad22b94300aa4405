//! Message Transport Seam
//!
//! The reconciliation engines consume one [`Subscription`] each. Every
//! [`Delivery`] must be settled with [`Delivery::ack`] (processed, never
//! deliver again) or [`Delivery::nack`] (redeliver or dead-letter, at the
//! transport's discretion). Delivery is at-least-once.
//!
//! [`KafkaSubscription`] is the production transport; the in-process
//! `ChannelQueue` drives the tests.

#[cfg(test)]
pub mod channel;
pub mod kafka;

use async_trait::async_trait;
use thiserror::Error;

#[cfg(test)]
pub use channel::{ChannelQueue, ChannelSubscription};
pub use kafka::KafkaSubscription;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue {0} is closed")]
    Closed(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl QueueError {
    pub fn code(&self) -> &'static str {
        match self {
            QueueError::Closed(_) => "QUEUE_CLOSED",
            QueueError::Transport(_) => "QUEUE_TRANSPORT",
        }
    }
}

/// Transport-side settlement of one delivery
#[async_trait]
pub trait Acknowledger: Send {
    async fn ack(self: Box<Self>) -> Result<(), QueueError>;

    async fn nack(self: Box<Self>) -> Result<(), QueueError>;
}

/// One received message
pub struct Delivery {
    payload: Vec<u8>,
    /// 1 on first delivery
    attempt: u32,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(payload: Vec<u8>, attempt: u32, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            payload,
            attempt,
            acker,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub async fn ack(self) -> Result<(), QueueError> {
        self.acker.ack().await
    }

    pub async fn nack(self) -> Result<(), QueueError> {
        self.acker.nack().await
    }
}

/// Long-lived consumer bound to one queue
#[async_trait]
pub trait Subscription: Send {
    fn queue(&self) -> &str;

    /// Wait for the next message; `None` once the transport is closed
    async fn next(&mut self) -> Option<Delivery>;
}
