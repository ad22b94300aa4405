//! In-process fan-out
//!
//! One `tokio::sync::broadcast` channel per account topic, created on
//! first subscribe and dropped on the first publish after its last
//! receiver is gone. Publishing to a topic nobody listens on is not an
//! error: the event has been handed to the stream, there is just no
//! reader.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::trace;

use super::{EventPublisher, PublishError, StreamEvent, account_topic};
use crate::core_types::AccountId;

pub struct BroadcastHub {
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to one account's events (JSON encoded)
    pub fn subscribe(&self, account_id: AccountId) -> broadcast::Receiver<String> {
        let mut topics = match self.topics.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        topics
            .entry(account_topic(account_id))
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Send to a topic's receivers, pruning the topic if none are left
    fn send(&self, topic: &str, payload: String) -> usize {
        let mut topics = match self.topics.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(tx) = topics.get(topic) else {
            return 0;
        };
        if tx.receiver_count() == 0 {
            topics.remove(topic);
            return 0;
        }
        tx.send(payload).unwrap_or(0)
    }

    #[cfg(test)]
    fn topic_count(&self) -> usize {
        match self.topics.lock() {
            Ok(t) => t.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

#[async_trait]
impl EventPublisher for BroadcastHub {
    async fn publish(
        &self,
        account_id: AccountId,
        event: &StreamEvent,
    ) -> Result<(), PublishError> {
        let payload =
            serde_json::to_string(event).map_err(|e| PublishError::Encode(e.to_string()))?;
        let topic = account_topic(account_id);

        let receivers = self.send(&topic, payload);
        trace!(topic = %topic, event = event.event.as_str(), receivers, "Event published");
        Ok(())
    }
}
