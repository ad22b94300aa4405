//! Kafka / Redpanda transport
//!
//! One consumer group per topic with auto-commit disabled. Offsets are
//! committed only once a delivery is settled, so a crash mid-message means
//! the message is consumed again after restart.
//!
//! A nack re-produces the message to the tail of its topic with the
//! delivery count in the `x-delivery-attempt` header, then commits past the
//! original. After `max_deliveries` the message goes to `<topic><suffix>`
//! instead. If that produce fails the consumer seeks back to the original
//! offset so it is read again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, error, info, warn};

use super::{Acknowledger, Delivery, QueueError, Subscription};
use crate::config::ExecutionConfig;

pub const ATTEMPT_HEADER: &str = "x-delivery-attempt";

const PRODUCE_TIMEOUT: Duration = Duration::from_secs(5);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);
const RECV_BACKOFF: Duration = Duration::from_millis(500);

/// Where a nacked message goes next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Redeliver,
    DeadLetter,
}

fn route(attempt: u32, max_deliveries: u32) -> Route {
    if attempt >= max_deliveries.max(1) {
        Route::DeadLetter
    } else {
        Route::Redeliver
    }
}

/// Deliveries already made, from the attempt header (absent = none)
fn prior_attempts(header: Option<&[u8]>) -> u32 {
    header
        .and_then(|raw| std::str::from_utf8(raw).ok())
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

pub fn dead_letter_topic(topic: &str, suffix: &str) -> String {
    format!("{}{}", topic, suffix)
}

pub struct KafkaSubscription {
    topic: String,
    dead_letter_topic: String,
    max_deliveries: u32,
    consumer: Arc<StreamConsumer>,
    producer: FutureProducer,
}

impl KafkaSubscription {
    /// Join `<group_id>-<topic>` and subscribe to `topic`
    pub fn connect(config: &ExecutionConfig, topic: &str) -> Result<Self, QueueError> {
        let group_id = format!("{}-{}", config.group_id, topic);
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .create()
            .map_err(|e| QueueError::Transport(format!("consumer for {}: {}", topic, e)))?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| QueueError::Transport(format!("subscribe {}: {}", topic, e)))?;

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| QueueError::Transport(format!("producer for {}: {}", topic, e)))?;

        let dead_letter_topic = dead_letter_topic(topic, &config.dead_letter_suffix);
        info!(
            topic,
            group_id = %group_id,
            dead_letter_topic = %dead_letter_topic,
            brokers = %config.brokers,
            "Kafka subscription ready"
        );

        Ok(Self {
            topic: topic.to_string(),
            dead_letter_topic,
            max_deliveries: config.max_deliveries.max(1),
            consumer: Arc::new(consumer),
            producer,
        })
    }
}

#[async_trait]
impl Subscription for KafkaSubscription {
    fn queue(&self) -> &str {
        &self.topic
    }

    /// Broker errors are logged and retried; a Kafka subscription only
    /// ends when the consumer loop is shut down.
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            let msg = match self.consumer.recv().await {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(topic = %self.topic, error = %e, "Kafka receive failed");
                    tokio::time::sleep(RECV_BACKOFF).await;
                    continue;
                }
            };

            let header = msg.headers().and_then(|headers| {
                headers
                    .iter()
                    .find(|h| h.key == ATTEMPT_HEADER)
                    .and_then(|h| h.value)
            });
            let attempt = prior_attempts(header) + 1;
            let payload = msg.payload().map(<[u8]>::to_vec).unwrap_or_default();

            let acker = KafkaAck {
                topic: self.topic.clone(),
                dead_letter_topic: self.dead_letter_topic.clone(),
                partition: msg.partition(),
                offset: msg.offset(),
                key: msg.key().map(<[u8]>::to_vec),
                payload: payload.clone(),
                attempt,
                max_deliveries: self.max_deliveries,
                consumer: self.consumer.clone(),
                producer: self.producer.clone(),
            };
            return Some(Delivery::new(payload, attempt, Box::new(acker)));
        }
    }
}

struct KafkaAck {
    topic: String,
    dead_letter_topic: String,
    partition: i32,
    offset: i64,
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
    attempt: u32,
    max_deliveries: u32,
    consumer: Arc<StreamConsumer>,
    producer: FutureProducer,
}

impl KafkaAck {
    fn commit(&self) -> Result<(), QueueError> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&self.topic, self.partition, Offset::Offset(self.offset + 1))
            .map_err(|e| QueueError::Transport(e.to_string()))?;
        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| QueueError::Transport(e.to_string()))
    }

    async fn produce(&self, topic: &str) -> Result<(), QueueError> {
        let attempt = self.attempt.to_string();
        let headers = OwnedHeaders::new().insert(Header {
            key: ATTEMPT_HEADER,
            value: Some(attempt.as_str()),
        });
        let mut record = FutureRecord::<[u8], [u8]>::to(topic)
            .payload(&self.payload[..])
            .headers(headers);
        if let Some(key) = &self.key {
            record = record.key(&key[..]);
        }

        self.producer
            .send(record, PRODUCE_TIMEOUT)
            .await
            .map(|_| ())
            .map_err(|(e, _)| QueueError::Transport(format!("produce to {}: {}", topic, e)))
    }
}

#[async_trait]
impl Acknowledger for KafkaAck {
    async fn ack(self: Box<Self>) -> Result<(), QueueError> {
        self.commit()?;
        debug!(
            topic = %self.topic,
            partition = self.partition,
            offset = self.offset,
            "Message acknowledged"
        );
        Ok(())
    }

    async fn nack(self: Box<Self>) -> Result<(), QueueError> {
        let target = match route(self.attempt, self.max_deliveries) {
            Route::Redeliver => self.topic.clone(),
            Route::DeadLetter => {
                warn!(
                    topic = %self.topic,
                    offset = self.offset,
                    attempt = self.attempt,
                    "Message exhausted deliveries, dead-lettering"
                );
                self.dead_letter_topic.clone()
            }
        };

        if let Err(e) = self.produce(&target).await {
            error!(
                topic = %self.topic,
                offset = self.offset,
                error = %e,
                "Requeue failed, seeking back"
            );
            self.consumer
                .seek(
                    &self.topic,
                    self.partition,
                    Offset::Offset(self.offset),
                    SEEK_TIMEOUT,
                )
                .map_err(|seek| QueueError::Transport(format!("seek: {}", seek)))?;
            return Err(e);
        }

        debug!(
            topic = %self.topic,
            offset = self.offset,
            attempt = self.attempt,
            target = %target,
            "Message nacked"
        );
        self.commit()
    }
}
